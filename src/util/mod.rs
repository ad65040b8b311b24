//! Shared utilities

pub mod config;
pub mod env;

pub use config::Config;
