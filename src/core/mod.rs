//! Core provider framework.
//!
//! - Error taxonomy and result codes
//! - Capability tags and provider configuration
//! - The backend contract (`ProviderOps`, `MemoryProvider`)
//! - Provider registry, instances and dispatch
//! - Per-thread last-error slot and the allocation tracker

pub mod capability;
pub mod contract;
pub mod error;
pub mod last_error;
pub mod provider;
pub mod registry;
pub(crate) mod tracker;

pub use capability::{CapabilityTag, ProviderConfig};
pub use contract::{MemoryProvider, ProviderOps, CONTRACT_VERSION};
pub use error::{NativeError, ProviderError, Result, ResultCode};
pub use last_error::{last_failed_provider, take_last_failed_provider, FailedProvider};
pub use provider::{Provider, ProviderId};
pub use registry::{
    create_provider, global_registry, init_registry, register_provider, shutdown_registry,
    BackendDescriptor, ProviderRegistry,
};
