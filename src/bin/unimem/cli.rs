//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// unimem - inspect memory providers and adapters
#[derive(Parser)]
#[command(name = "unimem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to .unimem/config.toml and ~/.unimem/config.toml)
    #[arg(long, global = true, env = "UNIMEM_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered backends
    Providers(ProvidersArgs),

    /// Show adapter discovery results
    Adapters,

    /// Create a provider and exercise it
    Probe(ProbeArgs),

    /// Open an IPC handle exported by another process
    #[command(hide = true)]
    IpcOpen(IpcOpenArgs),
}

#[derive(Args)]
pub struct ProvidersArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ProbeArgs {
    /// Capability tag (host, shared, accelerator, adapter:<name>)
    #[arg(long, default_value = "host")]
    pub tag: String,

    /// Device name to match
    #[arg(long)]
    pub device: Option<String>,

    /// Allocation size in bytes
    #[arg(long, default_value_t = 4096)]
    pub size: usize,

    /// Allocation alignment (0 for the backend default)
    #[arg(long, default_value_t = 0)]
    pub align: usize,
}

#[derive(Args)]
pub struct IpcOpenArgs {
    /// File holding the encoded handle
    #[arg(long)]
    pub handle: PathBuf,

    /// Capability tag of the importing backend
    #[arg(long, default_value = "shared")]
    pub tag: String,

    /// Text to write at the start of the mapping before closing it
    #[arg(long)]
    pub write: Option<String>,
}
