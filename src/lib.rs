//! unimem - a backend-agnostic memory provider framework
//!
//! This crate lets a process obtain memory from heterogeneous sources (host
//! RAM, shared memory, accelerator memory behind loadable adapters) through
//! one handle-based interface. It provides the provider registry, dispatch
//! layer, cross-process IPC handles and adapter discovery.

pub mod core;
pub mod ipc;
pub mod loader;
pub mod providers;
pub mod util;

/// Test utilities and scripted backends for unimem unit tests.
///
/// This module is only available when compiling with `--cfg test`. It
/// provides in-process backends with scripted behavior and a mock library
/// loader.
#[cfg(test)]
pub mod test_support;

pub use crate::core::{
    capability::{CapabilityTag, ProviderConfig},
    contract::{MemoryProvider, ProviderOps, CONTRACT_VERSION},
    error::{NativeError, ProviderError, Result, ResultCode},
    last_error::{last_failed_provider, take_last_failed_provider, FailedProvider},
    provider::{Provider, ProviderId},
    registry::{create_provider, ProviderRegistry},
};
pub use ipc::IpcHandle;
pub use loader::LoaderContext;
pub use util::config::Config;

use loader::{DylibLoader, LibraryLoader, LoaderOptions};

/// Initialize the framework: the global registry, the built-in backends and
/// every adapter family in `config` that loads.
///
/// Calling it again is harmless; backends already registered are skipped.
pub fn init(config: &Config) -> Result<LoaderContext> {
    init_with_loader(config, &DylibLoader)
}

/// [`init`] with a custom library loader.
pub fn init_with_loader(config: &Config, loader: &dyn LibraryLoader) -> Result<LoaderContext> {
    let registry = crate::core::registry::init_registry();

    if !registry.contains(&CapabilityTag::Host) {
        providers::register_builtin(&registry)?;
    }

    let mut options = LoaderOptions::from_config(&config.loader);
    options
        .families
        .retain(|family| !registry.contains(&CapabilityTag::adapter(&family.name)));

    let context = loader::discover_and_register(&options, loader, &registry)?;
    tracing::debug!(
        "unimem initialized: {} backends, {} adapters",
        registry.len(),
        context.adapters().len()
    );
    Ok(context)
}

/// Tear down the global registry. Live providers keep working.
pub fn shutdown() -> bool {
    crate::core::registry::shutdown_registry()
}
