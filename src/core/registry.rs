//! Provider registry - capability matching and instance creation.
//!
//! The registry is an append-only, ordered list of backend descriptors.
//! Lookups use a first-match policy: registration order is the priority.
//! Duplicate registrations are allowed and are simply considered in order.
//!
//! A process-wide registry is available through [`init_registry`],
//! [`register_provider`], [`create_provider`] and [`shutdown_registry`]. It is
//! created lazily on first registration and must be torn down explicitly.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::capability::{CapabilityTag, ProviderConfig};
use crate::core::contract::{check_version, ProviderOps};
use crate::core::error::{ProviderError, Result};
use crate::core::provider::Provider;

/// A registered backend: capability tag plus its operations.
#[derive(Clone)]
pub struct BackendDescriptor {
    tag: CapabilityTag,
    ops: Arc<dyn ProviderOps>,
}

impl BackendDescriptor {
    pub fn new(tag: CapabilityTag, ops: Arc<dyn ProviderOps>) -> Self {
        BackendDescriptor { tag, ops }
    }

    pub fn tag(&self) -> &CapabilityTag {
        &self.tag
    }

    pub fn ops(&self) -> &dyn ProviderOps {
        self.ops.as_ref()
    }

    pub fn name(&self) -> &str {
        self.ops.name()
    }

    pub fn version(&self) -> semver::Version {
        self.ops.version()
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("tag", &self.tag)
            .field("name", &self.ops.name())
            .field("version", &self.ops.version())
            .finish()
    }
}

/// Ordered, append-only table of backend descriptors.
///
/// Appends take the write lock, scans take the read lock, so a concurrent
/// lookup either sees a descriptor fully registered or not at all.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<BackendDescriptor>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ProviderRegistry {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend under `tag`.
    ///
    /// Fails with `ContractVersionMismatch` if the backend was built against
    /// a different contract; nothing is added in that case.
    pub fn register(&self, tag: CapabilityTag, ops: Arc<dyn ProviderOps>) -> Result<()> {
        check_version(ops.as_ref())?;

        tracing::debug!("registering provider `{}` for {}", ops.name(), tag);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BackendDescriptor::new(tag, ops));
        Ok(())
    }

    /// Create an instance of the first registered backend that matches
    /// `config.tag`, accepts the device, and initializes successfully.
    ///
    /// Fails with `RegistryUninitialized` if nothing was ever registered and
    /// `NoCapableBackend` if no descriptor matches. If candidates matched but
    /// all failed to initialize, the last initialization error is returned.
    pub fn create_from_config(&self, config: &ProviderConfig) -> Result<Provider> {
        // Snapshot so backend code never runs under the registry lock.
        let candidates: Vec<BackendDescriptor> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if entries.is_empty() {
                return Err(ProviderError::RegistryUninitialized);
            }
            entries
                .iter()
                .filter(|desc| desc.tag == config.tag)
                .cloned()
                .collect()
        };

        let mut last_err = None;
        for desc in candidates {
            if !desc.ops.supports_device(config) {
                tracing::trace!("provider `{}` does not support {:?}", desc.name(), config.device);
                continue;
            }

            // Descriptors are version-checked on registration; check again in
            // case a backend reports a different version at creation time.
            if let Err(err) = check_version(desc.ops()) {
                last_err = Some(err);
                continue;
            }

            match desc.ops.initialize(config) {
                Ok(backend) => return Ok(Provider::new(desc.tag.clone(), backend)),
                Err(err) => {
                    tracing::debug!("provider `{}` failed to initialize: {}", desc.name(), err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ProviderError::NoCapableBackend {
            tag: config.tag.to_string(),
        }))
    }

    /// Snapshot of all descriptors in registration order.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any descriptor is registered under `tag`.
    pub fn contains(&self, tag: &CapabilityTag) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|desc| &desc.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("entries", &self.descriptors())
            .finish()
    }
}

// =============================================================================
// Process-wide registry
// =============================================================================

static GLOBAL: RwLock<Option<Arc<ProviderRegistry>>> = RwLock::new(None);

/// Create the process-wide registry if it does not exist yet.
pub fn init_registry() -> Arc<ProviderRegistry> {
    let mut global = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    global
        .get_or_insert_with(|| {
            tracing::debug!("initializing global provider registry");
            Arc::new(ProviderRegistry::new())
        })
        .clone()
}

/// The process-wide registry, if initialized.
pub fn global_registry() -> Option<Arc<ProviderRegistry>> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Register a backend with the process-wide registry, creating it if needed.
pub fn register_provider(tag: CapabilityTag, ops: Arc<dyn ProviderOps>) -> Result<()> {
    init_registry().register(tag, ops)
}

/// Create a provider from the process-wide registry.
pub fn create_provider(config: &ProviderConfig) -> Result<Provider> {
    global_registry()
        .ok_or(ProviderError::RegistryUninitialized)?
        .create_from_config(config)
}

/// Tear the process-wide registry down. Returns whether one existed.
///
/// Live providers are unaffected; they own everything they need.
pub fn shutdown_registry() -> bool {
    let registry = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(registry) = &registry {
        tracing::debug!(
            "shutting down global provider registry ({} descriptors)",
            registry.len()
        );
    }
    registry.is_some()
}
