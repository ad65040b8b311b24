//! Built-in backends.
//!
//! - `host`: process heap memory
//! - `shared` (unix): file-backed shared mappings that can be exported to
//!   other processes

pub mod host;
#[cfg(unix)]
pub mod shared;

use std::sync::Arc;

use crate::core::capability::CapabilityTag;
use crate::core::error::Result;
use crate::core::registry::ProviderRegistry;

pub use host::HostOps;
#[cfg(unix)]
pub use shared::SharedOps;

/// Fallback when the OS page size cannot be queried.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// The system page size.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Round `size` up to a multiple of `page`, which must be a power of two.
pub(crate) fn round_to_page(size: usize, page: usize) -> Option<usize> {
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

/// Register the built-in backends with `registry`: host first, then shared.
pub fn register_builtin(registry: &ProviderRegistry) -> Result<()> {
    registry.register(CapabilityTag::Host, Arc::new(HostOps::new()))?;
    #[cfg(unix)]
    registry.register(CapabilityTag::Shared, Arc::new(SharedOps::new()))?;
    Ok(())
}
