//! The backend contract every memory provider implements.
//!
//! A backend is split in two halves:
//!
//! - [`ProviderOps`] is the descriptor stored in the registry. It knows the
//!   contract version it was built against, can tell whether it serves a
//!   given configuration, and constructs live instances.
//! - [`MemoryProvider`] is a live instance. It owns all backend-private
//!   state; teardown is its `Drop` impl.

use std::ptr::NonNull;

use crate::core::capability::ProviderConfig;
use crate::core::error::{NativeError, ProviderError, Result};

/// Contract version this framework was compiled against.
///
/// Descriptors must report exactly this version to be registered.
pub const CONTRACT_VERSION: semver::Version = semver::Version::new(0, 1, 0);

/// Descriptor half of a backend: matching and construction.
pub trait ProviderOps: Send + Sync {
    /// Contract version the backend implements.
    fn version(&self) -> semver::Version;

    /// Backend name.
    fn name(&self) -> &str;

    /// Device-specific matching beyond the capability tag.
    fn supports_device(&self, config: &ProviderConfig) -> bool;

    /// Build a live instance.
    ///
    /// Either returns a fully initialized instance or an error; any state
    /// acquired before the failure must be released before returning.
    fn initialize(&self, config: &ProviderConfig) -> Result<Box<dyn MemoryProvider>>;
}

/// Instance half of a backend: the allocation operations.
///
/// Methods take `&self`; a backend that is not internally thread-safe must
/// serialize access itself.
pub trait MemoryProvider: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment` (0 means the backend default).
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>>;

    /// Free an allocation. `size` must be the size passed to `alloc`.
    fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()>;

    /// Most recent backend-native failure.
    fn last_native_error(&self) -> NativeError;

    /// Page size the backend recommends for an allocation of `size` bytes.
    fn recommended_page_size(&self, size: usize) -> Result<usize>;

    /// Smallest page size backing `ptr`, or the backend minimum when `None`.
    fn min_page_size(&self, ptr: Option<NonNull<u8>>) -> Result<usize>;

    /// Hint that a range may be discarded.
    fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> Result<()>;

    /// Discard the physical pages behind a range.
    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> Result<()>;

    /// Instance name.
    fn name(&self) -> &str;

    /// Produce an export token for the allocation at `ptr` of `size` bytes.
    fn ipc_export(&self, _ptr: NonNull<u8>, _size: usize) -> Result<Vec<u8>> {
        Err(ProviderError::unsupported(self.name(), "ipc_export"))
    }

    /// Invalidate a token produced by `ipc_export`.
    fn ipc_release(&self, _token: &[u8]) -> Result<()> {
        Err(ProviderError::unsupported(self.name(), "ipc_release"))
    }

    /// Map a token into this process. Returns the base pointer and mapped length.
    fn ipc_open(&self, _token: &[u8]) -> Result<(NonNull<u8>, usize)> {
        Err(ProviderError::unsupported(self.name(), "ipc_open"))
    }

    /// Unmap a mapping returned by `ipc_open`.
    fn ipc_close(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Err(ProviderError::unsupported(self.name(), "ipc_close"))
    }
}

/// Reject descriptors built against a different contract.
pub fn check_version(ops: &dyn ProviderOps) -> Result<()> {
    let found = ops.version();
    if found != CONTRACT_VERSION {
        return Err(ProviderError::ContractVersionMismatch {
            name: ops.name().to_string(),
            expected: CONTRACT_VERSION,
            found,
        });
    }
    Ok(())
}

/// Check the alignment rules shared by every backend.
///
/// `0` selects the backend default; anything else must be a power of two.
pub fn validate_layout(size: usize, alignment: usize) -> Result<()> {
    if size == 0 {
        return Err(ProviderError::invalid_argument("allocation size must be non-zero"));
    }
    if alignment != 0 && !alignment.is_power_of_two() {
        return Err(ProviderError::invalid_argument(format!(
            "alignment {} is not a power of two",
            alignment
        )));
    }
    Ok(())
}
