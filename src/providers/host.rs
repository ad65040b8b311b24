//! Host heap backend.
//!
//! Allocations come from the global allocator. The backend keeps the layout
//! of every live block so `free` can validate the caller's size, or derive
//! it when the caller passes 0.
//!
//! Parameters:
//! - `max_alignment`: largest accepted alignment (default: page size)

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use crate::core::capability::ProviderConfig;
use crate::core::contract::{MemoryProvider, ProviderOps, CONTRACT_VERSION};
use crate::core::error::{NativeError, ProviderError, Result};
use crate::providers::page_size;

const NAME: &str = "host";

/// Alignment used when the caller passes 0.
const DEFAULT_ALIGNMENT: usize = 16;

/// Native error codes reported by the host backend.
mod code {
    pub const ALIGNMENT: i32 = 1;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const SIZE_MISMATCH: i32 = 3;
    pub const UNKNOWN_POINTER: i32 = 4;
}

/// Descriptor for the host heap backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOps;

impl HostOps {
    pub fn new() -> Self {
        HostOps
    }
}

impl ProviderOps for HostOps {
    fn version(&self) -> semver::Version {
        CONTRACT_VERSION
    }

    fn name(&self) -> &str {
        NAME
    }

    /// The host heap has no devices; a device name never matches.
    fn supports_device(&self, config: &ProviderConfig) -> bool {
        config.device.is_none() && config.pci.is_none()
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<Box<dyn MemoryProvider>> {
        let page = page_size();
        let max_alignment = match config.param_u64("max_alignment") {
            Some(v) => {
                let v = usize::try_from(v)
                    .map_err(|_| ProviderError::invalid_argument("max_alignment out of range"))?;
                if !v.is_power_of_two() {
                    return Err(ProviderError::invalid_argument(format!(
                        "max_alignment {} is not a power of two",
                        v
                    )));
                }
                v
            }
            None => page,
        };
        Ok(Box::new(HostProvider::new(max_alignment, page)))
    }
}

/// A live host heap instance.
#[derive(Debug)]
pub struct HostProvider {
    max_alignment: usize,
    page_size: usize,
    live: Mutex<HashMap<usize, Layout>>,
    last_error: Mutex<NativeError>,
}

impl HostProvider {
    fn new(max_alignment: usize, page_size: usize) -> Self {
        HostProvider {
            max_alignment,
            page_size,
            live: Mutex::new(HashMap::new()),
            last_error: Mutex::new(NativeError::default()),
        }
    }

    fn fail(&self, code: i32, message: String) -> ProviderError {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            NativeError::new(message.clone(), code);
        ProviderError::backend(NAME, message)
    }
}

impl MemoryProvider for HostProvider {
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        if alignment > self.max_alignment {
            return Err(self.fail(
                code::ALIGNMENT,
                format!(
                    "alignment {} exceeds maximum {}",
                    alignment, self.max_alignment
                ),
            ));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| self.fail(code::ALIGNMENT, e.to_string()))?;

        // SAFETY: size is non-zero, checked by the dispatch layer.
        let Some(ptr) = NonNull::new(unsafe { std::alloc::alloc(layout) }) else {
            self.fail(code::OUT_OF_MEMORY, format!("cannot allocate {} bytes", size));
            return Err(ProviderError::OutOfHostMemory);
        };
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(layout) = live.get(&addr).copied() else {
            drop(live);
            return Err(self.fail(
                code::UNKNOWN_POINTER,
                format!("{:#x} was not allocated here", addr),
            ));
        };
        if size != 0 && size != layout.size() {
            drop(live);
            self.fail(
                code::SIZE_MISMATCH,
                format!("size {} does not match allocation size {}", size, layout.size()),
            );
            return Err(ProviderError::invalid_argument(format!(
                "free size {} does not match allocation size {}",
                size,
                layout.size()
            )));
        }
        live.remove(&addr);
        // SAFETY: allocated by `alloc` with exactly this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn last_native_error(&self) -> NativeError {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn recommended_page_size(&self, _size: usize) -> Result<usize> {
        Ok(self.page_size)
    }

    fn min_page_size(&self, _ptr: Option<NonNull<u8>>) -> Result<usize> {
        Ok(self.page_size)
    }

    /// Heap memory cannot be handed back piecemeal; the hint is accepted.
    fn purge_lazy(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Ok(())
    }

    fn purge_force(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Err(ProviderError::unsupported(NAME, "purge_force"))
    }

    fn name(&self) -> &str {
        NAME
    }
}

impl Drop for HostProvider {
    fn drop(&mut self) {
        let live = std::mem::take(self.live.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (addr, layout) in live {
            // SAFETY: every entry is a live block allocated with its layout.
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}
