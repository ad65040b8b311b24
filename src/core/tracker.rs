//! Process-wide table of live allocations.
//!
//! Maps each allocation's base address to its size and owning provider so
//! that a bare pointer can be resolved back to the provider and extent it
//! belongs to (for `free` validation and IPC export).

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{LazyLock, PoisonError, RwLock};

use crate::core::error::{ProviderError, Result};
use crate::core::provider::ProviderId;

static ALLOCATIONS: LazyLock<RwLock<BTreeMap<usize, TrackedAlloc>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// A live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackedAlloc {
    pub base: usize,
    pub size: usize,
    pub provider: ProviderId,
}

impl TrackedAlloc {
    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.size)
    }
}

pub(crate) fn insert(ptr: NonNull<u8>, size: usize, provider: ProviderId) {
    let base = ptr.as_ptr() as usize;
    ALLOCATIONS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(base, TrackedAlloc { base, size, provider });
}

/// Find the allocation containing `ptr`, which may be an interior pointer.
pub(crate) fn find(ptr: NonNull<u8>) -> Option<TrackedAlloc> {
    let addr = ptr.as_ptr() as usize;
    let table = ALLOCATIONS.read().unwrap_or_else(PoisonError::into_inner);
    table
        .range(..=addr)
        .next_back()
        .map(|(_, alloc)| *alloc)
        .filter(|alloc| alloc.contains(addr, 1))
}

/// Remove the allocation based at `ptr` if `provider` owns it.
pub(crate) fn take(ptr: NonNull<u8>, provider: ProviderId) -> Result<TrackedAlloc> {
    let base = ptr.as_ptr() as usize;
    let mut table = ALLOCATIONS.write().unwrap_or_else(PoisonError::into_inner);
    match table.get(&base).copied() {
        Some(alloc) if alloc.provider == provider => {
            table.remove(&base);
            Ok(alloc)
        }
        Some(alloc) => Err(ProviderError::invalid_argument(format!(
            "pointer {:#x} belongs to {}, not {}",
            base, alloc.provider, provider
        ))),
        None => Err(ProviderError::invalid_argument(format!(
            "pointer {:#x} is not a live allocation of {}",
            base, provider
        ))),
    }
}

/// Check that `[ptr, ptr + size)` lies inside one allocation of `provider`.
pub(crate) fn check_range(ptr: NonNull<u8>, size: usize, provider: ProviderId) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    match find(ptr) {
        Some(alloc) if alloc.provider == provider && alloc.contains(addr, size) => Ok(()),
        _ => Err(ProviderError::invalid_argument(format!(
            "range {:#x}+{} is not inside a live allocation of {}",
            addr, size, provider
        ))),
    }
}

/// Drop every entry of a destroyed provider. Returns how many were dropped.
pub(crate) fn forget_provider(provider: ProviderId) -> usize {
    let mut table = ALLOCATIONS.write().unwrap_or_else(PoisonError::into_inner);
    let before = table.len();
    table.retain(|_, alloc| alloc.provider != provider);
    before - table.len()
}
