//! Provider instances and call dispatch.
//!
//! A [`Provider`] is the only strong owner of a live backend instance. Every
//! operation is forwarded to the backend; failures are additionally recorded
//! in the calling thread's last-error slot.
//!
//! Other parts of the framework (the last-error slot, the IPC tables) refer
//! to providers by [`ProviderId`] and resolve them through the live instance
//! table, so they never keep a destroyed provider alive and never reach one
//! after destruction.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};

use crate::core::capability::CapabilityTag;
use crate::core::contract::{validate_layout, MemoryProvider};
use crate::core::error::{NativeError, ProviderError, Result};
use crate::core::{last_error, tracker};
use crate::ipc;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Live provider instances, keyed by id.
static INSTANCES: LazyLock<RwLock<HashMap<ProviderId, Weak<ProviderInner>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Process-unique identity of a provider instance. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(u64);

impl ProviderId {
    pub(crate) fn next() -> Self {
        ProviderId(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether the instance with this id is still live.
    pub fn is_live(&self) -> bool {
        lookup(*self).is_some()
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider#{}", self.0)
    }
}

/// Resolve a live instance by id.
pub(crate) fn lookup(id: ProviderId) -> Option<Arc<ProviderInner>> {
    INSTANCES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .and_then(Weak::upgrade)
}

pub(crate) struct ProviderInner {
    id: ProviderId,
    tag: CapabilityTag,
    backend: Box<dyn MemoryProvider>,
}

impl ProviderInner {
    pub(crate) fn id(&self) -> ProviderId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        self.backend.name()
    }

    pub(crate) fn backend(&self) -> &dyn MemoryProvider {
        self.backend.as_ref()
    }

    /// Record a failing result in the last-error slot and pass it through.
    pub(crate) fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::trace!(provider = %self.id, error = %err, "provider call failed");
            last_error::record(self, err.code());
        }
        result
    }
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        INSTANCES
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        let leaked = tracker::forget_provider(self.id);
        if leaked > 0 {
            tracing::warn!(
                "provider {} ({}) destroyed with {} live allocation(s)",
                self.id,
                self.backend.name(),
                leaked
            );
        }
        let (exports, imports) = ipc::forget_provider(self.id);
        if exports + imports > 0 {
            tracing::warn!(
                "provider {} ({}) destroyed with {} export(s) and {} import(s) outstanding",
                self.id,
                self.backend.name(),
                exports,
                imports
            );
        }
        tracing::debug!("finalizing provider {} ({})", self.id, self.backend.name());
        // `backend` drops after this, running the backend's teardown.
    }
}

/// Opaque handle to a live provider instance.
///
/// Not `Clone`: each instance has exactly one owner and is finalized exactly
/// once, on [`Provider::destroy`] or drop.
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Wrap a freshly initialized backend.
    pub(crate) fn new(tag: CapabilityTag, backend: Box<dyn MemoryProvider>) -> Self {
        let inner = Arc::new(ProviderInner {
            id: ProviderId::next(),
            tag,
            backend,
        });
        INSTANCES
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(inner.id, Arc::downgrade(&inner));
        tracing::debug!("created provider {} ({})", inner.id, inner.name());
        Provider { inner }
    }

    pub fn id(&self) -> ProviderId {
        self.inner.id
    }

    /// Capability tag of the descriptor this instance was created from.
    pub fn tag(&self) -> &CapabilityTag {
        &self.inner.tag
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub(crate) fn inner(&self) -> &ProviderInner {
        &self.inner
    }

    /// Allocate `size` bytes.
    ///
    /// `alignment` must be zero (backend default) or a power of two no larger
    /// than the backend's maximum.
    pub fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let result = validate_layout(size, alignment)
            .and_then(|()| self.inner.backend.alloc(size, alignment));
        let ptr = self.inner.check(result)?;
        tracker::insert(ptr, size, self.inner.id);
        Ok(ptr)
    }

    /// Free an allocation made by this provider.
    ///
    /// Pointers this provider did not hand out are rejected before reaching
    /// the backend. `size` is forwarded; backends reject a mismatch.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let tracked = self.inner.check(tracker::take(ptr, self.inner.id))?;
        let result = self.inner.check(self.inner.backend.free(ptr, size));
        if result.is_err() {
            tracker::insert(ptr, tracked.size, self.inner.id);
        }
        result
    }

    /// The backend's own description of its most recent failure.
    pub fn last_native_error(&self) -> NativeError {
        self.inner.backend.last_native_error()
    }

    pub fn recommended_page_size(&self, size: usize) -> Result<usize> {
        self.inner
            .check(self.inner.backend.recommended_page_size(size))
    }

    pub fn min_page_size(&self, ptr: Option<NonNull<u8>>) -> Result<usize> {
        self.inner.check(self.inner.backend.min_page_size(ptr))
    }

    pub fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let result = tracker::check_range(ptr, size, self.inner.id)
            .and_then(|()| self.inner.backend.purge_lazy(ptr, size));
        self.inner.check(result)
    }

    pub fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let result = tracker::check_range(ptr, size, self.inner.id)
            .and_then(|()| self.inner.backend.purge_force(ptr, size));
        self.inner.check(result)
    }

    /// Tear the instance down, running the backend's teardown exactly once.
    pub fn destroy(self) {
        tracing::debug!("destroying provider {}", self.inner.id);
        drop(self);
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.inner.id)
            .field("tag", &self.inner.tag)
            .field("name", &self.inner.name())
            .finish()
    }
}

/// Reject operations that reach a provider after it was destroyed.
pub(crate) fn live(id: ProviderId) -> Result<Arc<ProviderInner>> {
    lookup(id).ok_or_else(|| ProviderError::invalid_state(format!("{} has been destroyed", id)))
}
