//! Cross-process handles for live allocations.
//!
//! The producer turns a pointer into an [`IpcHandle`] with [`export`] and
//! invalidates it with [`release`]. A consumer maps the handle with
//! [`import`] and drops the mapping with [`unimport`]. Handles travel as
//! bytes ([`IpcHandle::to_bytes`]); the channel is up to the caller.
//!
//! Contract violations (double release, closing a pointer that was never
//! imported) are reported as errors, never undefined behavior.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::error::{ProviderError, Result};
use crate::core::provider::{self, Provider, ProviderId};
use crate::core::tracker;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outstanding exports of this process, by handle id. Released handles are
/// removed; ids below `NEXT_HANDLE_ID` that are missing were released.
static EXPORTS: LazyLock<Mutex<HashMap<u64, ExportRecord>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Live imports, by the pointer handed to the consumer.
static IMPORTS: LazyLock<Mutex<HashMap<usize, ImportRecord>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct ExportRecord {
    provider: ProviderId,
    token: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ImportRecord {
    provider: ProviderId,
    base: usize,
    len: usize,
}

/// A transferable description of an exported allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcHandle {
    id: u64,
    producer_pid: u32,
    provider: String,
    size: usize,
    offset: usize,
    token: Vec<u8>,
}

impl IpcHandle {
    /// Handle id, unique within the producing process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process that exported the handle.
    pub fn producer_pid(&self) -> u32 {
        self.producer_pid
    }

    /// Name of the backend that can open the token.
    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    /// Size of the exported allocation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the exported pointer inside its allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Backend-defined export token.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Encode for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ProviderError::invalid_argument(format!("cannot encode handle: {}", e)))
    }

    /// Decode a handle received from another process.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProviderError::invalid_argument(format!("malformed IPC handle: {}", e)))
    }

    /// Length of the encoded form.
    pub fn encoded_len(&self) -> Result<usize> {
        self.to_bytes().map(|b| b.len())
    }
}

/// Export the allocation containing `ptr`.
///
/// `ptr` may point inside an allocation; the handle records the offset.
/// Backends without IPC support fail with `Unsupported`.
pub fn export(ptr: NonNull<u8>) -> Result<IpcHandle> {
    let alloc = tracker::find(ptr).ok_or_else(|| {
        ProviderError::invalid_argument(format!("{:p} is not a live allocation", ptr))
    })?;
    let inner = provider::live(alloc.provider)?;
    let base = NonNull::new(alloc.base as *mut u8)
        .ok_or_else(|| ProviderError::invalid_argument("null allocation base"))?;

    let token = inner.check(inner.backend().ipc_export(base, alloc.size))?;

    let handle = IpcHandle {
        id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        producer_pid: std::process::id(),
        provider: inner.name().to_string(),
        size: alloc.size,
        offset: ptr.as_ptr() as usize - alloc.base,
        token: token.clone(),
    };
    EXPORTS.lock().unwrap_or_else(PoisonError::into_inner).insert(
        handle.id,
        ExportRecord {
            provider: alloc.provider,
            token,
        },
    );
    tracing::debug!(
        "exported {} bytes from {} as handle {}",
        handle.size,
        alloc.provider,
        handle.id
    );
    Ok(handle)
}

/// Invalidate an exported handle. Producer side; exactly once per export.
pub fn release(handle: &IpcHandle) -> Result<()> {
    if handle.producer_pid != std::process::id() {
        return Err(ProviderError::invalid_argument(format!(
            "handle {} was exported by process {}",
            handle.id, handle.producer_pid
        )));
    }

    let record = {
        let mut exports = EXPORTS.lock().unwrap_or_else(PoisonError::into_inner);
        match exports.get(&handle.id).map(|record| record.token == handle.token) {
            Some(false) => {
                return Err(ProviderError::invalid_argument(format!(
                    "handle {} does not match its export",
                    handle.id
                )))
            }
            // Claimed here so a concurrent release sees it as already released.
            Some(true) => exports.remove(&handle.id),
            None => None,
        }
    };
    let Some(record) = record else {
        return Err(unknown_handle(handle.id));
    };

    // A destroyed producer took its exports with it.
    let inner = provider::live(record.provider)?;
    if let Err(err) = inner.check(inner.backend().ipc_release(&handle.token)) {
        EXPORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id, record);
        return Err(err);
    }
    tracing::debug!("released handle {}", handle.id);
    Ok(())
}

/// Error for a handle id with no outstanding export.
fn unknown_handle(id: u64) -> ProviderError {
    if id != 0 && id < NEXT_HANDLE_ID.load(Ordering::Relaxed) {
        ProviderError::invalid_state(format!("handle {} was already released", id))
    } else {
        ProviderError::invalid_argument(format!("handle {} was not exported by this process", id))
    }
}

/// Drop every export and import record of a destroyed provider.
///
/// Returns how many exports and imports were still outstanding.
pub(crate) fn forget_provider(provider: ProviderId) -> (usize, usize) {
    let mut exports = EXPORTS.lock().unwrap_or_else(PoisonError::into_inner);
    let before = exports.len();
    exports.retain(|_, record| record.provider != provider);
    let exports_dropped = before - exports.len();
    drop(exports);

    let mut imports = IMPORTS.lock().unwrap_or_else(PoisonError::into_inner);
    let before = imports.len();
    imports.retain(|_, record| record.provider != provider);
    (exports_dropped, before - imports.len())
}

/// Map an exported allocation through `provider` and return a local pointer.
///
/// The pointer carries the handle's offset and is valid for `size - offset`
/// bytes until [`unimport`].
pub fn import(provider: &Provider, handle: &IpcHandle) -> Result<NonNull<u8>> {
    let inner = provider.inner();
    if inner.name() != handle.provider {
        let err = ProviderError::invalid_argument(format!(
            "handle was exported by `{}`, cannot be opened by `{}`",
            handle.provider,
            inner.name()
        ));
        return inner.check(Err(err));
    }

    let (base, len) = inner.check(inner.backend().ipc_open(&handle.token))?;
    if handle.offset >= len || handle.size > len {
        let closed = inner.backend().ipc_close(base, len);
        if let Err(e) = closed {
            tracing::warn!("closing rejected import failed: {}", e);
        }
        return inner.check(Err(ProviderError::invalid_argument(format!(
            "mapping of {} bytes cannot hold handle {}",
            len, handle.id
        ))));
    }

    // SAFETY: offset < len, so the result stays inside the mapping.
    let local = unsafe { base.add(handle.offset) };
    IMPORTS.lock().unwrap_or_else(PoisonError::into_inner).insert(
        local.as_ptr() as usize,
        ImportRecord {
            provider: inner.id(),
            base: base.as_ptr() as usize,
            len,
        },
    );
    tracing::debug!("imported handle {} into {}", handle.id, inner.id());
    Ok(local)
}

/// Close a mapping returned by [`import`].
pub fn unimport(ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    let record = IMPORTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&addr)
        .ok_or_else(|| ProviderError::invalid_argument(format!("{:p} is not an import", ptr)))?;

    let inner = provider::live(record.provider)?;
    let base = NonNull::new(record.base as *mut u8)
        .ok_or_else(|| ProviderError::invalid_argument("null mapping base"))?;
    let result = inner.check(inner.backend().ipc_close(base, record.len));
    if result.is_err() {
        IMPORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, record);
    }
    result
}
