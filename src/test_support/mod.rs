//! Test utilities and scripted backends for unimem unit tests.
//!
//! Provides in-process backends whose behavior (matching, init failures,
//! allocation failures, export support) is scripted per test, plus a mock
//! library loader so adapter discovery can run without real shared objects.
//!
//! # Example
//!
//! ```rust,ignore
//! use crate::test_support::{ScriptedOps, MockLoader};
//!
//! #[test]
//! fn test_example() {
//!     let ops = ScriptedOps::new("gpu").with_device("Arc A770");
//!     let mut loader = MockLoader::new();
//!     loader.add("/opt/l0/libadapter.so", ops);
//!     // Run discovery with the mock...
//! }
//! ```

pub mod fixtures;

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::capability::ProviderConfig;
use crate::core::contract::{MemoryProvider, ProviderOps, CONTRACT_VERSION};
use crate::core::error::{NativeError, ProviderError, Result};
use crate::core::provider::ProviderId;
use crate::loader::LibraryLoader;

// Re-export fixtures for convenience
pub use fixtures::*;

/// A provider id that belongs to no instance.
pub fn fresh_provider_id() -> ProviderId {
    ProviderId::next()
}

/// Descriptor side of a scripted backend.
#[derive(Debug, Clone)]
pub struct ScriptedOps {
    name: String,
    version: semver::Version,
    device: Option<String>,
    fail_init: bool,
    exportable: bool,
    inits: Arc<AtomicUsize>,
    finalized: Arc<AtomicUsize>,
}

impl ScriptedOps {
    /// Create a backend that accepts every configuration.
    pub fn new(name: impl Into<String>) -> Self {
        ScriptedOps {
            name: name.into(),
            version: CONTRACT_VERSION,
            device: None,
            fail_init: false,
            exportable: false,
            inits: Arc::new(AtomicUsize::new(0)),
            finalized: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report a different contract version.
    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    /// Only accept configurations naming this device.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Fail every `initialize` call.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Support the IPC hooks.
    pub fn exportable(mut self) -> Self {
        self.exportable = true;
        self
    }

    /// Counter of `initialize` calls.
    pub fn init_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.inits)
    }

    /// Counter of instance teardowns.
    pub fn finalize_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.finalized)
    }

    /// Build an instance directly, bypassing the registry.
    pub fn build_provider(&self) -> Box<dyn MemoryProvider> {
        Box::new(self.instance())
    }

    fn instance(&self) -> ScriptedProvider {
        let mut provider = ScriptedProvider::new(self.name.clone());
        provider.finalized = Some(Arc::clone(&self.finalized));
        provider.exportable = self.exportable;
        provider
    }
}

impl ProviderOps for ScriptedOps {
    fn version(&self) -> semver::Version {
        self.version.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_device(&self, config: &ProviderConfig) -> bool {
        match &self.device {
            Some(device) => config.device.as_deref() == Some(device.as_str()),
            None => true,
        }
    }

    fn initialize(&self, _config: &ProviderConfig) -> Result<Box<dyn MemoryProvider>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(ProviderError::backend(&self.name, "scripted init failure"));
        }
        Ok(self.build_provider())
    }
}

/// Instance side of a scripted backend, backed by the global allocator.
///
/// IPC is a loopback: an "open" copies the exported bytes into a fresh
/// buffer of the same size.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    fail_alloc: Option<NativeError>,
    exportable: bool,
    release_failures: AtomicUsize,
    live: Mutex<HashMap<usize, Layout>>,
    exported: Mutex<HashSet<Vec<u8>>>,
    last_error: Mutex<NativeError>,
    finalized: Option<Arc<AtomicUsize>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        ScriptedProvider {
            name: name.into(),
            fail_alloc: None,
            exportable: false,
            release_failures: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
            exported: Mutex::new(HashSet::new()),
            last_error: Mutex::new(NativeError::default()),
            finalized: None,
        }
    }

    /// Fail every allocation with this native error.
    pub fn failing_alloc(mut self, message: &str, code: i32) -> Self {
        self.fail_alloc = Some(NativeError::new(message, code));
        self
    }

    pub fn exportable(mut self) -> Self {
        self.exportable = true;
        self
    }

    /// Reject the next `count` releases, keeping the token exported.
    pub fn failing_releases(self, count: usize) -> Self {
        self.release_failures.store(count, Ordering::SeqCst);
        self
    }

    fn raw_alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, alignment.max(8))
            .map_err(|e| ProviderError::invalid_argument(e.to_string()))?;
        // SAFETY: layout has a non-zero size, checked by the dispatch layer.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(ProviderError::OutOfHostMemory)?;
        self.live
            .lock()
            .unwrap()
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn raw_free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let mut live = self.live.lock().unwrap();
        let layout = *live
            .get(&(ptr.as_ptr() as usize))
            .ok_or_else(|| ProviderError::invalid_argument("unknown pointer"))?;
        if layout.size() != size {
            return Err(ProviderError::invalid_argument(format!(
                "size {} does not match allocation size {}",
                size,
                layout.size()
            )));
        }
        live.remove(&(ptr.as_ptr() as usize));
        // SAFETY: allocated above with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn encode(ptr: NonNull<u8>, size: usize) -> Vec<u8> {
        let mut token = (ptr.as_ptr() as usize).to_le_bytes().to_vec();
        token.extend_from_slice(&size.to_le_bytes());
        token
    }

    fn decode(token: &[u8]) -> Option<(usize, usize)> {
        const WORD: usize = std::mem::size_of::<usize>();
        if token.len() != 2 * WORD {
            return None;
        }
        let addr = usize::from_le_bytes(token[..WORD].try_into().ok()?);
        let size = usize::from_le_bytes(token[WORD..].try_into().ok()?);
        Some((addr, size))
    }
}

impl MemoryProvider for ScriptedProvider {
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if let Some(native) = &self.fail_alloc {
            *self.last_error.lock().unwrap() = native.clone();
            return Err(ProviderError::backend(&self.name, native.message.clone()));
        }
        self.raw_alloc(size, alignment)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        self.raw_free(ptr, size)
    }

    fn last_native_error(&self) -> NativeError {
        self.last_error.lock().unwrap().clone()
    }

    fn recommended_page_size(&self, _size: usize) -> Result<usize> {
        Ok(4096)
    }

    fn min_page_size(&self, _ptr: Option<NonNull<u8>>) -> Result<usize> {
        Ok(4096)
    }

    fn purge_lazy(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Ok(())
    }

    fn purge_force(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ipc_export(&self, ptr: NonNull<u8>, size: usize) -> Result<Vec<u8>> {
        if !self.exportable {
            return Err(ProviderError::unsupported(&self.name, "ipc_export"));
        }
        let token = Self::encode(ptr, size);
        self.exported.lock().unwrap().insert(token.clone());
        Ok(token)
    }

    fn ipc_release(&self, token: &[u8]) -> Result<()> {
        let pending = self
            .release_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(ProviderError::backend(&self.name, "release rejected"));
        }
        if self.exported.lock().unwrap().remove(token) {
            Ok(())
        } else {
            Err(ProviderError::invalid_argument("token was not exported here"))
        }
    }

    fn ipc_open(&self, token: &[u8]) -> Result<(NonNull<u8>, usize)> {
        if !self.exportable {
            return Err(ProviderError::unsupported(&self.name, "ipc_open"));
        }
        let (addr, size) =
            Self::decode(token).ok_or_else(|| ProviderError::invalid_argument("malformed token"))?;
        let ptr = self.raw_alloc(size, 8)?;
        // SAFETY: the source is a live allocation of `size` bytes in this
        // process (scripted loopback), the destination was just allocated.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, ptr.as_ptr(), size) };
        Ok((ptr, size))
    }

    fn ipc_close(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        self.raw_free(ptr, size)
    }
}

impl Drop for ScriptedProvider {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.live.lock().unwrap());
        for (addr, layout) in live {
            // SAFETY: every entry was allocated with its layout and not freed.
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
        if let Some(counter) = &self.finalized {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Library loader that serves scripted backends by path.
#[derive(Default)]
pub struct MockLoader {
    libraries: HashMap<PathBuf, Arc<dyn ProviderOps>>,
    attempts: Mutex<Vec<PathBuf>>,
}

impl MockLoader {
    pub fn new() -> Self {
        MockLoader::default()
    }

    /// Make `path` loadable, serving `ops`.
    pub fn add(&mut self, path: impl AsRef<Path>, ops: impl ProviderOps + 'static) {
        self.libraries
            .insert(path.as_ref().to_path_buf(), Arc::new(ops));
    }

    /// Paths that were tried, in order.
    pub fn attempts(&self) -> Vec<PathBuf> {
        self.attempts.lock().unwrap().clone()
    }
}

impl LibraryLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn ProviderOps>> {
        self.attempts.lock().unwrap().push(path.to_path_buf());
        self.libraries
            .get(path)
            .cloned()
            .ok_or_else(|| ProviderError::invalid_argument(format!("cannot open {}", path.display())))
    }
}
