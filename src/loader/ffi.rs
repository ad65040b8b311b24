//! C ABI bridge for adapter plugins.
//!
//! An adapter library exports [`PROVIDER_OPS_SYMBOL`], a function returning a
//! pointer to a static [`RawProviderOps`] table. [`ForeignProviderOps`] wraps
//! such a table so it can be registered like any in-process backend.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, PoisonError};

use libloading::Library;

use crate::core::capability::ProviderConfig;
use crate::core::contract::{MemoryProvider, ProviderOps};
use crate::core::error::{NativeError, ProviderError, Result, ResultCode};

/// Symbol every adapter library exports.
pub const PROVIDER_OPS_SYMBOL: &[u8] = b"unimem_provider_ops\0";

/// Raw result code; see [`ResultCode`] for the values.
pub type RawResult = i32;

/// Signature of [`PROVIDER_OPS_SYMBOL`].
pub type RawProviderOpsFn = unsafe extern "C" fn() -> *const RawProviderOps;

/// Configuration blob as seen by an adapter. Unset strings are null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawProviderConfig {
    pub tag: *const c_char,
    pub device: *const c_char,
    pub pci: *const c_char,
}

/// Adapter operation table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawProviderOps {
    /// Contract version, see [`encode_version`]
    pub version: u32,
    pub initialize:
        unsafe extern "C" fn(config: *const RawProviderConfig, state: *mut *mut c_void) -> RawResult,
    pub finalize: unsafe extern "C" fn(state: *mut c_void),
    pub alloc: unsafe extern "C" fn(
        state: *mut c_void,
        size: usize,
        alignment: usize,
        ptr: *mut *mut c_void,
    ) -> RawResult,
    pub free: unsafe extern "C" fn(state: *mut c_void, ptr: *mut c_void, size: usize) -> RawResult,
    pub get_last_native_error:
        unsafe extern "C" fn(state: *mut c_void, message: *mut *const c_char, code: *mut i32),
    pub get_recommended_page_size:
        unsafe extern "C" fn(state: *mut c_void, size: usize, page_size: *mut usize) -> RawResult,
    pub get_min_page_size: unsafe extern "C" fn(
        state: *mut c_void,
        ptr: *const c_void,
        page_size: *mut usize,
    ) -> RawResult,
    pub purge_lazy:
        unsafe extern "C" fn(state: *mut c_void, ptr: *mut c_void, size: usize) -> RawResult,
    pub purge_force:
        unsafe extern "C" fn(state: *mut c_void, ptr: *mut c_void, size: usize) -> RawResult,
    pub get_name: unsafe extern "C" fn(state: *mut c_void) -> *const c_char,
    pub supports_device: unsafe extern "C" fn(config: *const RawProviderConfig) -> bool,
}

/// Pack a version as `major << 16 | minor << 8 | patch`.
pub fn encode_version(version: &semver::Version) -> u32 {
    ((version.major as u32 & 0xffff) << 16)
        | ((version.minor as u32 & 0xff) << 8)
        | (version.patch as u32 & 0xff)
}

pub fn decode_version(raw: u32) -> semver::Version {
    semver::Version::new(
        u64::from(raw >> 16),
        u64::from((raw >> 8) & 0xff),
        u64::from(raw & 0xff),
    )
}

/// Owned C strings backing a [`RawProviderConfig`].
struct RawConfig {
    tag: CString,
    device: Option<CString>,
    pci: Option<CString>,
}

impl RawConfig {
    fn new(config: &ProviderConfig) -> Result<Self> {
        let cstring = |s: &str| {
            CString::new(s).map_err(|_| {
                ProviderError::invalid_argument(format!("configuration value {:?} contains NUL", s))
            })
        };
        Ok(RawConfig {
            tag: cstring(&config.tag.to_string())?,
            device: config.device.as_deref().map(cstring).transpose()?,
            pci: config.pci.as_deref().map(cstring).transpose()?,
        })
    }

    /// Borrowing view; valid while `self` lives.
    fn as_raw(&self) -> RawProviderConfig {
        RawProviderConfig {
            tag: self.tag.as_ptr(),
            device: self.device.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            pci: self.pci.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
        }
    }
}

/// Pointer to an immutable function table that stays valid while the
/// library it came from is loaded.
#[derive(Clone, Copy)]
struct TablePtr(NonNull<RawProviderOps>);

// SAFETY: the table is never written through and adapters must keep it
// valid for as long as their library is loaded.
unsafe impl Send for TablePtr {}
unsafe impl Sync for TablePtr {}

impl TablePtr {
    fn get(&self) -> &RawProviderOps {
        // SAFETY: see the Send/Sync impls; the owning library is kept alive
        // by every holder of a TablePtr.
        unsafe { self.0.as_ref() }
    }
}

/// Descriptor backed by an adapter's C function table.
pub struct ForeignProviderOps {
    table: TablePtr,
    name: String,
    library: Option<Arc<Library>>,
}

impl ForeignProviderOps {
    /// Wrap a table exported by `library`.
    ///
    /// # Safety
    ///
    /// `table` must point to a valid `RawProviderOps` whose function pointers
    /// follow the adapter contract and which stays valid while `library` is
    /// loaded.
    pub unsafe fn from_library(
        library: Arc<Library>,
        table: *const RawProviderOps,
        name: impl Into<String>,
    ) -> Result<Self> {
        let table = NonNull::new(table.cast_mut())
            .ok_or_else(|| ProviderError::invalid_argument("adapter returned a null ops table"))?;
        Ok(ForeignProviderOps {
            table: TablePtr(table),
            name: name.into(),
            library: Some(library),
        })
    }

    /// Wrap a table linked into this binary.
    pub fn from_static(table: &'static RawProviderOps, name: impl Into<String>) -> Self {
        ForeignProviderOps {
            table: TablePtr(NonNull::from(table)),
            name: name.into(),
            library: None,
        }
    }
}

impl ProviderOps for ForeignProviderOps {
    fn version(&self) -> semver::Version {
        decode_version(self.table.get().version)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_device(&self, config: &ProviderConfig) -> bool {
        let Ok(raw) = RawConfig::new(config) else {
            return false;
        };
        let view = raw.as_raw();
        // SAFETY: `view` points into `raw`, which outlives the call.
        unsafe { (self.table.get().supports_device)(&view) }
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<Box<dyn MemoryProvider>> {
        let raw = RawConfig::new(config)?;
        let view = raw.as_raw();
        let mut state: *mut c_void = ptr::null_mut();

        // SAFETY: `view` and `state` are valid for the duration of the call.
        let code = unsafe { (self.table.get().initialize)(&view, &mut state) };
        match ResultCode::from_raw(code) {
            ResultCode::Success => {}
            ResultCode::InvalidArgument => {
                return Err(ProviderError::invalid_argument(format!(
                    "adapter `{}` rejected its configuration",
                    self.name
                )))
            }
            ResultCode::OutOfHostMemory => return Err(ProviderError::OutOfHostMemory),
            other => {
                return Err(ProviderError::backend(
                    &self.name,
                    format!("initialize failed: {}", other),
                ))
            }
        }

        // SAFETY: `state` was produced by a successful initialize.
        let name = unsafe { cstr_or((self.table.get().get_name)(state), &self.name) };
        Ok(Box::new(ForeignProvider {
            table: self.table,
            state: Mutex::new(State(state)),
            name,
            _library: self.library.clone(),
        }))
    }
}

/// Read a C string returned by an adapter, falling back to `default`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn cstr_or(ptr: *const c_char, default: &str) -> String {
    if ptr.is_null() {
        default.to_string()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

struct State(*mut c_void);

// SAFETY: the state pointer is only ever passed back to the adapter, and
// only while holding the instance mutex.
unsafe impl Send for State {}

/// Live adapter instance. Calls are serialized through a mutex because the
/// C contract does not promise thread safety.
struct ForeignProvider {
    table: TablePtr,
    state: Mutex<State>,
    name: String,
    _library: Option<Arc<Library>>,
}

impl ForeignProvider {
    fn call(&self, operation: &'static str, f: impl FnOnce(*mut c_void) -> RawResult) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let code = f(state.0);
        match ResultCode::from_raw(code) {
            ResultCode::Success => Ok(()),
            ResultCode::InvalidArgument => Err(ProviderError::invalid_argument(format!(
                "adapter `{}` rejected arguments to {}",
                self.name, operation
            ))),
            ResultCode::OutOfHostMemory => Err(ProviderError::OutOfHostMemory),
            ResultCode::Unsupported => Err(ProviderError::unsupported(&self.name, operation)),
            _ => Err(ProviderError::backend(
                &self.name,
                format!("{} failed: {}", operation, self.native_error_locked(state.0)),
            )),
        }
    }

    fn native_error_locked(&self, state: *mut c_void) -> NativeError {
        let mut message: *const c_char = ptr::null();
        let mut code = 0i32;
        // SAFETY: out-pointers are valid locals; the adapter owns the message.
        unsafe {
            (self.table.get().get_last_native_error)(state, &mut message, &mut code);
            NativeError::new(cstr_or(message, ""), code)
        }
    }
}

impl MemoryProvider for ForeignProvider {
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let mut out: *mut c_void = ptr::null_mut();
        // SAFETY: the state is live and `out` is a valid local.
        self.call("alloc", |state| unsafe {
            (self.table.get().alloc)(state, size, alignment, &mut out)
        })?;
        NonNull::new(out.cast::<u8>())
            .ok_or_else(|| ProviderError::backend(&self.name, "alloc returned null"))
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: `ptr` was produced by this adapter's alloc.
        self.call("free", |state| unsafe {
            (self.table.get().free)(state, ptr.as_ptr().cast(), size)
        })
    }

    fn last_native_error(&self) -> NativeError {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.native_error_locked(state.0)
    }

    fn recommended_page_size(&self, size: usize) -> Result<usize> {
        let mut page = 0usize;
        // SAFETY: the state is live and `page` is a valid local.
        self.call("get_recommended_page_size", |state| unsafe {
            (self.table.get().get_recommended_page_size)(state, size, &mut page)
        })?;
        Ok(page)
    }

    fn min_page_size(&self, ptr: Option<NonNull<u8>>) -> Result<usize> {
        let mut page = 0usize;
        let raw = ptr.map_or(ptr::null(), |p| p.as_ptr().cast_const().cast());
        // SAFETY: the state is live and `page` is a valid local.
        self.call("get_min_page_size", |state| unsafe {
            (self.table.get().get_min_page_size)(state, raw, &mut page)
        })?;
        Ok(page)
    }

    fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: the range was validated against this provider's allocations.
        self.call("purge_lazy", |state| unsafe {
            (self.table.get().purge_lazy)(state, ptr.as_ptr().cast(), size)
        })
    }

    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: the range was validated against this provider's allocations.
        self.call("purge_force", |state| unsafe {
            (self.table.get().purge_force)(state, ptr.as_ptr().cast(), size)
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ForeignProvider {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the state came from initialize and is finalized exactly once.
        unsafe { (self.table.get().finalize)(state.0) };
        state.0 = ptr::null_mut();
    }
}
