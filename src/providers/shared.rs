//! File-backed shared memory backend.
//!
//! Every allocation is its own page-rounded `MAP_SHARED` mapping of an
//! unlinked-on-free temporary file. Exporting hands out a token naming the
//! backing file; importing maps the same file, in this process or another.
//!
//! Parameters:
//! - `dir`: directory for backing files (default: the system temp dir)

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::capability::ProviderConfig;
use crate::core::contract::{MemoryProvider, ProviderOps, CONTRACT_VERSION};
use crate::core::error::{NativeError, ProviderError, Result};
use crate::providers::{page_size, round_to_page};

const NAME: &str = "shared";

/// Descriptor for the shared memory backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedOps;

impl SharedOps {
    pub fn new() -> Self {
        SharedOps
    }
}

impl ProviderOps for SharedOps {
    fn version(&self) -> semver::Version {
        CONTRACT_VERSION
    }

    fn name(&self) -> &str {
        NAME
    }

    fn supports_device(&self, config: &ProviderConfig) -> bool {
        config.device.is_none() && config.pci.is_none()
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<Box<dyn MemoryProvider>> {
        let dir = config
            .param_str("dir")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        if !dir.is_dir() {
            return Err(ProviderError::invalid_argument(format!(
                "shared memory directory {} does not exist",
                dir.display()
            )));
        }
        tracing::debug!("shared provider backing files in {}", dir.display());
        Ok(Box::new(SharedProvider::new(dir)))
    }
}

/// Export token: which file to map and how much of it.
#[derive(Debug, Serialize, Deserialize)]
struct SharedToken {
    path: PathBuf,
    len: usize,
}

/// One allocation and its backing file.
#[derive(Debug)]
struct Region {
    file: NamedTempFile,
    size: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct State {
    regions: HashMap<usize, Region>,
    /// Imported mappings, address to mapped length
    imports: HashMap<usize, usize>,
    /// Outstanding exports per token
    exports: HashMap<Vec<u8>, usize>,
}

/// A live shared memory instance.
#[derive(Debug)]
pub struct SharedProvider {
    dir: PathBuf,
    page_size: usize,
    state: Mutex<State>,
    last_error: Mutex<NativeError>,
}

impl SharedProvider {
    fn new(dir: PathBuf) -> Self {
        SharedProvider {
            dir,
            page_size: page_size(),
            state: Mutex::new(State::default()),
            last_error: Mutex::new(NativeError::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_error(&self, native: NativeError) -> ProviderError {
        let err = ProviderError::backend(NAME, native.to_string());
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = native;
        err
    }

    fn os_error(&self, context: &str) -> ProviderError {
        let mut native = NativeError::last_os_error();
        native.message = format!("{}: {}", context, native.message);
        self.set_error(native)
    }

    fn io_error(&self, context: &str, err: std::io::Error) -> ProviderError {
        self.set_error(NativeError::new(
            format!("{}: {}", context, err),
            err.raw_os_error().unwrap_or(-1),
        ))
    }

    /// Map `len` bytes of `fd` shared and writable.
    fn map(&self, fd: i32, len: usize) -> Result<NonNull<u8>> {
        // SAFETY: a fresh mapping chosen by the kernel; fd is open.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(self.os_error("mmap"));
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| self.os_error("mmap"))
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<()> {
        // SAFETY: `addr..addr + len` is a mapping created by `map`.
        if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
            return Err(self.os_error("munmap"));
        }
        Ok(())
    }

    fn token(region: &Region) -> Result<Vec<u8>> {
        serde_json::to_vec(&SharedToken {
            path: region.file.path().to_path_buf(),
            len: region.len,
        })
        .map_err(|e| ProviderError::backend(NAME, e.to_string()))
    }
}

impl MemoryProvider for SharedProvider {
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if alignment > self.page_size {
            return Err(self.set_error(NativeError::new(
                format!(
                    "alignment {} exceeds page size {}",
                    alignment, self.page_size
                ),
                libc::EINVAL,
            )));
        }
        let len = round_to_page(size, self.page_size)
            .ok_or_else(|| ProviderError::invalid_argument("size overflows"))?;

        let file = tempfile::Builder::new()
            .prefix("unimem-")
            .tempfile_in(&self.dir)
            .map_err(|e| self.io_error("create backing file", e))?;
        file.as_file()
            .set_len(len as u64)
            .map_err(|e| self.io_error("size backing file", e))?;

        let ptr = self.map(file.as_file().as_raw_fd(), len)?;
        self.state()
            .regions
            .insert(ptr.as_ptr() as usize, Region { file, size, len });
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state();
        let Some(region) = state.regions.get(&addr) else {
            return Err(ProviderError::invalid_argument(format!(
                "{:#x} was not allocated here",
                addr
            )));
        };
        if size != 0 && size != region.size {
            return Err(ProviderError::invalid_argument(format!(
                "free size {} does not match allocation size {}",
                size, region.size
            )));
        }
        let len = region.len;
        self.unmap(addr, len)?;
        if let Some(region) = state.regions.remove(&addr) {
            if let Ok(token) = Self::token(&region) {
                state.exports.remove(&token);
            }
        }
        // Dropping the region removes the backing file.
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

    fn purge_lazy(&self, _ptr: NonNull<u8>, _size: usize) -> Result<()> {
        Ok(())
    }

    /// Drops the resident pages of the whole pages inside the range. The
    /// contents survive in the backing file.
    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let page = self.page_size;
        let start = (addr + page - 1) & !(page - 1);
        let end = (addr + size) & !(page - 1);
        if end <= start {
            return Ok(());
        }
        // SAFETY: the range lies inside a mapping owned by this provider,
        // checked by the dispatch layer.
        let rc = unsafe {
            libc::madvise(
                start as *mut libc::c_void,
                end - start,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return Err(self.os_error("madvise"));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        NAME
    }

    fn ipc_export(&self, ptr: NonNull<u8>, _size: usize) -> Result<Vec<u8>> {
        let mut state = self.state();
        let region = state.regions.get(&(ptr.as_ptr() as usize)).ok_or_else(|| {
            ProviderError::invalid_argument("only allocation base addresses can be exported")
        })?;
        let token = Self::token(region)?;
        *state.exports.entry(token.clone()).or_insert(0) += 1;
        Ok(token)
    }

    fn ipc_release(&self, token: &[u8]) -> Result<()> {
        let mut state = self.state();
        match state.exports.get_mut(token) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.exports.remove(token);
            }
            None => return Err(ProviderError::invalid_argument("token was not exported here")),
        }
        Ok(())
    }

    fn ipc_open(&self, token: &[u8]) -> Result<(NonNull<u8>, usize)> {
        let token: SharedToken = serde_json::from_slice(token)
            .map_err(|e| ProviderError::invalid_argument(format!("malformed token: {}", e)))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&token.path)
            .map_err(|e| self.io_error(&format!("open {}", token.path.display()), e))?;

        let ptr = self.map(file.as_raw_fd(), token.len)?;
        self.state()
            .imports
            .insert(ptr.as_ptr() as usize, token.len);
        Ok((ptr, token.len))
    }

    fn ipc_close(&self, ptr: NonNull<u8>, _size: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state();
        let len = state
            .imports
            .remove(&addr)
            .ok_or_else(|| ProviderError::invalid_argument(format!("{:#x} is not an import", addr)))?;
        drop(state);
        self.unmap(addr, len)
    }
}

impl Drop for SharedProvider {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (addr, region) in &state.regions {
            let _ = self.unmap(*addr, region.len);
        }
        for (addr, len) in &state.imports {
            let _ = self.unmap(*addr, *len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::CapabilityTag;
    use crate::core::error::ResultCode;
    use tempfile::TempDir;

    fn instance(dir: &TempDir) -> Box<dyn MemoryProvider> {
        let config = ProviderConfig::new(CapabilityTag::Shared)
            .with_param("dir", dir.path().to_string_lossy().into_owned());
        SharedOps::new().initialize(&config).unwrap()
    }

    fn file_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn test_alloc_creates_and_free_removes_backing_file() {
        let tmp = TempDir::new().unwrap();
        let p = instance(&tmp);

        let ptr = p.alloc(100, 0).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
        assert_eq!(file_count(&tmp), 1);

        p.free(ptr, 100).unwrap();
        assert_eq!(file_count(&tmp), 0);
    }

    #[test]
    fn test_free_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let p = instance(&tmp);
        let ptr = p.alloc(100, 0).unwrap();
        assert_eq!(
            p.free(ptr, 4096).unwrap_err().code(),
            ResultCode::InvalidArgument
        );
        p.free(ptr, 0).unwrap();
    }

    #[test]
    fn test_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let config = ProviderConfig::new(CapabilityTag::Shared)
            .with_param("dir", tmp.path().join("missing").to_string_lossy().into_owned());
        let err = SharedOps::new().initialize(&config).err().unwrap();
        assert_eq!(err.code(), ResultCode::InvalidArgument);
    }

    #[test]
    fn test_export_open_sees_same_memory() {
        let tmp = TempDir::new().unwrap();
        let producer = instance(&tmp);
        let consumer = instance(&tmp);

        let ptr = producer.alloc(64, 0).unwrap();
        // SAFETY: 64 writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(b"shared bytes".as_ptr(), ptr.as_ptr(), 12) };

        let token = producer.ipc_export(ptr, 64).unwrap();
        let (mapped, len) = consumer.ipc_open(&token).unwrap();
        assert!(len >= 64);
        assert_ne!(mapped, ptr);

        // SAFETY: the mapping is at least 64 bytes.
        let seen = unsafe { std::slice::from_raw_parts(mapped.as_ptr(), 12) };
        assert_eq!(seen, b"shared bytes");

        // Writes travel the other way too
        // SAFETY: as above.
        unsafe { *mapped.as_ptr() = b'S' };
        // SAFETY: producer mapping is live.
        assert_eq!(unsafe { *ptr.as_ptr() }, b'S');

        consumer.ipc_close(mapped, len).unwrap();
        assert!(consumer.ipc_close(mapped, len).is_err());

        producer.ipc_release(&token).unwrap();
        assert!(producer.ipc_release(&token).is_err());
        producer.free(ptr, 64).unwrap();
    }

    #[test]
    fn test_open_after_free_fails() {
        let tmp = TempDir::new().unwrap();
        let p = instance(&tmp);
        let ptr = p.alloc(64, 0).unwrap();
        let token = p.ipc_export(ptr, 64).unwrap();
        p.free(ptr, 64).unwrap();

        let err = p.ipc_open(&token).unwrap_err();
        assert_eq!(err.code(), ResultCode::BackendSpecific);
        assert!(p.last_native_error().message.contains("open"));
    }

    #[test]
    fn test_purge_force_keeps_contents() {
        let tmp = TempDir::new().unwrap();
        let p = instance(&tmp);
        let size = page_size() * 2;
        let ptr = p.alloc(size, 0).unwrap();
        // SAFETY: `size` writable bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 7, size) };

        p.purge_force(ptr, size).unwrap();
        // SAFETY: still mapped; file-backed pages are reloaded.
        assert_eq!(unsafe { *ptr.as_ptr().add(size - 1) }, 7);
        p.free(ptr, size).unwrap();
    }

    #[test]
    fn test_alignment_above_page_rejected() {
        let tmp = TempDir::new().unwrap();
        let p = instance(&tmp);
        let err = p.alloc(64, page_size() * 2).unwrap_err();
        assert_eq!(err.code(), ResultCode::BackendSpecific);
        assert_eq!(p.last_native_error().code, libc::EINVAL);
    }
}
