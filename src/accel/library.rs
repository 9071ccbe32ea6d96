//! GPU backends provided by external accelerator libraries
//!
//! A library lives at `<library_dir>/cuda/` or `<library_dir>/opencl/` and
//! exports:
//!
//! ```c
//! int aes256_cbc_encrypt(const uint8_t *in, uint8_t *out, size_t len,
//!                        const uint8_t key[32], const uint8_t iv[16]);
//! int aes256_cbc_decrypt(const uint8_t *in, uint8_t *out, size_t len,
//!                        const uint8_t key[32], const uint8_t iv[16]);
//! int accel_device_available(void); /* optional */
//! ```
//!
//! Both cipher calls return 0 on success and work on whole blocks.

use super::{BackendKind, CipherBackend};
use crate::chunk::{BLOCK_SIZE, IV_SIZE};
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use libloading::Library;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use tracing::debug;

type CbcFn = unsafe extern "C" fn(*const u8, *mut u8, usize, *const u8, *const u8) -> c_int;
type ProbeFn = unsafe extern "C" fn() -> c_int;

/// Accelerator loaded from a shared library
pub struct LibraryBackend {
    kind: BackendKind,
    path: PathBuf,
    encrypt_fn: CbcFn,
    decrypt_fn: CbcFn,
    // Must outlive the function pointers above
    _library: Library,
}

impl std::fmt::Debug for LibraryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryBackend")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

impl LibraryBackend {
    /// Expected library path for a GPU backend
    pub fn library_path(kind: BackendKind, library_dir: &Path) -> Option<PathBuf> {
        let (subdir, stem) = match kind {
            BackendKind::CudaGpu => ("cuda", "aes_cuda"),
            BackendKind::OpenClGpu => ("opencl", "aes_opencl"),
            _ => return None,
        };
        Some(library_dir.join(subdir).join(libloading::library_filename(stem)))
    }

    /// Load and probe the library for `kind`
    pub fn load(kind: BackendKind, library_dir: &Path) -> Result<Self> {
        let path = Self::library_path(kind, library_dir).ok_or(Error::BackendUnavailable(kind))?;
        if !path.is_file() {
            return Err(Error::BackendUnavailable(kind));
        }

        let fail = |reason: String| Error::BackendFailure {
            backend: kind,
            reason,
        };

        // SAFETY: loading runs the library's initializers; the library is a
        // trusted accelerator placed next to the application.
        let library = unsafe { Library::new(&path) }
            .map_err(|e| fail(format!("cannot load {}: {}", path.display(), e)))?;

        // SAFETY: symbol types follow the accelerator ABI above.
        let (encrypt_fn, decrypt_fn, probe_fn) = unsafe {
            let enc = library
                .get::<CbcFn>(b"aes256_cbc_encrypt\0")
                .map_err(|e| fail(e.to_string()))?;
            let dec = library
                .get::<CbcFn>(b"aes256_cbc_decrypt\0")
                .map_err(|e| fail(e.to_string()))?;
            let probe = library.get::<ProbeFn>(b"accel_device_available\0").ok();
            (*enc, *dec, probe.map(|p| *p))
        };

        if let Some(probe) = probe_fn {
            // SAFETY: no arguments, returns a flag
            if unsafe { probe() } == 0 {
                debug!("{} library loaded but reports no device", kind);
                return Err(Error::BackendUnavailable(kind));
            }
        }

        debug!("Loaded {} backend from {}", kind, path.display());
        Ok(LibraryBackend {
            kind,
            path,
            encrypt_fn,
            decrypt_fn,
            _library: library,
        })
    }

    fn call(&self, f: CbcFn, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        if input.len() % BLOCK_SIZE != 0 {
            return Err(Error::BackendFailure {
                backend: self.kind,
                reason: format!("input length {} is not block aligned", input.len()),
            });
        }

        let mut out = vec![0u8; input.len()];
        // SAFETY: `in` and `out` are valid for `len` bytes, key and iv for
        // their fixed sizes; the library does not retain the pointers.
        let rc = unsafe {
            f(
                input.as_ptr(),
                out.as_mut_ptr(),
                input.len(),
                key.as_ptr(),
                iv.as_ptr(),
            )
        };

        if rc != 0 {
            return Err(Error::BackendFailure {
                backend: self.kind,
                reason: format!("library returned status {}", rc),
            });
        }
        Ok(out)
    }
}

impl CipherBackend for LibraryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        self.call(self.encrypt_fn, key, iv, input)
    }

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        self.call(self.decrypt_fn, key, iv, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_paths() {
        let dir = Path::new("/opt/accel");
        let cuda = LibraryBackend::library_path(BackendKind::CudaGpu, dir).unwrap();
        assert!(cuda.starts_with("/opt/accel/cuda"));
        assert!(cuda.to_string_lossy().contains("aes_cuda"));
        assert!(LibraryBackend::library_path(BackendKind::Software, dir).is_none());
    }

    #[test]
    fn test_missing_library_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = LibraryBackend::load(BackendKind::OpenClGpu, dir.path());
        assert!(matches!(result, Err(Error::BackendUnavailable(BackendKind::OpenClGpu))));
    }

    #[test]
    fn test_non_library_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = LibraryBackend::library_path(BackendKind::CudaGpu, dir.path()).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a shared object").unwrap();

        let result = LibraryBackend::load(BackendKind::CudaGpu, dir.path());
        assert!(matches!(result, Err(Error::BackendFailure { .. })));
    }
}
