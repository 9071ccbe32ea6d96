//! Backend selection with deterministic fallback

use super::{BackendKind, Capabilities, LibraryBackend, SoftwareBackend};
use crate::chunk::{derive_iv, pad_final, unpad_final, Chunk, IV_SIZE};
use crate::config::AccelerationConfig;
use crate::crypto::{SymmetricKey, KEY_SIZE};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One AES-256-CBC implementation over block-aligned buffers
pub trait CipherBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>>;
}

/// Routes chunk cipher calls to the usable backends
#[derive(Clone)]
pub struct Dispatcher {
    backends: BTreeMap<BackendKind, Arc<dyn CipherBackend>>,
    capabilities: Capabilities,
    preferred: BackendKind,
}

impl Dispatcher {
    /// Probe every backend once and keep the ones that loaded
    pub fn probe(config: &AccelerationConfig) -> Self {
        let mut backends: Vec<Arc<dyn CipherBackend>> = Vec::new();

        for kind in [BackendKind::CudaGpu, BackendKind::OpenClGpu] {
            match LibraryBackend::load(kind, &config.library_dir) {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(Error::BackendUnavailable(_)) => debug!("{} backend not present", kind),
                Err(e) => warn!("{} backend unusable: {}", kind, e),
            }
        }

        #[cfg(feature = "openssl")]
        if let Some(cpu) = super::cpu::CpuBackend::probe() {
            backends.push(Arc::new(cpu));
        }

        backends.push(Arc::new(SoftwareBackend));

        let dispatcher = Self::with_backends(config.preferred, backends);
        info!(
            "Available backends: {}",
            dispatcher
                .capabilities
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        dispatcher
    }

    /// Build from explicit backends; software is always added
    pub fn with_backends(preferred: BackendKind, backends: Vec<Arc<dyn CipherBackend>>) -> Self {
        let mut map: BTreeMap<BackendKind, Arc<dyn CipherBackend>> = backends
            .into_iter()
            .map(|b| (b.kind(), b))
            .collect();
        map.entry(BackendKind::Software)
            .or_insert_with(|| Arc::new(SoftwareBackend));

        let capabilities = Capabilities::from_kinds(map.keys().copied());
        Dispatcher {
            backends: map,
            capabilities,
            preferred,
        }
    }

    /// Software-only dispatcher
    pub fn software() -> Self {
        Self::with_backends(BackendKind::Software, Vec::new())
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn preferred(&self) -> BackendKind {
        self.preferred
    }

    pub fn set_preferred(&mut self, preferred: BackendKind) {
        self.preferred = preferred;
    }

    fn backend(&self, kind: BackendKind) -> Result<&Arc<dyn CipherBackend>> {
        self.backends
            .get(&kind)
            .ok_or(Error::BackendUnavailable(kind))
    }

    /// Encrypt block-aligned data with exactly `kind`, no fallback
    pub fn encrypt_with(
        &self,
        kind: BackendKind,
        key: &[u8; KEY_SIZE],
        iv: &[u8; IV_SIZE],
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let out = self.backend(kind)?.encrypt(key, iv, input)?;
        check_len(kind, input.len(), out.len())?;
        Ok(out)
    }

    /// Decrypt block-aligned data with exactly `kind`, no fallback
    pub fn decrypt_with(
        &self,
        kind: BackendKind,
        key: &[u8; KEY_SIZE],
        iv: &[u8; IV_SIZE],
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let out = self.backend(kind)?.decrypt(key, iv, input)?;
        check_len(kind, input.len(), out.len())?;
        Ok(out)
    }

    /// Run `op` along the fallback chain until one backend succeeds
    fn with_fallback<F>(&self, index: u32, mut op: F) -> Result<Vec<u8>>
    where
        F: FnMut(BackendKind) -> Result<Vec<u8>>,
    {
        let mut last_err = None;

        for kind in self.preferred.fallback_chain() {
            if !self.capabilities.contains(kind) {
                continue;
            }
            match op(kind) {
                Ok(out) => {
                    if kind != self.preferred {
                        warn!("Chunk {} handled by {} after fallback", index, kind);
                    }
                    return Ok(out);
                }
                Err(e) => {
                    warn!("Backend {} failed on chunk {}: {}", kind, index, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(Error::BackendUnavailable(self.preferred)))
    }

    /// Encrypt one chunk: derive its IV, pad it if final, dispatch with fallback
    pub fn encrypt_chunk(&self, chunk: Chunk, key: &SymmetricKey, base_iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
        let iv = derive_iv(base_iv, chunk.index);
        let data = if chunk.is_final {
            pad_final(chunk.data)
        } else {
            chunk.data
        };

        self.with_fallback(chunk.index, |kind| {
            self.encrypt_with(kind, key.as_bytes(), &iv, &data)
        })
    }

    /// Decrypt one chunk: derive its IV, dispatch with fallback, unpad if final
    pub fn decrypt_chunk(&self, chunk: Chunk, key: &SymmetricKey, base_iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
        let iv = derive_iv(base_iv, chunk.index);
        let plain = self.with_fallback(chunk.index, |kind| {
            self.decrypt_with(kind, key.as_bytes(), &iv, &chunk.data)
        })?;

        if chunk.is_final {
            unpad_final(plain)
        } else {
            Ok(plain)
        }
    }
}

fn check_len(kind: BackendKind, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::BackendFailure {
            backend: kind,
            reason: format!("produced {} bytes for {} input bytes", got, expected),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that always fails, counting its calls
    struct Faulty {
        kind: BackendKind,
        calls: AtomicUsize,
    }

    impl Faulty {
        fn new(kind: BackendKind) -> Arc<Self> {
            Arc::new(Faulty {
                kind,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl CipherBackend for Faulty {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn encrypt(&self, _: &[u8; KEY_SIZE], _: &[u8; IV_SIZE], _: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::BackendFailure {
                backend: self.kind,
                reason: "device lost".to_string(),
            })
        }

        fn decrypt(&self, k: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], d: &[u8]) -> Result<Vec<u8>> {
            self.encrypt(k, iv, d)
        }
    }

    /// Backend that returns a truncated buffer
    struct Short;

    impl CipherBackend for Short {
        fn kind(&self) -> BackendKind {
            BackendKind::CpuAccelerated
        }

        fn encrypt(&self, _: &[u8; KEY_SIZE], _: &[u8; IV_SIZE], d: &[u8]) -> Result<Vec<u8>> {
            Ok(d[..d.len() / 2].to_vec())
        }

        fn decrypt(&self, k: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], d: &[u8]) -> Result<Vec<u8>> {
            self.encrypt(k, iv, d)
        }
    }

    fn chunk(index: u32, len: usize, is_final: bool) -> Chunk {
        Chunk {
            index,
            data: (0..len).map(|i| i as u8).collect(),
            is_final,
        }
    }

    #[test]
    fn test_software_chunk_round_trip() {
        let dispatcher = Dispatcher::software();
        let key = SymmetricKey::random();
        let iv = [3u8; IV_SIZE];

        let ct = dispatcher.encrypt_chunk(chunk(4, 100, true), &key, &iv).unwrap();
        assert_eq!(ct.len(), 112);

        let pt = dispatcher
            .decrypt_chunk(Chunk { index: 4, data: ct, is_final: true }, &key, &iv)
            .unwrap();
        assert_eq!(pt, chunk(4, 100, true).data);
    }

    #[test]
    fn test_non_final_chunk_is_not_padded() {
        let dispatcher = Dispatcher::software();
        let key = SymmetricKey::random();
        let ct = dispatcher
            .encrypt_chunk(chunk(0, 64, false), &key, &[0u8; IV_SIZE])
            .unwrap();
        assert_eq!(ct.len(), 64);
    }

    #[test]
    fn test_faulty_preferred_falls_back_to_software() {
        let faulty = Faulty::new(BackendKind::CudaGpu);
        let dispatcher = Dispatcher::with_backends(BackendKind::CudaGpu, vec![faulty.clone() as Arc<dyn CipherBackend>]);
        let key = SymmetricKey::random();
        let iv = [9u8; IV_SIZE];

        let ct = dispatcher.encrypt_chunk(chunk(1, 48, false), &key, &iv).unwrap();
        let expected = Dispatcher::software()
            .encrypt_chunk(chunk(1, 48, false), &key, &iv)
            .unwrap();

        assert_eq!(ct, expected);
        assert_eq!(faulty.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unavailable_preferred_skipped() {
        let dispatcher = Dispatcher::with_backends(BackendKind::OpenClGpu, Vec::new());
        assert!(!dispatcher.capabilities().contains(BackendKind::OpenClGpu));
        let key = SymmetricKey::random();
        assert!(dispatcher.encrypt_chunk(chunk(0, 16, true), &key, &[0u8; IV_SIZE]).is_ok());
    }

    #[test]
    fn test_strict_call_reports_unavailable() {
        let dispatcher = Dispatcher::software();
        let result = dispatcher.encrypt_with(BackendKind::CudaGpu, &[0u8; KEY_SIZE], &[0u8; IV_SIZE], &[0u8; 16]);
        assert!(matches!(result, Err(Error::BackendUnavailable(BackendKind::CudaGpu))));
    }

    #[test]
    fn test_wrong_length_output_is_a_failure() {
        let dispatcher = Dispatcher::with_backends(BackendKind::CpuAccelerated, vec![Arc::new(Short) as Arc<dyn CipherBackend>]);
        let result = dispatcher.encrypt_with(
            BackendKind::CpuAccelerated,
            &[0u8; KEY_SIZE],
            &[0u8; IV_SIZE],
            &[0u8; 32],
        );
        assert!(matches!(result, Err(Error::BackendFailure { .. })));

        // Fallback still produces a full-length result
        let key = SymmetricKey::random();
        let ct = dispatcher.encrypt_chunk(chunk(0, 32, false), &key, &[0u8; IV_SIZE]).unwrap();
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn test_all_available_backends_agree() {
        let dispatcher = Dispatcher::probe(&AccelerationConfig::default());
        let key = [0x42u8; KEY_SIZE];
        let iv = [0x24u8; IV_SIZE];
        let data = vec![0xA5u8; 4096];

        let reference = dispatcher
            .encrypt_with(BackendKind::Software, &key, &iv, &data)
            .unwrap();
        for kind in dispatcher.capabilities().iter() {
            let ct = dispatcher.encrypt_with(kind, &key, &iv, &data).unwrap();
            assert_eq!(ct, reference, "{} disagrees with software AES", kind);
        }
    }

    proptest! {
        #[test]
        fn prop_final_chunk_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..300),
            index in any::<u32>(),
            key in any::<[u8; KEY_SIZE]>(),
            iv in any::<[u8; IV_SIZE]>(),
        ) {
            let dispatcher = Dispatcher::software();
            let key = SymmetricKey::from_bytes(key);
            let ct = dispatcher
                .encrypt_chunk(Chunk { index, data: data.clone(), is_final: true }, &key, &iv)
                .unwrap();
            prop_assert_eq!(ct.len(), (data.len() / 16 + 1) * 16);

            let pt = dispatcher
                .decrypt_chunk(Chunk { index, data: ct, is_final: true }, &key, &iv)
                .unwrap();
            prop_assert_eq!(pt, data);
        }
    }
}
