//! OpenSSL EVP backend for CPUs with AES instructions

use super::{BackendKind, CipherBackend};
use crate::chunk::IV_SIZE;
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use openssl::symm::{Cipher, Crypter, Mode};

/// AES-256-CBC through OpenSSL, which uses AES-NI/ARMv8-CE when present
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    /// Only offered when the CPU reports AES instructions
    pub fn probe() -> Option<Self> {
        if super::cpu_has_aes() {
            Some(CpuBackend)
        } else {
            None
        }
    }

    fn run(mode: Mode, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        let fail = |e: openssl::error::ErrorStack| Error::BackendFailure {
            backend: BackendKind::CpuAccelerated,
            reason: e.to_string(),
        };

        let cipher = Cipher::aes_256_cbc();
        let mut crypter = Crypter::new(cipher, mode, key, Some(iv)).map_err(fail)?;
        crypter.pad(false);

        let mut out = vec![0u8; input.len() + cipher.block_size()];
        let mut written = crypter.update(input, &mut out).map_err(fail)?;
        written += crypter.finalize(&mut out[written..]).map_err(fail)?;
        out.truncate(written);
        Ok(out)
    }
}

impl CipherBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CpuAccelerated
    }

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        Self::run(Mode::Encrypt, key, iv, input)
    }

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        Self::run(Mode::Decrypt, key, iv, input)
    }
}
