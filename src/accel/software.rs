//! Pure-Rust AES-256-CBC backend

use super::{BackendKind, CipherBackend};
use crate::chunk::IV_SIZE;
use crate::crypto::{cbc_decrypt, cbc_encrypt, KEY_SIZE};
use crate::error::Result;

/// RustCrypto `aes` + `cbc`; available on every target
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareBackend;

impl CipherBackend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        let mut buf = input.to_vec();
        cbc_encrypt(key, iv, &mut buf)?;
        Ok(buf)
    }

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], input: &[u8]) -> Result<Vec<u8>> {
        let mut buf = input.to_vec();
        cbc_decrypt(key, iv, &mut buf)?;
        Ok(buf)
    }
}
