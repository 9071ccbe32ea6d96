//! Passphrase key derivation (PBKDF2-HMAC-SHA256)

use crate::crypto::{SymmetricKey, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Generate a fresh random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit key from a passphrase and salt
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<SymmetricKey> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| Error::KeyDerivation("iteration count must be non-zero".to_string()))?;

    if salt.is_empty() {
        return Err(Error::KeyDerivation("salt must not be empty".to_string()));
    }

    let mut out = [0u8; KEY_SIZE];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase,
        &mut out,
    );
    Ok(SymmetricKey::from_bytes(out))
}
