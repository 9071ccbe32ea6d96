//! Cryptography module for custocrypt
//!
//! AES-256-CBC in software, PBKDF2-HMAC-SHA256 key derivation and RSA-OAEP
//! wrapping of symmetric keys. Padding is handled by the chunk codec; the
//! ciphers here only see block-aligned buffers.

mod encryption;
mod kdf;
mod keys;

pub use encryption::{cbc_decrypt, cbc_encrypt};
pub use kdf::{derive_key, generate_salt};
pub use keys::{KeyEnvelope, PrivateKey, PublicKey, SymmetricKey, WrappedKey};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 16;

/// Fill a fresh random base IV
pub fn random_iv() -> [u8; crate::chunk::IV_SIZE] {
    use rand::RngCore;
    let mut iv = [0u8; crate::chunk::IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
