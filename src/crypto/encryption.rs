//! AES-256-CBC software implementation
//!
//! Raw CBC over whole blocks. Identical `(key, iv, input)` always gives the
//! same output, which every accelerated backend must reproduce.

use crate::chunk::{BLOCK_SIZE, IV_SIZE};
use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn check_aligned(len: usize) -> Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::Encryption(format!(
            "buffer length {} is not a multiple of {}",
            len, BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Encrypt a block-aligned buffer in place
pub fn cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<()> {
    check_aligned(buf.len())?;
    let len = buf.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::Encryption("AES-CBC encryption failed".to_string()))?;
    Ok(())
}

/// Decrypt a block-aligned buffer in place
pub fn cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<()> {
    if buf.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(format!(
            "ciphertext length {} is not a multiple of {}",
            buf.len(),
            BLOCK_SIZE
        )));
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::Decryption("AES-CBC decryption failed".to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    // NIST SP 800-38A, F.2.5 CBC-AES256.Encrypt, first block
    const KAT_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const KAT_IV: &str = "000102030405060708090a0b0c0d0e0f";
    const KAT_PT: &str = "6bc1bee22e409f96e93d7e117393172a";
    const KAT_CT: &str = "f58c4c04d6e5f1ba779eabfb5f7bfbd6";

    fn kat() -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
        let key: [u8; KEY_SIZE] = hex::decode(KAT_KEY).unwrap().try_into().unwrap();
        let iv: [u8; IV_SIZE] = hex::decode(KAT_IV).unwrap().try_into().unwrap();
        (key, iv)
    }

    #[test]
    fn test_known_answer() {
        let (key, iv) = kat();
        let mut buf = hex::decode(KAT_PT).unwrap();
        cbc_encrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(hex::encode(&buf), KAT_CT);

        cbc_decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(hex::encode(&buf), KAT_PT);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);

        let plaintext = vec![0x42u8; 1024];
        let mut buf = plaintext.clone();
        cbc_encrypt(&key, &iv, &mut buf).unwrap();
        assert_ne!(buf, plaintext);
        cbc_decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_empty_buffer() {
        let (key, iv) = kat();
        let mut buf: Vec<u8> = Vec::new();
        cbc_encrypt(&key, &iv, &mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unaligned_rejected() {
        let (key, iv) = kat();
        assert!(cbc_encrypt(&key, &iv, &mut [0u8; 17]).is_err());
        assert!(matches!(
            cbc_decrypt(&key, &iv, &mut [0u8; 15]),
            Err(Error::Decryption(_))
        ));
    }
}
