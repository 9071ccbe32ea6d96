//! PKCS#7 padding for the final chunk

use super::BLOCK_SIZE;
use crate::error::{Error, Result};
use cbc::cipher::block_padding::{Pkcs7, RawPadding};

/// Pad the final chunk to a whole number of blocks (always adds 1..=16 bytes)
pub fn pad_final(mut data: Vec<u8>) -> Vec<u8> {
    let tail = data.len() % BLOCK_SIZE;
    let start = data.len() - tail;
    data.resize(start + BLOCK_SIZE, 0);
    Pkcs7::raw_pad(&mut data[start..], tail);
    data
}

/// Strip PKCS#7 padding from a decrypted final chunk
pub fn unpad_final(mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(format!(
            "final chunk length {} is not a positive multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let start = data.len() - BLOCK_SIZE;
    let kept = Pkcs7::raw_unpad(&data[start..])
        .map_err(|_| Error::Decryption("invalid padding (wrong key or corrupted data)".to_string()))?
        .len();
    data.truncate(start + kept);
    Ok(data)
}
