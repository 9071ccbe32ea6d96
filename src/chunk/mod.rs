//! Chunk codec
//!
//! Splits files into ordered fixed-size chunks, derives the per-chunk IV and
//! pads only the final chunk. Non-final chunks are always a whole number of
//! AES blocks, so their ciphertext has the same length as their plaintext.

mod padding;
mod reader;

pub use padding::{pad_final, unpad_final};
pub use reader::{split, ChunkReader, ChunkSide};

use crate::error::{Error, Result};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// IV size in bytes
pub const IV_SIZE: usize = 16;

/// Derive the IV of chunk `index` from the file's base IV.
///
/// `iv = base XOR be128(index)`; only the last four bytes can differ from
/// the base since indices are `u32`.
pub fn derive_iv(base: &[u8; IV_SIZE], index: u32) -> [u8; IV_SIZE] {
    let mut iv = *base;
    let counter = (index as u128).to_be_bytes();
    for (b, c) in iv.iter_mut().zip(counter.iter()) {
        *b ^= c;
    }
    iv
}

/// One contiguous piece of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the file
    pub index: u32,
    /// Chunk bytes (plaintext or ciphertext depending on the reader side)
    pub data: Vec<u8>,
    /// Whether this is the last chunk of the file
    pub is_final: bool,
}

/// Chunk geometry of one file, derived from its plaintext length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    plaintext_len: u64,
    chunk_size: usize,
    count: u32,
}

impl ChunkLayout {
    /// Compute the layout for `plaintext_len` bytes split in `chunk_size` pieces
    pub fn new(plaintext_len: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size % BLOCK_SIZE != 0 {
            return Err(Error::InvalidChunkSize(chunk_size));
        }

        let count = plaintext_len.div_ceil(chunk_size as u64);
        let count = u32::try_from(count).map_err(|_| Error::TooManyChunks(count))?;

        Ok(ChunkLayout {
            plaintext_len,
            chunk_size,
            count,
        })
    }

    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks; zero for an empty file
    pub fn chunk_count(&self) -> u32 {
        self.count
    }

    /// Plaintext length of chunk `index`
    pub fn plain_len(&self, index: u32) -> usize {
        if index + 1 < self.count {
            self.chunk_size
        } else if index + 1 == self.count {
            (self.plaintext_len - (index as u64) * (self.chunk_size as u64)) as usize
        } else {
            0
        }
    }

    /// Ciphertext length of chunk `index`; the final chunk carries the padding
    pub fn cipher_len(&self, index: u32) -> usize {
        if index + 1 == self.count {
            padded_len(self.plain_len(index))
        } else {
            self.plain_len(index)
        }
    }

    /// Total ciphertext length of all chunks
    pub fn ciphertext_len(&self) -> u64 {
        ciphertext_len(self.plaintext_len).unwrap_or(u64::MAX)
    }
}

/// Length after PKCS#7 padding
pub fn padded_len(len: usize) -> usize {
    (len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Ciphertext length of a whole file: zero when empty, otherwise the padded
/// length. Independent of the chunk size. `None` if it does not fit in a u64.
pub fn ciphertext_len(plaintext_len: u64) -> Option<u64> {
    if plaintext_len == 0 {
        return Some(0);
    }
    let block = BLOCK_SIZE as u64;
    (plaintext_len / block)
        .checked_add(1)
        .and_then(|blocks| blocks.checked_mul(block))
}
