//! Lazy, single-pass chunk reader

use super::{Chunk, ChunkLayout};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tracing::debug;

/// Which byte lengths the reader follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSide {
    /// Read plaintext chunk lengths (encryption input)
    Plaintext,
    /// Read ciphertext chunk lengths, final one padded (decryption input)
    Ciphertext,
}

/// Iterator yielding the chunks of a stream in file order.
///
/// Reads every byte exactly once; a short read aborts iteration with an
/// error, after which the reader yields nothing.
pub struct ChunkReader<R> {
    reader: R,
    layout: ChunkLayout,
    side: ChunkSide,
    next_index: u32,
    failed: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, layout: ChunkLayout, side: ChunkSide) -> Self {
        ChunkReader {
            reader,
            layout,
            side,
            next_index: 0,
            failed: false,
        }
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.layout.chunk_count() {
            return None;
        }

        let index = self.next_index;
        let len = match self.side {
            ChunkSide::Plaintext => self.layout.plain_len(index),
            ChunkSide::Ciphertext => self.layout.cipher_len(index),
        };

        let mut data = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut data) {
            self.failed = true;
            let err = if e.kind() == ErrorKind::UnexpectedEof {
                Error::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("input ended inside chunk {}", index),
                ))
            } else {
                Error::Io(e)
            };
            return Some(Err(err));
        }

        self.next_index += 1;
        let is_final = self.next_index == self.layout.chunk_count();
        debug!("Read chunk {} ({} bytes, final={})", index, len, is_final);

        Some(Ok(Chunk {
            index,
            data,
            is_final,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.layout.chunk_count() - self.next_index) as usize;
        (0, Some(left))
    }
}

/// Open `path` and split it into plaintext chunks of `chunk_size` bytes
pub fn split(path: &Path, chunk_size: usize) -> Result<ChunkReader<BufReader<File>>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let layout = ChunkLayout::new(len, chunk_size)?;
    Ok(ChunkReader::new(
        BufReader::with_capacity(chunk_size.min(8 * 1024 * 1024), file),
        layout,
        ChunkSide::Plaintext,
    ))
}
