//! Container codec
//!
//! Two on-disk layouts, told apart by the trailing marker:
//!
//! ```text
//! Remote: IV(16) | plaintext_len(8, BE) | chunks... | key_len(4, BE) | wrapped_key | "ENCRYPTED"
//! Local:  IV(16) | plaintext_len(8, BE) | chunks... | raw_key(32)                  | "LOCAL_ENCRYPTED"
//! ```
//!
//! The marker is checked before any length field read from the tail is
//! trusted. Containers are written to a temporary file in the destination
//! directory and renamed into place only once complete.
//!
//! The chunk size is not recorded in the file, yet every per-chunk IV depends
//! on it, so all containers use [`CHUNK_SIZE`].

use crate::chunk::{self, ChunkLayout, ChunkReader, ChunkSide, IV_SIZE};
use crate::crypto::{SymmetricKey, WrappedKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::keys::{KeyTrailer, StoredKey};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Trailing marker of the remote variant
pub const REMOTE_MARKER: &[u8] = b"ENCRYPTED";

/// Trailing marker of the local variant
pub const LOCAL_MARKER: &[u8] = b"LOCAL_ENCRYPTED";

/// IV plus plaintext length
pub const HEADER_LEN: u64 = IV_SIZE as u64 + 8;

/// Suffix appended to encrypted files
pub const CONTAINER_EXTENSION: &str = "enc";

/// Chunk size of every container
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound for a wrapped key (8192-bit RSA modulus)
const MAX_WRAPPED_KEY_LEN: u32 = 1024;

/// Container variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerVariant {
    Remote,
    Local,
}

/// Parsed header and trailer of a container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub variant: ContainerVariant,
    pub iv: [u8; IV_SIZE],
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
    pub stored_key: StoredKey,
    pub file_len: u64,
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// Identify the variant and read header and trailer without touching ciphertext
pub fn inspect(path: &Path) -> Result<ContainerInfo> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    // Marker first. LOCAL_MARKER ends with REMOTE_MARKER, so it is tested first.
    let tail_len = file_len.min(LOCAL_MARKER.len() as u64) as usize;
    let mut tail = vec![0u8; tail_len];
    read_at(&mut file, file_len - tail_len as u64, &mut tail)?;

    let variant = if tail.ends_with(LOCAL_MARKER) {
        ContainerVariant::Local
    } else if tail.ends_with(REMOTE_MARKER) {
        ContainerVariant::Remote
    } else {
        return Err(Error::malformed(path, "missing trailing marker"));
    };

    let (trailer_len, stored_key) = match variant {
        ContainerVariant::Local => {
            let trailer_len = (KEY_SIZE + LOCAL_MARKER.len()) as u64;
            if file_len < HEADER_LEN + trailer_len {
                return Err(Error::malformed(path, "too short for a local container"));
            }
            let mut key = [0u8; KEY_SIZE];
            read_at(&mut file, file_len - trailer_len, &mut key)?;
            let stored = StoredKey::Clear(SymmetricKey::from_bytes(key));
            (trailer_len, stored)
        }
        ContainerVariant::Remote => {
            let fixed = (4 + REMOTE_MARKER.len()) as u64;
            if file_len < HEADER_LEN + fixed {
                return Err(Error::malformed(path, "too short for a remote container"));
            }
            let mut len_bytes = [0u8; 4];
            read_at(&mut file, file_len - fixed, &mut len_bytes)?;
            let key_len = u32::from_be_bytes(len_bytes);

            if key_len == 0 || key_len > MAX_WRAPPED_KEY_LEN {
                return Err(Error::malformed(
                    path,
                    format!("implausible wrapped key length {}", key_len),
                ));
            }
            let trailer_len = fixed + key_len as u64;
            if file_len < HEADER_LEN + trailer_len {
                return Err(Error::malformed(path, "wrapped key length exceeds file size"));
            }

            let mut wrapped = vec![0u8; key_len as usize];
            read_at(&mut file, file_len - trailer_len, &mut wrapped)?;
            (trailer_len, StoredKey::Wrapped(WrappedKey::from_bytes(wrapped)))
        }
    };

    let mut header = [0u8; HEADER_LEN as usize];
    read_at(&mut file, 0, &mut header)?;
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&header[..IV_SIZE]);
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&header[IV_SIZE..]);
    let plaintext_len = u64::from_be_bytes(size_bytes);

    let ciphertext_len = file_len - HEADER_LEN - trailer_len;

    let expected = chunk::ciphertext_len(plaintext_len)
        .ok_or_else(|| Error::malformed(path, format!("implausible plaintext length {}", plaintext_len)))?;
    if ciphertext_len != expected {
        return Err(Error::malformed(
            path,
            format!(
                "{} ciphertext bytes for a {}-byte plaintext (expected {})",
                ciphertext_len, plaintext_len, expected
            ),
        ));
    }
    ChunkLayout::new(plaintext_len, CHUNK_SIZE)
        .map_err(|e| Error::malformed(path, e.to_string()))?;

    debug!(
        "Container {}: {:?}, {} plaintext bytes",
        path.display(),
        variant,
        plaintext_len
    );

    Ok(ContainerInfo {
        variant,
        iv,
        plaintext_len,
        ciphertext_len,
        stored_key,
        file_len,
    })
}

/// Chunk reader over the ciphertext region of a container
pub fn ciphertext_chunks(path: &Path, info: &ContainerInfo) -> Result<ChunkReader<Take<BufReader<File>>>> {
    let layout = ChunkLayout::new(info.plaintext_len, CHUNK_SIZE)?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let reader = BufReader::with_capacity(CHUNK_SIZE, file).take(info.ciphertext_len);
    Ok(ChunkReader::new(reader, layout, ChunkSide::Ciphertext))
}

/// Temporary file that becomes `final_path` only on success
struct Staged {
    writer: BufWriter<NamedTempFile>,
    final_path: PathBuf,
    written: u64,
}

impl Staged {
    fn create(final_path: &Path) -> Result<Self> {
        let dir = match final_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = NamedTempFile::new_in(&dir)?;
        Ok(Staged {
            writer: BufWriter::new(tmp),
            final_path: final_path.to_path_buf(),
            written: 0,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn commit(self) -> Result<u64> {
        let tmp = self
            .writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.final_path).map_err(|e| Error::Io(e.error))?;
        Ok(self.written)
    }
}

/// Streams a container to disk
///
/// Dropping the writer before [`ContainerWriter::finish`] removes the
/// partial file.
pub struct ContainerWriter {
    staged: Staged,
    expected_ciphertext: u64,
    ciphertext_written: u64,
}

impl ContainerWriter {
    /// Start a container and write its header
    pub fn create(final_path: &Path, iv: &[u8; IV_SIZE], plaintext_len: u64) -> Result<Self> {
        let expected_ciphertext = chunk::ciphertext_len(plaintext_len).ok_or_else(|| {
            Error::Encryption(format!("plaintext of {} bytes is too large", plaintext_len))
        })?;

        let mut staged = Staged::create(final_path)?;
        staged.write(iv)?;
        staged.write(&plaintext_len.to_be_bytes())?;

        Ok(ContainerWriter {
            staged,
            expected_ciphertext,
            ciphertext_written: 0,
        })
    }

    /// Append the next chunk ciphertext
    pub fn write_chunk(&mut self, ciphertext: &[u8]) -> Result<()> {
        self.staged.write(ciphertext)?;
        self.ciphertext_written += ciphertext.len() as u64;
        Ok(())
    }

    /// Write the key trailer and marker, then move the file into place.
    /// Returns the container size.
    pub fn finish(mut self, trailer: &KeyTrailer, key: &SymmetricKey) -> Result<u64> {
        if self.ciphertext_written != self.expected_ciphertext {
            return Err(Error::Encryption(format!(
                "wrote {} ciphertext bytes, expected {}",
                self.ciphertext_written, self.expected_ciphertext
            )));
        }

        match trailer {
            KeyTrailer::Wrapped(wrapped) => {
                let len = u32::try_from(wrapped.len())
                    .ok()
                    .filter(|l| *l > 0 && *l <= MAX_WRAPPED_KEY_LEN)
                    .ok_or_else(|| {
                        Error::WrapKeyFailed(format!("unsupported wrapped key length {}", wrapped.len()))
                    })?;
                self.staged.write(&len.to_be_bytes())?;
                self.staged.write(wrapped.as_bytes())?;
                self.staged.write(REMOTE_MARKER)?;
            }
            KeyTrailer::Clear => {
                self.staged.write(key.as_bytes())?;
                self.staged.write(LOCAL_MARKER)?;
            }
        }

        self.staged.commit()
    }
}

/// Decrypted output, persisted only when the expected length was written
pub struct AtomicOutput {
    staged: Staged,
}

impl AtomicOutput {
    pub fn create(final_path: &Path) -> Result<Self> {
        Ok(AtomicOutput {
            staged: Staged::create(final_path)?,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.staged.write(data)
    }

    pub fn finish(self, expected_len: u64) -> Result<u64> {
        if self.staged.written != expected_len {
            return Err(Error::Decryption(format!(
                "decrypted {} bytes, header says {}",
                self.staged.written, expected_len
            )));
        }
        self.staged.commit()
    }
}

/// `<input>.enc`
pub fn encrypted_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".");
    name.push(CONTAINER_EXTENSION);
    PathBuf::from(name)
}

/// Strip `.enc`, or append `.dec` when the input has no such suffix
pub fn decrypted_path(container: &Path) -> PathBuf {
    if container.extension().is_some_and(|e| e == CONTAINER_EXTENSION) {
        container.with_extension("")
    } else {
        let mut name = container.as_os_str().to_os_string();
        name.push(".dec");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WrappedKey;

    fn write_container(dir: &Path, plaintext_len: u64, trailer: &KeyTrailer) -> PathBuf {
        let path = dir.join("data.bin.enc");
        let key = SymmetricKey::from_bytes([0x33; KEY_SIZE]);
        let mut writer = ContainerWriter::create(&path, &[0x11; IV_SIZE], plaintext_len).unwrap();
        let ciphertext_len = chunk::ciphertext_len(plaintext_len).unwrap();
        if ciphertext_len > 0 {
            writer.write_chunk(&vec![0xCC; ciphertext_len as usize]).unwrap();
        }
        writer.finish(trailer, &key).unwrap();
        path
    }

    #[test]
    fn test_local_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), 20, &KeyTrailer::Clear);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16 + 8 + 32 + 32 + 15);
        assert_eq!(&bytes[..16], &[0x11; 16]);
        assert_eq!(&bytes[16..24], &20u64.to_be_bytes());
        assert!(bytes.ends_with(LOCAL_MARKER));

        let info = inspect(&path).unwrap();
        assert_eq!(info.variant, ContainerVariant::Local);
        assert_eq!(info.plaintext_len, 20);
        assert_eq!(info.ciphertext_len, 32);
        match info.stored_key {
            StoredKey::Clear(k) => assert_eq!(k.as_bytes(), &[0x33; KEY_SIZE]),
            other => panic!("unexpected key {:?}", other),
        }
    }

    #[test]
    fn test_remote_layout() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = WrappedKey::from_bytes(vec![0xAB; 256]);
        let path = write_container(dir.path(), 48, &KeyTrailer::Wrapped(wrapped.clone()));

        let bytes = std::fs::read(&path).unwrap();
        let tail = bytes.len() - REMOTE_MARKER.len();
        assert_eq!(&bytes[tail - 256 - 4..tail - 256], &256u32.to_be_bytes());

        let info = inspect(&path).unwrap();
        assert_eq!(info.variant, ContainerVariant::Remote);
        assert_eq!(info.ciphertext_len, 64);
        match info.stored_key {
            StoredKey::Wrapped(w) => assert_eq!(w, wrapped),
            other => panic!("unexpected key {:?}", other),
        }
    }

    #[test]
    fn test_empty_plaintext_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), 0, &KeyTrailer::Clear);
        let info = inspect(&path).unwrap();
        assert_eq!(info.plaintext_len, 0);
        assert_eq!(info.ciphertext_len, 0);
    }

    #[test]
    fn test_large_plaintext_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.enc");
        let plaintext_len = 65u64 << 30;
        let ciphertext_len = plaintext_len + 16;

        let writer = ContainerWriter::create(&path, &[0x22; IV_SIZE], plaintext_len).unwrap();
        drop(writer);

        // Header, a sparse ciphertext region, then a local trailer
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0x22; IV_SIZE]).unwrap();
        file.write_all(&plaintext_len.to_be_bytes()).unwrap();
        file.seek(SeekFrom::Start(HEADER_LEN + ciphertext_len)).unwrap();
        file.write_all(&[0x44; KEY_SIZE]).unwrap();
        file.write_all(LOCAL_MARKER).unwrap();
        drop(file);

        let info = inspect(&path).unwrap();
        assert_eq!(info.plaintext_len, plaintext_len);
        assert_eq!(info.ciphertext_len, ciphertext_len);

        let chunks = ciphertext_chunks(&path, &info).unwrap();
        assert_eq!(chunks.layout().chunk_count(), 66_560);
    }

    #[test]
    fn test_missing_marker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, vec![0u8; 200]).unwrap();
        assert!(matches!(inspect(&path), Err(Error::MalformedContainer { .. })));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(inspect(&path), Err(Error::MalformedContainer { .. })));
    }

    #[test]
    fn test_bogus_key_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.enc");
        let mut bytes = vec![0u8; 40];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(REMOTE_MARKER);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(inspect(&path), Err(Error::MalformedContainer { .. })));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_container(dir.path(), 100, &KeyTrailer::Clear);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.drain(30..46);
        std::fs::write(&path, bytes).unwrap();

        let err = inspect(&path).unwrap_err();
        assert!(err.to_string().contains("ciphertext bytes"));
    }

    #[test]
    fn test_unfinished_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.enc");
        {
            let mut writer = ContainerWriter::create(&path, &[0; IV_SIZE], 16).unwrap();
            writer.write_chunk(&[0u8; 16]).unwrap();
        }
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_short_ciphertext_refuses_to_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.enc");
        let writer = ContainerWriter::create(&path, &[0; IV_SIZE], 16).unwrap();
        let key = SymmetricKey::random();
        assert!(writer.finish(&KeyTrailer::Clear, &key).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_output_paths() {
        assert_eq!(encrypted_path(Path::new("/a/b.txt")), PathBuf::from("/a/b.txt.enc"));
        assert_eq!(decrypted_path(Path::new("/a/b.txt.enc")), PathBuf::from("/a/b.txt"));
        assert_eq!(decrypted_path(Path::new("/a/b.bin")), PathBuf::from("/a/b.bin.dec"));
    }

    #[test]
    fn test_atomic_output_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut out = AtomicOutput::create(&path).unwrap();
        out.write(b"hello").unwrap();
        assert!(out.finish(6).is_err());
        assert!(!path.exists());

        let mut out = AtomicOutput::create(&path).unwrap();
        out.write(b"hello").unwrap();
        assert_eq!(out.finish(5).unwrap(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}
