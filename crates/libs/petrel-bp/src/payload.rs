use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file-backed payload. The backing file is unlinked when the last
/// reference drops.
#[derive(Debug)]
struct PayloadFile {
    path: PathBuf,
}

impl Drop for PayloadFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("payload: could not remove {}: {}", self.path.display(), e);
        }
    }
}

/// Bundle payload bytes, in memory or spilled to a file.
#[derive(Debug, Clone)]
pub enum BundlePayload {
    Memory(Vec<u8>),
    File { file: Arc<PayloadFileHandle>, len: u64 },
}

/// Shared handle over a payload file; cloning shares the refcount.
#[derive(Debug, Clone)]
pub struct PayloadFileHandle {
    inner: Arc<PayloadFile>,
}

impl PayloadFileHandle {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Default for BundlePayload {
    fn default() -> Self {
        BundlePayload::Memory(Vec::new())
    }
}

impl BundlePayload {
    pub fn with_memory(bytes: Vec<u8>) -> Self {
        BundlePayload::Memory(bytes)
    }

    /// Write `bytes` into a fresh file under `dir` and return a file-backed
    /// payload referencing it.
    pub fn in_file(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let mut f = fs::File::create(&path)?;
        f.write_all(bytes)?;
        f.sync_data()?;
        Ok(BundlePayload::File {
            file: Arc::new(PayloadFileHandle { inner: Arc::new(PayloadFile { path }) }),
            len: bytes.len() as u64,
        })
    }

    /// Re-attach an existing payload file, e.g. after a store reload.
    pub fn attach_file(path: PathBuf) -> std::io::Result<Self> {
        let len = fs::metadata(&path)?.len();
        Ok(BundlePayload::File {
            file: Arc::new(PayloadFileHandle { inner: Arc::new(PayloadFile { path }) }),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            BundlePayload::Memory(v) => v.len() as u64,
            BundlePayload::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            BundlePayload::Memory(_) => None,
            BundlePayload::File { file, .. } => Some(file.path()),
        }
    }

    /// Full payload contents. File-backed payloads are read from disk.
    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        match self {
            BundlePayload::Memory(v) => Ok(v.clone()),
            BundlePayload::File { file, .. } => fs::read(file.path()),
        }
    }

    /// A slice `[offset, offset + len)` of the payload.
    pub fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        match self {
            BundlePayload::Memory(v) => {
                let start = offset.min(v.len() as u64) as usize;
                let end = (offset + len).min(v.len() as u64) as usize;
                Ok(v[start..end].to_vec())
            }
            BundlePayload::File { file, .. } => {
                let mut f = fs::File::open(file.path())?;
                f.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len as usize];
                let mut read = 0;
                while read < buf.len() {
                    let n = f.read(&mut buf[read..])?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                buf.truncate(read);
                Ok(buf)
            }
        }
    }

    /// Replace the payload contents in place, keeping the storage class.
    pub fn set_data(&mut self, bytes: Vec<u8>) -> std::io::Result<()> {
        match self {
            BundlePayload::Memory(v) => {
                *v = bytes;
                Ok(())
            }
            BundlePayload::File { file, len } => {
                let mut f = fs::File::create(file.path())?;
                f.write_all(&bytes)?;
                f.sync_data()?;
                *len = bytes.len() as u64;
                Ok(())
            }
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            BundlePayload::Memory(v) => {
                v.extend_from_slice(bytes);
                Ok(())
            }
            BundlePayload::File { file, len } => {
                let mut f = fs::OpenOptions::new().append(true).open(file.path())?;
                f.write_all(bytes)?;
                *len += bytes.len() as u64;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip() {
        let mut p = BundlePayload::with_memory(b"hello".to_vec());
        assert_eq!(p.len(), 5);
        assert_eq!(p.read_all().expect("read"), b"hello");
        assert_eq!(p.read_range(1, 3).expect("range"), b"ell");
        p.append(b" world").expect("append");
        assert_eq!(p.read_all().expect("read"), b"hello world");
    }

    #[test]
    fn file_payload_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = BundlePayload::in_file(dir.path(), "b1.payload", b"persisted").expect("create");
        let path = p.file_path().expect("path").to_path_buf();
        assert!(path.exists());
        assert_eq!(p.read_range(0, 9).expect("range"), b"persisted");

        let clone = p.clone();
        drop(p);
        assert!(path.exists(), "file lives while a handle remains");
        drop(clone);
        assert!(!path.exists(), "file removed with the last handle");
    }
}
