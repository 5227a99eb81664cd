//! Read-only backing store.
//!
//! Each model reads its original bytes from a backing file: the file the
//! session was opened on for the root model, a saved snapshot for checkpoint
//! models. The file is memory-mapped read-only so concurrent readers share no
//! seek state. The engine never writes to a backing file in place; byte
//! transforms stream to a scratch file and atomically swap it in.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, error};

use crate::error::{EditError, Result};

const TRANSFORM_CHUNK: usize = 64 * 1024;

/// A read-only random-access view of a backing file.
///
/// Zero-length files (and the no-file empty session) are served as an empty
/// slice without mapping.
#[derive(Debug)]
pub struct Backing {
    file: Option<File>,
    map: Option<Mmap>,
    len: i64,
    path: Option<PathBuf>,
    // Present for checkpoint backings: removing the temp path deletes the
    // snapshot file when the model is dropped.
    temp: Option<TempPath>,
}

impl Backing {
    /// Backing for a session started from scratch.
    pub(crate) fn empty() -> Self {
        Self { file: None, map: None, len: 0, path: None, temp: None }
    }

    /// Open an existing file read-only.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as i64;
        let map = if len > 0 { Some(unsafe { Mmap::map(&file)? }) } else { None };
        Ok(Self {
            file: Some(file),
            map,
            len,
            path: Some(path.to_path_buf()),
            temp: None,
        })
    }

    /// Adopt a freshly written checkpoint snapshot. The snapshot is deleted
    /// from disk when this backing is dropped.
    pub(crate) fn checkpoint(snapshot: NamedTempFile) -> Result<Self> {
        let (file, temp_path) = snapshot.into_parts();
        let file = File::open(&temp_path)?;
        let len = file.metadata()?.len() as i64;
        let map = if len > 0 { Some(unsafe { Mmap::map(&file)? }) } else { None };
        Ok(Self {
            file: Some(file),
            map,
            len,
            path: Some(temp_path.to_path_buf()),
            temp: Some(temp_path),
        })
    }

    /// Size of the backing file in bytes.
    pub(crate) fn len(&self) -> i64 {
        self.len
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bounds-checked `(offset, length)` slice of the file contents.
    pub(crate) fn slice(&self, offset: i64, length: i64) -> Result<&[u8]> {
        if offset < 0 || length < 0 || offset + length > self.len {
            return Err(EditError::InvalidOffset { offset, size: self.len });
        }
        if length == 0 {
            return Ok(&[]);
        }
        // len > 0 implies the map exists
        let map = self.map.as_ref().expect("non-empty backing without a map");
        Ok(&map[offset as usize..(offset + length) as usize])
    }

    /// Stream a per-byte transform of `[offset, offset + length)` (length 0
    /// meaning through end of file) into a scratch sibling, then atomically
    /// replace the backing file and remap it.
    ///
    /// A failure while producing the scratch file is recoverable: the scratch
    /// is removed and the backing is untouched. A failure while swapping the
    /// finished scratch into place leaves the model unreadable and is fatal.
    pub(crate) fn transform_and_swap<F>(&mut self, offset: i64, length: i64, mut f: F) -> Result<()>
    where
        F: FnMut(u8) -> u8,
    {
        use std::io::Write;

        let path = self
            .path
            .clone()
            .expect("byte transform requires a file-backed model");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let end = if length == 0 { self.len } else { (offset + length).min(self.len) };
        let start = offset.clamp(0, self.len);

        let mut scratch = NamedTempFile::new_in(dir)?;
        {
            let mut out = std::io::BufWriter::new(scratch.as_file_mut());
            let mut pos = 0i64;
            while pos < self.len {
                let amount = TRANSFORM_CHUNK.min((self.len - pos) as usize);
                let chunk = self.slice(pos, amount as i64)?;
                if pos + amount as i64 <= start || pos >= end {
                    out.write_all(chunk)?;
                } else {
                    let mut buf = chunk.to_vec();
                    for (i, byte) in buf.iter_mut().enumerate() {
                        let at = pos + i as i64;
                        if at >= start && at < end {
                            *byte = f(*byte);
                        }
                    }
                    out.write_all(&buf)?;
                }
                pos += amount as i64;
            }
            out.flush()?;
        }
        scratch.as_file().sync_all()?;

        debug!(path = %path.display(), start, end, "swapping transformed backing file");
        // Past this point an error strands the model on a destroyed file.
        if let Err(e) = scratch.persist(&path) {
            error!(path = %path.display(), error = %e.error, "failed to swap transformed backing file");
            panic!("failed to swap transformed backing file: {}", e.error);
        }
        match self.reload(&path) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to reopen transformed backing file");
                panic!("failed to reopen transformed backing file: {e}");
            }
        }
    }

    fn reload(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as i64;
        self.map = if len > 0 { Some(unsafe { Mmap::map(&file)? }) } else { None };
        self.file = Some(file);
        self.len = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing_with(content: &[u8]) -> (tempfile::TempDir, Backing) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path).unwrap().write_all(content).unwrap();
        let backing = Backing::open(&path).unwrap();
        (dir, backing)
    }

    #[test]
    fn test_empty_backing() {
        let b = Backing::empty();
        assert_eq!(b.len(), 0);
        assert_eq!(b.slice(0, 0).unwrap(), b"");
        assert!(b.slice(0, 1).is_err());
    }

    #[test]
    fn test_open_and_slice() {
        let (_dir, b) = backing_with(b"0123456789");
        assert_eq!(b.len(), 10);
        assert_eq!(b.slice(0, 10).unwrap(), b"0123456789");
        assert_eq!(b.slice(3, 4).unwrap(), b"3456");
        assert_eq!(b.slice(10, 0).unwrap(), b"");
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let (_dir, b) = backing_with(b"abc");
        assert!(b.slice(0, 4).is_err());
        assert!(b.slice(4, 0).is_err());
        assert!(b.slice(-1, 1).is_err());
    }

    #[test]
    fn test_zero_length_file() {
        let (_dir, b) = backing_with(b"");
        assert_eq!(b.len(), 0);
        assert_eq!(b.slice(0, 0).unwrap(), b"");
    }

    #[test]
    fn test_transform_whole_file() {
        let (_dir, mut b) = backing_with(b"abcDEF");
        b.transform_and_swap(0, 0, |byte| byte.to_ascii_uppercase()).unwrap();
        assert_eq!(b.slice(0, 6).unwrap(), b"ABCDEF");
    }

    #[test]
    fn test_transform_range_leaves_rest() {
        let (_dir, mut b) = backing_with(b"aaaaaa");
        b.transform_and_swap(2, 2, |byte| byte ^ 0xff).unwrap();
        let out = b.slice(0, 6).unwrap();
        assert_eq!(&out[..2], b"aa");
        assert_eq!(out[2], b'a' ^ 0xff);
        assert_eq!(out[3], b'a' ^ 0xff);
        assert_eq!(&out[4..], b"aa");
    }

    #[test]
    fn test_transform_involution_restores() {
        let (_dir, mut b) = backing_with(b"scalpel bytes");
        b.transform_and_swap(3, 5, |byte| byte ^ 0xff).unwrap();
        b.transform_and_swap(3, 5, |byte| byte ^ 0xff).unwrap();
        assert_eq!(b.slice(0, 13).unwrap(), b"scalpel bytes");
    }

    #[test]
    fn test_checkpoint_backing_deletes_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut snapshot = NamedTempFile::new_in(dir.path()).unwrap();
        snapshot.write_all(b"snapshot").unwrap();
        let path = snapshot.path().to_path_buf();

        let b = Backing::checkpoint(snapshot).unwrap();
        assert_eq!(b.slice(0, 8).unwrap(), b"snapshot");
        assert!(path.exists());
        drop(b);
        assert!(!path.exists());
    }
}
