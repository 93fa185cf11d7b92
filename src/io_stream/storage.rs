//! Positioned, shareable archive storage.
//!
//! Readers never move a shared cursor: every consumer (the metadata parser,
//! a sequential entry stream, each parallel block task) reads through its own
//! [`SliceReader`] over an `Arc<dyn Storage>`.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

pub trait Storage: Send + Sync {
    fn len(&self) -> io::Result<u64>;

    /// Read at an absolute offset without touching any shared position.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    offset += n as u64;
                    buf = &mut buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Storage for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::{Seek, SeekFrom};
        let mut handle = self.try_clone()?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read(buf)
    }
}

impl Storage for Vec<u8> {
    fn len(&self) -> io::Result<u64> {
        Ok(self.as_slice().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.as_slice();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

/// A bounded, independently positioned view of a storage range.
pub struct SliceReader {
    storage: Arc<dyn Storage>,
    pos:     u64,
    end:     u64,
}

impl SliceReader {
    pub fn new(storage: Arc<dyn Storage>, offset: u64, len: u64) -> Self {
        Self { storage, pos: offset, end: offset.saturating_add(len) }
    }
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.end - self.pos;
        if left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        let n = self.storage.read_at(self.pos, &mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive ends inside a packed stream"));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_independent() {
        let storage: Arc<dyn Storage> = Arc::new((0u8..100).collect::<Vec<_>>());
        let mut a = SliceReader::new(storage.clone(), 10, 5);
        let mut b = SliceReader::new(storage, 90, 5);
        let mut out = Vec::new();
        a.read_to_end(&mut out).unwrap();
        b.read_to_end(&mut out).unwrap();
        assert_eq!(out, [10, 11, 12, 13, 14, 90, 91, 92, 93, 94]);
    }

    #[test]
    fn range_past_end_is_premature_eof() {
        let storage: Arc<dyn Storage> = Arc::new(vec![0u8; 8]);
        let mut r = SliceReader::new(storage, 4, 10);
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
