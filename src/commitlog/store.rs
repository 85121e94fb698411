use crate::commitlog::CommitLogError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Width of the big-endian length prefix in front of every record.
pub(crate) const LEN_WIDTH: u64 = 8;

/// Store is the append-only record file of a segment.
///
/// Byte representation of one record:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | ... |
/// +---+---+---+---+---+---+---+---+---+-...-+
/// |      Length (8 bytes, BE)     | Payload |
/// +-------------------------------+-----...-+
/// ```
///
/// Every append is handed to the OS before returning (no user space buffering). `sync()` is
/// called by the owner on rollover and close.
pub(crate) struct Store {
    path: PathBuf,
    file: File,
    size: u64,
}

impl Store {
    pub(crate) fn open(path: &Path) -> Result<Self, CommitLogError> {
        let file = OpenOptions::new().read(true).append(true).create(true).open(path)?;
        let size = file.metadata()?.len();

        Ok(Store {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Appends a length prefixed payload. Returns (bytes written, position of the record).
    pub(crate) fn append(&mut self, payload: &[u8]) -> Result<(u64, u64), CommitLogError> {
        let position = self.size;

        let mut frame = BytesMut::with_capacity(LEN_WIDTH as usize + payload.len());
        frame.put_u64(payload.len() as u64);
        frame.put_slice(payload);
        self.file.write_all(&frame)?;

        let written = frame.len() as u64;
        self.size += written;

        Ok((written, position))
    }

    pub(crate) fn read(&self, position: u64) -> Result<Bytes, CommitLogError> {
        let len = self.read_len(position)?;
        if record_span_end(position, len).map_or(true, |end| end > self.size) {
            return Err(CommitLogError::Corrupt(format!(
                "record at position {} claims {} bytes, store holds {}",
                position, len, self.size
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact_at(&mut payload, position + LEN_WIDTH)?;

        Ok(Bytes::from(payload))
    }

    fn read_len(&self, position: u64) -> Result<u64, CommitLogError> {
        if position.checked_add(LEN_WIDTH).map_or(true, |end| end > self.size) {
            return Err(CommitLogError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("position {} is beyond store size {}", position, self.size),
            )));
        }

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        self.file.read_exact_at(&mut len_buf, position)?;

        Ok(u64::from_be_bytes(len_buf))
    }

    /// Returns the end position of the record at `position`, or None if the record is not fully
    /// contained in the store (torn write).
    /// A length too large to address counts as torn too.
    pub(crate) fn record_end(&self, position: u64) -> Result<Option<u64>, CommitLogError> {
        if position.checked_add(LEN_WIDTH).map_or(true, |end| end > self.size) {
            return Ok(None);
        }
        match record_span_end(position, self.read_len(position)?) {
            Some(end) if end <= self.size => Ok(Some(end)),
            _ => Ok(None),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn truncate(&mut self, len: u64) -> Result<(), CommitLogError> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<(), CommitLogError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// A reader over the bytes written so far. Later appends are not visible to it.
    pub(crate) fn reader(&self) -> Result<StoreReader, CommitLogError> {
        Ok(StoreReader {
            file: self.file.try_clone()?,
            position: 0,
            size: self.size,
        })
    }

    pub(crate) fn close(self) -> Result<(), CommitLogError> {
        self.sync()
    }

    pub(crate) fn remove(self) -> Result<(), CommitLogError> {
        let path = self.path.clone();
        drop(self.file);
        fs::remove_file(path)?;
        Ok(())
    }
}

fn record_span_end(position: u64, len: u64) -> Option<u64> {
    position.checked_add(LEN_WIDTH)?.checked_add(len)
}

pub(crate) struct StoreReader {
    file: File,
    position: u64,
    size: u64,
}

impl Read for StoreReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = std::cmp::min(buf.len() as u64, remaining) as usize;
        let n = self.file.read_at(&mut buf[..max], self.position)?;
        self.position += n as u64;

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"hello world";
    const WIDTH: u64 = PAYLOAD.len() as u64 + LEN_WIDTH;

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("0.store")).unwrap();

        for i in 0..3 {
            let (written, position) = store.append(PAYLOAD).unwrap();
            assert_eq!(written, WIDTH);
            assert_eq!(position, WIDTH * i);
        }

        for i in 0..3 {
            let payload = store.read(WIDTH * i).unwrap();
            assert_eq!(&payload[..], PAYLOAD);
        }

        assert!(store.read(WIDTH * 3).is_err());
    }

    #[test]
    fn reopen_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.store");

        let mut store = Store::open(&path).unwrap();
        store.append(PAYLOAD).unwrap();
        store.close().unwrap();

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), WIDTH);
        assert_eq!(&store.read(0).unwrap()[..], PAYLOAD);
        assert_eq!(store.record_end(0).unwrap(), Some(WIDTH));
    }

    #[test]
    fn reader_sees_all_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("0.store")).unwrap();
        store.append(PAYLOAD).unwrap();
        store.append(PAYLOAD).unwrap();

        let mut buf = Vec::new();
        store.reader().unwrap().read_to_end(&mut buf).unwrap();

        assert_eq!(buf.len() as u64, WIDTH * 2);
        assert_eq!(&buf[LEN_WIDTH as usize..WIDTH as usize], PAYLOAD);
    }

    #[test]
    fn oversized_length_prefix_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.store");
        let mut bytes = (u64::MAX - 4).to_be_bytes().to_vec();
        bytes.extend_from_slice(PAYLOAD);
        fs::write(&path, &bytes).unwrap();

        let store = Store::open(&path).unwrap();
        assert!(matches!(store.read(0), Err(CommitLogError::Corrupt(_))));
        assert_eq!(store.record_end(0).unwrap(), None);
        assert!(store.read(u64::MAX - 2).is_err());
        assert_eq!(store.record_end(u64::MAX - 2).unwrap(), None);
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.store");
        let store = Store::open(&path).unwrap();

        store.remove().unwrap();
        assert!(!path.exists());
    }
}
