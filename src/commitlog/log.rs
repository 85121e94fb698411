use crate::commitlog::segment::{Segment, INDEX_EXTENSION, STORE_EXTENSION};
use crate::commitlog::store::StoreReader;
use crate::commitlog::{CommitLogError, Record, SegmentConfig};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Log is an ordered list of segments. The last segment is the active one and the only one that
/// is appended to.
///
/// Appends and segment list changes take the write lock. Reads take the read lock and use
/// positional I/O, so they run concurrently with each other.
pub struct Log {
    dir: PathBuf,
    config: SegmentConfig,
    inner: RwLock<Inner>,
}

struct Inner {
    segments: Vec<Segment>,
    closed: bool,
}

impl Log {
    pub fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> Result<Self, CommitLogError> {
        config.validate().map_err(CommitLogError::InvalidConfig)?;

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = Vec::new();
        for base_offset in list_base_offsets(&dir)? {
            segments.push(Segment::open(&dir, base_offset, config)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(&dir, config.initial_offset, config)?);
        }

        Ok(Log {
            dir,
            config,
            inner: RwLock::new(Inner {
                segments,
                closed: false,
            }),
        })
    }

    pub fn append(&self, value: impl Into<Bytes>) -> Result<u64, CommitLogError> {
        let value = value.into();
        let mut inner = self.write()?;

        if active(&inner)?.is_maxed() {
            self.roll(&mut inner)?;
        }

        match active_mut(&mut inner)?.append(value.clone()) {
            Err(CommitLogError::SegmentMaxed) => {
                self.roll(&mut inner)?;
                active_mut(&mut inner)?.append(value)
            }
            result => result,
        }
    }

    fn roll(&self, inner: &mut Inner) -> Result<(), CommitLogError> {
        let active = active(inner)?;
        active.sync()?;

        let base_offset = active.next_offset();
        let segment = Segment::open(&self.dir, base_offset, self.config)?;
        inner.segments.push(segment);

        Ok(())
    }

    pub fn read(&self, offset: u64) -> Result<Record, CommitLogError> {
        let inner = self.read_lock()?;

        let i = inner.segments.partition_point(|s| s.next_offset() <= offset);
        match inner.segments.get(i) {
            Some(segment) if segment.contains(offset) => segment.read(offset),
            _ => Err(CommitLogError::OffsetOutOfRange { offset }),
        }
    }

    pub fn lowest_offset(&self) -> Result<u64, CommitLogError> {
        let inner = self.read_lock()?;
        inner
            .segments
            .first()
            .map(|s| s.base_offset())
            .ok_or(CommitLogError::Closed)
    }

    /// Offset of the last record, or None if the log holds no records.
    pub fn highest_offset(&self) -> Result<Option<u64>, CommitLogError> {
        let inner = self.read_lock()?;
        let lowest = inner.segments.first().map(|s| s.base_offset()).ok_or(CommitLogError::Closed)?;
        let next = active(&inner)?.next_offset();

        if next == lowest {
            Ok(None)
        } else {
            Ok(Some(next - 1))
        }
    }

    /// Offset the next append will be assigned.
    pub fn next_offset(&self) -> Result<u64, CommitLogError> {
        let inner = self.read_lock()?;
        Ok(active(&inner)?.next_offset())
    }

    /// Removes every segment whose highest offset is below `lowest`. The active segment stays.
    pub fn truncate(&self, lowest: u64) -> Result<(), CommitLogError> {
        let mut inner = self.write()?;

        while inner.segments.len() > 1 && inner.segments[0].next_offset() <= lowest {
            let segment = inner.segments.remove(0);
            segment.remove()?;
        }

        Ok(())
    }

    /// Removes every record `>= offset`. Offsets after the cut are handed out again.
    pub fn truncate_from(&self, offset: u64) -> Result<(), CommitLogError> {
        let mut inner = self.write()?;

        while inner.segments.len() > 1 {
            match inner.segments.last() {
                Some(last) if last.base_offset() >= offset => {}
                _ => break,
            }
            if let Some(segment) = inner.segments.pop() {
                segment.remove()?;
            }
        }

        active_mut(&mut inner)?.truncate_from(offset)
    }

    /// Removes every segment and starts over with an empty segment at `initial_offset`. If any
    /// segment fails to go away the log is left without segments and every later call fails.
    pub fn reset(&self, initial_offset: u64) -> Result<(), CommitLogError> {
        let mut inner = self.write()?;

        let segments = std::mem::take(&mut inner.segments);
        for_each_segment(segments, Segment::remove)?;
        inner
            .segments
            .push(Segment::open(&self.dir, initial_offset, self.config)?);

        Ok(())
    }

    /// Reader over the raw store bytes of every segment in offset order, as of now.
    pub fn reader(&self) -> Result<LogReader, CommitLogError> {
        let inner = self.read_lock()?;

        let mut readers = Vec::with_capacity(inner.segments.len());
        for segment in inner.segments.iter() {
            readers.push(segment.reader()?);
        }

        Ok(LogReader { readers, current: 0 })
    }

    pub fn sync(&self) -> Result<(), CommitLogError> {
        let inner = self.read_lock()?;
        active(&inner)?.sync()
    }

    pub fn close(&self) -> Result<(), CommitLogError> {
        let mut inner = self.inner.write().map_err(|_| CommitLogError::LockPoisoned)?;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let segments = std::mem::take(&mut inner.segments);
        for_each_segment(segments, Segment::close)
    }

    pub fn remove(&self) -> Result<(), CommitLogError> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<Inner>, CommitLogError> {
        let inner = self.inner.read().map_err(|_| CommitLogError::LockPoisoned)?;
        if inner.closed {
            return Err(CommitLogError::Closed);
        }
        Ok(inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<Inner>, CommitLogError> {
        let inner = self.inner.write().map_err(|_| CommitLogError::LockPoisoned)?;
        if inner.closed {
            return Err(CommitLogError::Closed);
        }
        Ok(inner)
    }
}

fn active(inner: &Inner) -> Result<&Segment, CommitLogError> {
    inner.segments.last().ok_or(CommitLogError::Closed)
}

fn active_mut(inner: &mut Inner) -> Result<&mut Segment, CommitLogError> {
    inner.segments.last_mut().ok_or(CommitLogError::Closed)
}

fn list_base_offsets(dir: &Path) -> Result<BTreeSet<u64>, CommitLogError> {
    let mut base_offsets = BTreeSet::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let extension = path.extension().and_then(|e| e.to_str());
        if extension != Some(STORE_EXTENSION) && extension != Some(INDEX_EXTENSION) {
            continue;
        }
        if let Some(base_offset) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            base_offsets.insert(base_offset);
        }
    }

    Ok(base_offsets)
}

/// Concatenation of segment store files, each bounded by its size when the reader was created.
/// The framing is the store framing: `[u64 BE length][encoded record]`.
pub struct LogReader {
    readers: Vec<StoreReader>,
    current: usize,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(reader) = self.readers.get_mut(self.current) {
            let n = reader.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.current += 1;
        }

        Ok(0)
    }
}

/// Runs `f` on every segment, even after one fails. Returns the first failure.
fn for_each_segment(
    segments: Vec<Segment>,
    f: impl Fn(Segment) -> Result<(), CommitLogError>,
) -> Result<(), CommitLogError> {
    let mut first_error = None;
    for segment in segments {
        if let Err(e) = f(segment) {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::index::ENTRY_WIDTH;
    use crate::commitlog::store::LEN_WIDTH;
    use bytes::Buf;

    const VALUE: &[u8] = b"hello world";

    fn small_segments() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 32,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }

    #[test]
    fn append_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        assert_eq!(log.highest_offset().unwrap(), None);

        let offset = log.append(VALUE).unwrap();
        assert_eq!(offset, 0);

        let record = log.read(offset).unwrap();
        assert_eq!(&record.value[..], VALUE);
        assert_eq!(record.offset, 0);
        assert_eq!(log.highest_offset().unwrap(), Some(0));
    }

    #[test]
    fn out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();

        let err = log.read(1).unwrap_err();
        assert!(matches!(err, CommitLogError::OffsetOutOfRange { offset: 1 }));
    }

    #[test]
    fn rolls_over_maxed_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(
            dir.path(),
            SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH * 3,
                initial_offset: 16,
            },
        )
        .unwrap();

        for i in 0..4 {
            assert_eq!(log.append(VALUE).unwrap(), 16 + i);
        }
        assert_eq!(log.next_offset().unwrap(), 20);
        assert!(dir.path().join("19.store").exists());
        assert!(dir.path().join("19.index").exists());

        for offset in 16..20 {
            assert_eq!(log.read(offset).unwrap().offset, offset);
        }
    }

    #[test]
    fn init_with_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..3 {
            log.append(VALUE).unwrap();
        }
        log.close().unwrap();
        assert!(log.read(0).is_err());

        let log = Log::open(dir.path(), small_segments()).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 0);
        assert_eq!(log.highest_offset().unwrap(), Some(2));
        assert_eq!(log.append(VALUE).unwrap(), 3);
    }

    #[test]
    fn truncate_removes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..3 {
            log.append(VALUE).unwrap();
        }

        // Two records fill the first segment.
        log.truncate(2).unwrap();

        assert!(log.read(0).unwrap_err().is_out_of_range());
        assert!(log.read(1).unwrap_err().is_out_of_range());
        assert_eq!(log.lowest_offset().unwrap(), 2);
        assert_eq!(log.read(2).unwrap().offset, 2);
        // Offsets keep going after truncation.
        assert_eq!(log.append(VALUE).unwrap(), 3);
    }

    #[test]
    fn truncate_never_removes_the_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        log.append(VALUE).unwrap();

        log.truncate(100).unwrap();
        assert_eq!(log.next_offset().unwrap(), 1);
        assert_eq!(log.read(0).unwrap().offset, 0);
    }

    #[test]
    fn truncate_from_removes_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..5 {
            log.append(VALUE).unwrap();
        }

        log.truncate_from(2).unwrap();
        assert_eq!(log.highest_offset().unwrap(), Some(1));
        assert!(log.read(2).unwrap_err().is_out_of_range());

        assert_eq!(log.append(b"again".to_vec()).unwrap(), 2);
        assert_eq!(&log.read(2).unwrap().value[..], b"again");
    }

    #[test]
    fn reset_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..3 {
            log.append(VALUE).unwrap();
        }

        log.reset(42).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 42);
        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(log.append(VALUE).unwrap(), 42);
        assert!(!dir.path().join("0.store").exists());
    }

    #[test]
    fn reader_concatenates_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..3 {
            log.append(VALUE).unwrap();
        }

        let mut buf = Vec::new();
        log.reader().unwrap().read_to_end(&mut buf).unwrap();

        let mut buf = Bytes::from(buf);
        for offset in 0..3 {
            let len = buf.get_u64() as usize;
            let record = Record::decode(buf.split_to(len)).unwrap();
            assert_eq!(record.offset, offset);
            assert_eq!(&record.value[..], VALUE);
        }
        assert!(buf.len() < LEN_WIDTH as usize);
    }

    #[test]
    fn reset_removes_every_segment_even_if_one_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for _ in 0..6 {
            log.append(VALUE).unwrap();
        }
        let stores = |dir: &Path| {
            fs::read_dir(dir)
                .unwrap()
                .filter(|entry| entry.as_ref().unwrap().path().extension().unwrap() == "store")
                .count()
        };
        assert!(stores(dir.path()) >= 3);

        fs::remove_file(dir.path().join("0.store")).unwrap();
        assert!(log.reset(0).is_err());

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(matches!(log.append(VALUE), Err(CommitLogError::Closed)));
    }
}
