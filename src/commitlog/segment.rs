use crate::commitlog::index::Index;
use crate::commitlog::store::{Store, StoreReader};
use crate::commitlog::{CommitLogError, Record, SegmentConfig};
use bytes::Bytes;
use std::path::{Path, PathBuf};

pub(crate) const STORE_EXTENSION: &str = "store";
pub(crate) const INDEX_EXTENSION: &str = "index";

/// Segment pairs a store and an index covering offsets `[base_offset, next_offset)`.
pub(crate) struct Segment {
    base_offset: u64,
    next_offset: u64,
    store: Store,
    index: Index,
    config: SegmentConfig,
}

impl Segment {
    pub(crate) fn open(dir: &Path, base_offset: u64, config: SegmentConfig) -> Result<Self, CommitLogError> {
        let store = Store::open(&segment_path(dir, base_offset, STORE_EXTENSION))?;
        let index = Index::open(&segment_path(dir, base_offset, INDEX_EXTENSION), config.max_index_bytes)?;

        let mut segment = Segment {
            base_offset,
            next_offset: base_offset,
            store,
            index,
            config,
        };
        segment.recover()?;

        Ok(segment)
    }

    /// Recomputes the valid entry count. An index that was never closed cleanly is still at its
    /// pre-allocated size, so its length can't be trusted. Entry `i` is valid when it points at
    /// the record directly after entry `i - 1` and that record is fully contained in the store.
    fn recover(&mut self) -> Result<(), CommitLogError> {
        let mut entries = 0;
        let mut store_end = 0;

        while entries < self.index.capacity() {
            let (relative_offset, position) = self.index.entry(entries)?;
            if relative_offset as u64 != entries || position != store_end {
                break;
            }
            match self.store.record_end(position)? {
                Some(end) => store_end = end,
                None => break,
            }
            entries += 1;
        }

        self.index.set_entries(entries);
        if self.store.size() > store_end {
            self.store.truncate(store_end)?;
        }
        self.next_offset = self.base_offset + entries;

        Ok(())
    }

    pub(crate) fn append(&mut self, value: Bytes) -> Result<u64, CommitLogError> {
        if self.index.is_full() || self.index.size() >= self.config.max_index_bytes {
            return Err(CommitLogError::SegmentMaxed);
        }

        let offset = self.next_offset;
        let record = Record { value, offset };
        let (_, position) = self.store.append(&record.encode()?)?;
        self.index.write((offset - self.base_offset) as u32, position)?;
        self.next_offset += 1;

        Ok(offset)
    }

    pub(crate) fn read(&self, offset: u64) -> Result<Record, CommitLogError> {
        if !self.contains(offset) {
            return Err(CommitLogError::OffsetOutOfRange { offset });
        }

        let (_, position) = self.index.entry(offset - self.base_offset)?;
        let record = Record::decode(self.store.read(position)?)?;
        if record.offset != offset {
            return Err(CommitLogError::Corrupt(format!(
                "expected offset {} at position {}, found {}",
                offset, position, record.offset
            )));
        }

        Ok(record)
    }

    /// Drops every record `>= offset` held by this segment.
    pub(crate) fn truncate_from(&mut self, offset: u64) -> Result<(), CommitLogError> {
        if offset >= self.next_offset {
            return Ok(());
        }

        let offset = std::cmp::max(offset, self.base_offset);
        let relative_offset = offset - self.base_offset;
        let (_, position) = self.index.entry(relative_offset)?;

        self.index.set_entries(relative_offset);
        self.index.flush()?;
        self.store.truncate(position)?;
        self.store.sync()?;
        self.next_offset = offset;

        Ok(())
    }

    pub(crate) fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.is_full()
            || self.index.size() >= self.config.max_index_bytes
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub(crate) fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    pub(crate) fn reader(&self) -> Result<StoreReader, CommitLogError> {
        self.store.reader()
    }

    pub(crate) fn sync(&self) -> Result<(), CommitLogError> {
        self.index.flush()?;
        self.store.sync()
    }

    pub(crate) fn close(self) -> Result<(), CommitLogError> {
        let index = self.index.close();
        let store = self.store.close();
        index.and(store)
    }

    pub(crate) fn remove(self) -> Result<(), CommitLogError> {
        let index = self.index.remove();
        let store = self.store.remove();
        index.and(store)
    }
}

fn segment_path(dir: &Path, base_offset: u64, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", base_offset, extension))
}
