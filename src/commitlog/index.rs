use crate::commitlog::CommitLogError;
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const OFFSET_WIDTH: u64 = 4;
const POSITION_WIDTH: u64 = 8;
pub(crate) const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POSITION_WIDTH;

/// Index maps a record's offset (relative to the segment's base offset) to its position in the
/// store file.
///
/// Byte representation of one entry:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 10| 11|
/// +---+---+---+---+---+---+---+---+---+---+---+---+
/// | Rel offset(BE)|       Position (BE)           |
/// +---------------+-------------------------------+
/// ```
///
/// The file is grown to the max index size and memory mapped while open. Closing truncates it
/// back to the bytes in use, which is what the next open sees as the entry count (after
/// recovery validates it against the store).
pub(crate) struct Index {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    size: u64,
}

impl Index {
    pub(crate) fn open(path: &Path, max_index_bytes: u64) -> Result<Self, CommitLogError> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let size = file.metadata()?.len();

        // Never shrink below what is on disk, a smaller max must not drop existing entries.
        let mapped_len = std::cmp::max(size, max_index_bytes);
        file.set_len(mapped_len)?;

        // Safety: the file is owned by this index for its whole lifetime and only ever resized
        // after the map is dropped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Index {
            path: path.to_path_buf(),
            file,
            mmap,
            size: size - size % ENTRY_WIDTH,
        })
    }

    /// Number of entries the map has room for.
    pub(crate) fn capacity(&self) -> u64 {
        self.mmap.len() as u64 / ENTRY_WIDTH
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size + ENTRY_WIDTH > self.mmap.len() as u64
    }

    /// Reads entry `i`, regardless of whether it is within the used region. Recovery relies on
    /// this to inspect entries past `size`.
    pub(crate) fn entry(&self, i: u64) -> Result<(u32, u64), CommitLogError> {
        if i >= self.capacity() {
            return Err(CommitLogError::Corrupt(format!(
                "index entry {} is beyond capacity {}",
                i,
                self.capacity()
            )));
        }

        let start = (i * ENTRY_WIDTH) as usize;
        let mut offset = [0u8; OFFSET_WIDTH as usize];
        let mut position = [0u8; POSITION_WIDTH as usize];
        offset.copy_from_slice(&self.mmap[start..start + OFFSET_WIDTH as usize]);
        position.copy_from_slice(&self.mmap[start + OFFSET_WIDTH as usize..start + ENTRY_WIDTH as usize]);

        Ok((u32::from_be_bytes(offset), u64::from_be_bytes(position)))
    }

    pub(crate) fn write(&mut self, relative_offset: u32, position: u64) -> Result<(), CommitLogError> {
        if self.is_full() {
            return Err(CommitLogError::SegmentMaxed);
        }

        let start = self.size as usize;
        self.mmap[start..start + OFFSET_WIDTH as usize].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[start + OFFSET_WIDTH as usize..start + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;

        Ok(())
    }

    /// Sets the number of entries in use and zeroes everything after them, so stale entries can't
    /// be mistaken for valid ones by a later recovery.
    pub(crate) fn set_entries(&mut self, entries: u64) {
        let new_size = std::cmp::min(entries * ENTRY_WIDTH, self.mmap.len() as u64);
        let old_end = std::cmp::max(self.size, new_size) as usize;
        for b in self.mmap[new_size as usize..old_end].iter_mut() {
            *b = 0;
        }
        self.size = new_size;
    }

    pub(crate) fn flush(&self) -> Result<(), CommitLogError> {
        self.mmap.flush()?;
        Ok(())
    }

    pub(crate) fn close(self) -> Result<(), CommitLogError> {
        let Index { file, mmap, size, .. } = self;
        mmap.flush()?;
        drop(mmap);
        file.set_len(size)?;
        file.sync_all()?;
        Ok(())
    }

    pub(crate) fn remove(self) -> Result<(), CommitLogError> {
        let Index { path, file, mmap, .. } = self;
        drop(mmap);
        drop(file);
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_and_fill() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::open(&dir.path().join("0.index"), ENTRY_WIDTH * 2).unwrap();
        assert_eq!(index.size(), 0);

        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(index.is_full());
        assert!(matches!(index.write(2, 20), Err(CommitLogError::SegmentMaxed)));

        assert_eq!(index.entry(1).unwrap(), (1, 10));
        assert_eq!(index.size(), ENTRY_WIDTH * 2);
    }

    #[test]
    fn close_truncates_to_used_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");

        let mut index = Index::open(&path, 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();
        index.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), ENTRY_WIDTH * 2);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.size(), ENTRY_WIDTH * 2);
        assert_eq!(index.entry(1).unwrap(), (1, 19));
    }

    #[test]
    fn set_entries_zeroes_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::open(&dir.path().join("0.index"), 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();

        index.set_entries(1);
        assert_eq!(index.size(), ENTRY_WIDTH);
        assert_eq!(index.entry(1).unwrap(), (0, 0));
    }
}
