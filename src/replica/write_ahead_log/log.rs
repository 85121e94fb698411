use crate::commitlog::{self, CommitLogError, SegmentConfig};
use crate::replica::write_ahead_log::log_entry::{EntryDecodeError, WriteAheadLogEntry};
use crate::replica::Term;
use std::convert::TryFrom;
use std::fmt;
use std::path::Path;

/// Index is an index of an entry in the raft log. Raft indexes start at 1, so "no index" is
/// modeled as `Option<Index>` rather than 0.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Index(u64);

impl Index {
    /// Returns None for 0.
    pub(crate) fn new(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Index(index))
        }
    }

    pub(crate) fn start_index() -> Self {
        Index(1)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn plus(&self, n: u64) -> Self {
        Index(self.0 + n)
    }

    pub(crate) fn checked_minus(&self, n: u64) -> Option<Self> {
        self.0.checked_sub(n).and_then(Index::new)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn index_as_u64(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WalError {
    #[error("log failure: {0}")]
    Log(#[from] CommitLogError),
    #[error("malformed log entry: {0}")]
    Decode(#[from] EntryDecodeError),
    #[error("malformed configuration entry: {0}")]
    Configuration(#[from] prost::DecodeError),
    #[error("log entry {0:?} is missing")]
    MissingEntry(Index),
    #[error("refusing to truncate committed entry {index:?} (commit index {commit_index:?})")]
    TruncateCommitted { index: Index, commit_index: Index },
}

/// WriteAheadLog is the raft-specific log facade over a commit log whose offsets are raft indexes.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries up to the snapshot boundary may have been removed from disk. The boundary's own term is
/// remembered so consistency checks against it still work.
pub(crate) struct WriteAheadLog {
    logger: slog::Logger,
    log: commitlog::Log,
    // Metadata about the highest log entry that we've locally written (or the snapshot boundary).
    latest_entry_metadata: Option<(Term, Index)>,
    snapshot_boundary: Option<(Term, Index)>,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl WriteAheadLog {
    pub(crate) fn open(logger: slog::Logger, dir: &Path, segment_config: SegmentConfig) -> Result<Self, WalError> {
        let log = commitlog::Log::open(dir, segment_config.with_initial_offset(Index::start_index().as_u64()))?;

        let mut wal = WriteAheadLog {
            logger,
            log,
            latest_entry_metadata: None,
            snapshot_boundary: None,
            commit_index: None,
            last_applied_index: None,
        };

        if let Some(highest) = wal.log.highest_offset()?.and_then(Index::new) {
            let entry = wal.read_required(highest)?;
            wal.latest_entry_metadata = Some((entry.term, highest));
        }
        slog::info!(wal.logger, "Opened write-ahead log. Latest entry: {:?}", wal.latest_entry_metadata);

        Ok(wal)
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    /// First index still readable from disk.
    pub(crate) fn first_index(&self) -> Result<Index, WalError> {
        Ok(Index::new(self.log.lowest_offset()?).unwrap_or_else(Index::start_index))
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, WalError> {
        match self.log.read(index.as_u64()) {
            Ok(record) => Ok(Some(WriteAheadLogEntry::try_from(record.value)?)),
            Err(e) if e.is_out_of_range() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, WalError> {
        self.read(index)?.ok_or(WalError::MissingEntry(index))
    }

    /// Term of the entry at `index`, including the snapshot boundary. None if unknown.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, WalError> {
        if let Some((term, snapshot_index)) = self.snapshot_boundary {
            if snapshot_index == index {
                return Ok(Some(term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Reads up to `max` consecutive entries starting at `index`.
    pub(crate) fn entries_from(&self, index: Index, max: usize) -> Result<Vec<WriteAheadLogEntry>, WalError> {
        let mut entries = Vec::new();
        let mut next = index;
        while entries.len() < max {
            match self.read(next)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            next = next.plus(1);
        }

        Ok(entries)
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, WalError> {
        let appended_term = entry.term;
        let offset = self.log.append(entry.encode())?;
        let appended_index = Index::new(offset).ok_or(WalError::MissingEntry(Index::start_index()))?;

        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), WalError> {
        if let Some(commit_index) = self.commit_index {
            if index <= commit_index {
                return Err(WalError::TruncateCommitted { index, commit_index });
            }
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        self.log.truncate_from(index.as_u64())?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    /// Records that everything up to and including `index` lives in a snapshot.
    pub(crate) fn set_snapshot_boundary(&mut self, term: Term, index: Index) {
        self.snapshot_boundary = Some((term, index));

        if self.latest_entry_metadata.map(|(_, i)| i < index).unwrap_or(true) {
            self.latest_entry_metadata = Some((term, index));
        }
        if self.commit_index.map(|ci| ci < index).unwrap_or(true) {
            self.commit_index = Some(index);
        }
        if self.last_applied_index.map(|la| la < index).unwrap_or(true) {
            self.last_applied_index = Some(index);
        }
    }

    /// Drops whole segments that only hold entries up to and including `index`.
    pub(crate) fn compact_through(&mut self, index: Index) -> Result<(), WalError> {
        self.log.truncate(index.plus(1).as_u64())?;
        Ok(())
    }

    /// Throws away the whole log. The next entry appended will be `index + 1`.
    pub(crate) fn reset_to_snapshot(&mut self, term: Term, index: Index) -> Result<(), WalError> {
        self.log.reset(index.plus(1).as_u64())?;

        self.latest_entry_metadata = Some((term, index));
        self.snapshot_boundary = Some((term, index));
        self.commit_index = Some(index);
        self.last_applied_index = Some(index);

        Ok(())
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, WalError> {
        if !self.is_commit_index_increase(tentative_new_commit_index) {
            return Ok(false);
        }

        if self.term_at(tentative_new_commit_index)? != Some(current_term) {
            return Ok(false);
        }

        self.commit_index.replace(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower side: the leader told us what is committed. Never moves backwards and never
    /// past our own log.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        let new_commit_index = match self.latest_entry_metadata {
            Some((_, latest)) => std::cmp::min(latest, new_commit_index),
            None => return false,
        };
        if !self.is_commit_index_increase(new_commit_index) {
            return false;
        }

        self.commit_index.replace(new_commit_index);
        true
    }

    fn is_commit_index_increase(&self, new_commit_index: Index) -> bool {
        match self.commit_index {
            Some(current) if new_commit_index <= current => false,
            _ => match self.latest_entry_metadata {
                Some((_, latest)) => new_commit_index <= latest,
                None => false,
            },
        }
    }

    /// Next committed index that has not been applied, if any.
    pub(crate) fn next_to_apply(&self) -> Option<Index> {
        let next = self
            .last_applied_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        match self.commit_index {
            Some(commit_index) if next <= commit_index => Some(next),
            _ => None,
        }
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.last_applied_index = Some(index);
    }

    /// Number of applied entries not yet covered by a snapshot.
    pub(crate) fn applied_since_snapshot(&self) -> u64 {
        index_as_u64(self.last_applied_index).saturating_sub(index_as_u64(self.snapshot_boundary.map(|(_, i)| i)))
    }

    pub(crate) fn close(&self) -> Result<(), WalError> {
        self.log.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::write_ahead_log::EntryKind;
    use bytes::Bytes;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn entry(term: u64, data: &'static [u8]) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            kind: EntryKind::Command,
            data: Bytes::from_static(data),
        }
    }

    fn index(i: u64) -> Index {
        Index::new(i).unwrap()
    }

    #[test]
    fn offsets_are_raft_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        assert_eq!(wal.latest_entry(), None);

        assert_eq!(wal.append(entry(1, b"a")).unwrap(), index(1));
        assert_eq!(wal.append(entry(2, b"b")).unwrap(), index(2));
        assert_eq!(wal.latest_entry(), Some((Term::new(2), index(2))));
        assert_eq!(wal.read(index(1)).unwrap(), Some(entry(1, b"a")));
        assert_eq!(wal.read(index(3)).unwrap(), None);
        wal.close().unwrap();

        let wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(2), index(2))));
    }

    #[test]
    fn truncate_rewinds_latest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        for term in 1..=3 {
            wal.append(entry(term, b"x")).unwrap();
        }

        wal.truncate(index(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), index(1))));
        assert_eq!(wal.append(entry(4, b"y")).unwrap(), index(2));
    }

    #[test]
    fn commit_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        wal.append(entry(1, b"a")).unwrap();
        wal.append(entry(2, b"b")).unwrap();

        // Entry from an older term can't be committed by counting replicas.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(index(1), Term::new(2)).unwrap());
        assert!(wal.ratchet_fwd_commit_index_if_valid(index(2), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), Some(index(2)));

        assert!(matches!(wal.truncate(index(2)), Err(WalError::TruncateCommitted { .. })));

        assert_eq!(wal.next_to_apply(), Some(index(1)));
        wal.mark_applied(index(1));
        wal.mark_applied(index(2));
        assert_eq!(wal.next_to_apply(), None);
    }

    #[test]
    fn follower_commit_is_capped_by_local_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        assert!(!wal.ratchet_fwd_commit_index(index(5)));

        wal.append(entry(1, b"a")).unwrap();
        assert!(wal.ratchet_fwd_commit_index(index(5)));
        assert_eq!(wal.commit_index(), Some(index(1)));
    }

    #[test]
    fn reset_to_snapshot_moves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::open(logger(), dir.path(), SegmentConfig::default()).unwrap();
        wal.append(entry(1, b"a")).unwrap();

        wal.reset_to_snapshot(Term::new(3), index(10)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(3), index(10))));
        assert_eq!(wal.term_at(index(10)).unwrap(), Some(Term::new(3)));
        assert_eq!(wal.read(index(1)).unwrap(), None);
        assert_eq!(wal.next_to_apply(), None);
        assert_eq!(wal.append(entry(3, b"b")).unwrap(), index(11));
    }
}
