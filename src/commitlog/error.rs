use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CommitLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Expected by streaming readers that are ahead of the log. Hard error for one-shot reads.
    #[error("offset {offset} is out of range")]
    OffsetOutOfRange { offset: u64 },

    // Rollover signal from a segment. The log handles this internally.
    #[error("segment is maxed")]
    SegmentMaxed,

    #[error("corrupt log data: {0}")]
    Corrupt(String),

    #[error("failed to decode record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid log configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("log is closed")]
    Closed,

    #[error("log lock poisoned")]
    LockPoisoned,
}

impl CommitLogError {
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, CommitLogError::OffsetOutOfRange { .. })
    }
}
