use crate::commitlog::{CommitLogError, Log, Record, LEN_WIDTH};
use crate::replica::{StateMachine, StateMachineError};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::io::{self, Read};
use std::sync::Arc;

/// First byte of every command proposed to consensus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RequestType {
    Append = 0,
}

impl TryFrom<u8> for RequestType {
    type Error = LogStateMachineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::Append),
            unknown => Err(LogStateMachineError::UnknownRequestType(unknown)),
        }
    }
}

/// `[RequestType::Append][prost Record]`
pub(crate) fn encode_append(record: &Record) -> Result<Bytes, CommitLogError> {
    let payload = record.encode()?;
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(RequestType::Append as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

pub(crate) fn decode_offset(output: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(output).ok().map(u64::from_be_bytes)
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LogStateMachineError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("unknown request type {0}")]
    UnknownRequestType(u8),
    #[error("commit log failure: {0}")]
    Log(#[from] CommitLogError),
    #[error("snapshot read failure: {0}")]
    Io(#[from] io::Error),
}

/// LogStateMachine applies committed append commands to the node's local commit log. Every node
/// applies the same commands in the same order, so offsets match across the cluster.
pub(crate) struct LogStateMachine {
    logger: slog::Logger,
    log: Arc<Log>,
    initial_offset: u64,
}

impl LogStateMachine {
    pub(crate) fn new(logger: slog::Logger, log: Arc<Log>, initial_offset: u64) -> Self {
        LogStateMachine {
            logger,
            log,
            initial_offset,
        }
    }

    fn apply_command(&mut self, command: Bytes) -> Result<Bytes, LogStateMachineError> {
        let request_type = command.first().copied().ok_or(LogStateMachineError::EmptyCommand)?;
        match RequestType::try_from(request_type)? {
            RequestType::Append => {
                let record = Record::decode(command.slice(1..))?;
                let offset = self.log.append(record.value)?;
                Ok(Bytes::copy_from_slice(&offset.to_be_bytes()))
            }
        }
    }

    fn restore_from(&mut self, mut snapshot: Box<dyn Read + Send>) -> Result<(), LogStateMachineError> {
        let first = match read_frame(snapshot.as_mut())? {
            Some(record) => record,
            None => {
                self.log.reset(self.initial_offset)?;
                return Ok(());
            }
        };

        self.log.reset(first.offset)?;
        self.log.append(first.value)?;
        let mut restored = 1u64;
        while let Some(record) = read_frame(snapshot.as_mut())? {
            self.log.append(record.value)?;
            restored += 1;
        }
        self.log.sync()?;

        slog::info!(
            self.logger,
            "Restored {} records starting at offset {}",
            restored,
            first.offset
        );
        Ok(())
    }
}

impl StateMachine for LogStateMachine {
    fn apply(&mut self, command: Bytes) -> Result<Bytes, StateMachineError> {
        Ok(self.apply_command(command)?)
    }

    fn snapshot(&mut self) -> Result<Box<dyn Read + Send>, StateMachineError> {
        Ok(Box::new(self.log.reader()?))
    }

    fn restore(&mut self, snapshot: Box<dyn Read + Send>) -> Result<(), StateMachineError> {
        Ok(self.restore_from(snapshot)?)
    }
}

/// Reads one `[u64 BE length][Record]` frame. None at a clean end of input.
fn read_frame(reader: &mut dyn Read) -> Result<Option<Record>, LogStateMachineError> {
    let mut len = [0u8; LEN_WIDTH as usize];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    // The buffer grows with the bytes actually read, not with what the prefix claims.
    let len = u64::from_be_bytes(len);
    let mut payload = Vec::new();
    reader.take(len).read_to_end(&mut payload)?;
    if payload.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("snapshot frame claims {} bytes, only {} left", len, payload.len()),
        )
        .into());
    }
    Ok(Some(Record::decode(payload.as_slice())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::SegmentConfig;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn small_segments() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 64,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }

    fn fsm(dir: &std::path::Path) -> (LogStateMachine, Arc<Log>) {
        let log = Arc::new(Log::open(dir, small_segments()).unwrap());
        (LogStateMachine::new(logger(), log.clone(), 0), log)
    }

    #[test]
    fn apply_appends_and_returns_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fsm, log) = fsm(dir.path());

        for expected in 0..3u64 {
            let command = encode_append(&Record::new(format!("record-{}", expected))).unwrap();
            let output = fsm.apply(command).unwrap();
            assert_eq!(decode_offset(&output), Some(expected));
        }

        assert_eq!(&log.read(1).unwrap().value[..], b"record-1");
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fsm, log) = fsm(dir.path());

        assert!(fsm.apply(Bytes::from_static(&[7, 1, 2])).is_err());
        assert!(fsm.apply(Bytes::new()).is_err());
        assert_eq!(log.highest_offset().unwrap(), None);
    }

    #[test]
    fn snapshot_restore_preserves_offsets() {
        let source_dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::open(source_dir.path(), small_segments().with_initial_offset(5)).unwrap());
        let mut source = LogStateMachine::new(logger(), log, 5);
        for i in 0..10 {
            source.apply(encode_append(&Record::new(format!("value-{}", i))).unwrap()).unwrap();
        }
        let snapshot = source.snapshot().unwrap();

        let target_dir = tempfile::tempdir().unwrap();
        let (mut target, target_log) = fsm(target_dir.path());
        target.apply(encode_append(&Record::new("stale")).unwrap()).unwrap();
        target.restore(snapshot).unwrap();

        assert_eq!(target_log.lowest_offset().unwrap(), 5);
        assert_eq!(target_log.highest_offset().unwrap(), Some(14));
        for i in 0..10u64 {
            let record = target_log.read(5 + i).unwrap();
            assert_eq!(record.value, Bytes::from(format!("value-{}", i)));
            assert_eq!(record.offset, 5 + i);
        }
    }

    #[test]
    fn truncated_snapshot_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fsm, _log) = fsm(dir.path());

        let mut snapshot = u64::MAX.to_be_bytes().to_vec();
        snapshot.extend_from_slice(b"short");

        match fsm.restore_from(Box::new(io::Cursor::new(snapshot))) {
            Err(LogStateMachineError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Unexpected restore result: {:?}", other),
        }
    }

    #[test]
    fn restore_from_empty_snapshot_resets() {
        let dir = tempfile::tempdir().unwrap();
        let (mut fsm, log) = fsm(dir.path());
        fsm.apply(encode_append(&Record::new("gone")).unwrap()).unwrap();

        fsm.restore(Box::new(io::empty())).unwrap();

        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(log.next_offset().unwrap(), 0);
    }
}
