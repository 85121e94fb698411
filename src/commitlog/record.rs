use crate::commitlog::CommitLogError;
use crate::logapi;
use bytes::{Buf, Bytes};
use prost::Message;

/// Record is one entry of the commit log. The offset is assigned by the log on append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub value: Bytes,
    pub offset: u64,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Record {
            value: value.into(),
            offset: 0,
        }
    }

    /// Serialized form used inside store files and snapshots.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, CommitLogError> {
        let proto = logapi::Record::from(self.clone());
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .map_err(|e| CommitLogError::Corrupt(format!("record encoding failed: {}", e)))?;

        Ok(buf)
    }

    pub(crate) fn decode<B: Buf>(buf: B) -> Result<Self, CommitLogError> {
        let proto = logapi::Record::decode(buf)?;
        Ok(Record::from(proto))
    }
}

impl From<logapi::Record> for Record {
    fn from(proto: logapi::Record) -> Self {
        Record {
            value: Bytes::from(proto.value),
            offset: proto.offset,
        }
    }
}

impl From<Record> for logapi::Record {
    fn from(record: Record) -> Self {
        logapi::Record {
            value: record.value.to_vec(),
            offset: record.offset,
        }
    }
}
