use crate::replica::Term;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

/// Byte representation:
///
/// ```text
/// |                                             1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | 6 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|Knd|       Term (8 bytes, LE)      |   Data (variable size)      ... |
/// +---+---+-------------------------------+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Knd` - what the entry means to the replica (see [EntryKind])
/// * `Term` - raft leadership term when this entry was created
/// * `Data` - kind specific payload
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) kind: EntryKind,
    pub(crate) data: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Opaque state machine command.
    Command,
    /// Encoded cluster configuration.
    Configuration,
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
}

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8;

impl EntryKind {
    fn as_u8(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Configuration => 1,
            EntryKind::Noop => 2,
        }
    }

    fn from_u8(b: u8) -> Result<Self, EntryDecodeError> {
        match b {
            0 => Ok(EntryKind::Command),
            1 => Ok(EntryKind::Configuration),
            2 => Ok(EntryKind::Noop),
            other => Err(EntryDecodeError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EntryDecodeError {
    #[error("entry is {0} bytes, shorter than its header")]
    TooShort(usize),
    #[error("unsupported entry format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown entry kind {0}")]
    UnknownKind(u8),
}

impl WriteAheadLogEntry {
    pub(crate) fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        bytes.put_u8(FORMAT_VERSION);
        bytes.put_u8(self.kind.as_u8());
        bytes.put_u64_le(self.term.as_u64());
        bytes.put_slice(&self.data);
        bytes.freeze()
    }

    /// Wire form inside an AppendEntries request. The term travels next to it.
    pub(crate) fn wire_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.data.len());
        bytes.push(self.kind.as_u8());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub(crate) fn from_wire(term: Term, wire_data: Vec<u8>) -> Result<Self, EntryDecodeError> {
        let mut data = Bytes::from(wire_data);
        if data.is_empty() {
            return Err(EntryDecodeError::TooShort(0));
        }
        let kind = EntryKind::from_u8(data[0])?;
        let data = data.split_off(1);

        Ok(WriteAheadLogEntry { term, kind, data })
    }
}

impl TryFrom<Bytes> for WriteAheadLogEntry {
    type Error = EntryDecodeError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(EntryDecodeError::TooShort(bytes.len()));
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(EntryDecodeError::UnsupportedVersion(bytes[0]));
        }
        let kind = EntryKind::from_u8(bytes[1])?;

        let mut term = [0u8; 8];
        term.copy_from_slice(&bytes[2..HEADER_LEN]);
        let data = bytes.split_off(HEADER_LEN);

        Ok(WriteAheadLogEntry {
            term: Term::new(u64::from_le_bytes(term)),
            kind,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            kind: EntryKind::Configuration,
            data: Bytes::from_static(b"xyz"),
        };

        let bytes = entry.encode();
        assert_eq!(&bytes[..], &[1, 1, 0x02, 0x01, 0, 0, 0, 0, 0, 0, b'x', b'y', b'z']);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            WriteAheadLogEntry::try_from(Bytes::from_static(&[1, 0, 0])),
            Err(EntryDecodeError::TooShort(3))
        ));
        assert!(matches!(
            WriteAheadLogEntry::try_from(Bytes::from_static(&[1, 9, 0, 0, 0, 0, 0, 0, 0, 0])),
            Err(EntryDecodeError::UnknownKind(9))
        ));
        assert!(WriteAheadLogEntry::from_wire(Term::new(1), vec![]).is_err());
    }
}
