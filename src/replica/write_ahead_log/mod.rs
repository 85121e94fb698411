//! Raft-specific log on top of the segmented commit log. Entry offsets double as raft indexes.

mod log;
mod log_entry;

pub(crate) use self::log::index_as_u64;
pub(crate) use self::log::Index;
pub(crate) use self::log::WalError;
pub(crate) use self::log::WriteAheadLog;
pub(crate) use log_entry::EntryKind;
pub(crate) use log_entry::WriteAheadLogEntry;
