mod config;
mod error;
mod index;
mod log;
mod record;
mod segment;
mod store;

pub use self::log::Log;
pub use self::log::LogReader;
pub use config::SegmentConfig;
pub use config::SegmentOptions;
pub use error::CommitLogError;
pub use record::Record;
pub(crate) use store::LEN_WIDTH;
