//! The append-only queue log.
//!
//! Every write to the queue appends a full snapshot of the entry. Replay
//! keeps the last snapshot per client id.

mod reader;
mod record;
mod writer;

pub use reader::LogReader;
pub use record::{compute_crc32, LogRecord, LogRecordType, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
pub use writer::{QueueLog, Replay};
