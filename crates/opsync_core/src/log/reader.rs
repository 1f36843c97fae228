//! Log replay.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{
    compute_crc32, LogRecord, LogRecordType, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION,
};

/// Iterates over the records in a log image.
///
/// - an incomplete final record ends iteration; [`LogReader::torn_tail`]
///   then reports where valid data stops
/// - a complete record with a bad checksum is a
///   [`CoreError::ChecksumMismatch`]
/// - bad magic, unknown versions and unknown types are
///   [`CoreError::LogCorruption`]
///
/// Iteration stops after the first error.
pub struct LogReader<'a> {
    data: &'a [u8],
    offset: usize,
    torn_tail: Option<u64>,
    finished: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over a full log image.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            torn_tail: None,
            finished: false,
        }
    }

    /// Offset at which an incomplete final record starts, if one was found.
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_tail
    }

    /// Offset just past the last record read.
    pub fn position(&self) -> u64 {
        self.offset as u64
    }

    fn read_record(&mut self) -> CoreResult<Option<(u64, LogRecord)>> {
        let start = self.offset;
        let remaining = &self.data[start..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len() < HEADER_SIZE {
            self.torn_tail = Some(start as u64);
            return Ok(None);
        }

        let offset = start as u64;
        if remaining[..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(offset, "bad record magic"));
        }
        let version = u16::from_le_bytes([remaining[4], remaining[5]]);
        if version != LOG_VERSION {
            return Err(CoreError::log_corruption(
                offset,
                format!("unsupported record version {version}"),
            ));
        }
        let record_type = LogRecordType::from_byte(remaining[6]).ok_or_else(|| {
            CoreError::log_corruption(offset, format!("unknown record type {}", remaining[6]))
        })?;
        let len = u32::from_le_bytes([remaining[7], remaining[8], remaining[9], remaining[10]]) as usize;

        let total = HEADER_SIZE + len + CRC_SIZE;
        if remaining.len() < total {
            self.torn_tail = Some(offset);
            return Ok(None);
        }

        let body = &remaining[..HEADER_SIZE + len];
        let crc_bytes = &remaining[HEADER_SIZE + len..total];
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }

        let record = LogRecord::decode_payload(record_type, offset, &body[HEADER_SIZE..])?;
        self.offset = start + total;
        Ok(Some((offset, record)))
    }
}

impl Iterator for LogReader<'_> {
    type Item = CoreResult<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{OperationType, Payload, QueueEntry};

    fn frame(name: &str) -> (QueueEntry, Vec<u8>) {
        let entry = QueueEntry::new(
            OperationType::Create,
            "products",
            None,
            Payload::new().with("name", name),
            1024,
        )
        .unwrap();
        let bytes = LogRecord::Put(entry.clone()).encode().unwrap();
        (entry, bytes)
    }

    #[test]
    fn reads_records_in_order() {
        let (a, mut log) = frame("a");
        let (b, b_bytes) = frame("b");
        let b_offset = log.len() as u64;
        log.extend_from_slice(&b_bytes);

        let records: Vec<_> = LogReader::new(&log).collect::<CoreResult<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 0);
        assert_eq!(records[0].1.entry(), &a);
        assert_eq!(records[1].0, b_offset);
        assert_eq!(records[1].1.entry(), &b);
    }

    #[test]
    fn torn_tail_ends_iteration() {
        let (_, mut log) = frame("a");
        let valid_len = log.len() as u64;
        let (_, partial) = frame("b");
        log.extend_from_slice(&partial[..partial.len() - 3]);

        let mut reader = LogReader::new(&log);
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
        assert_eq!(reader.torn_tail(), Some(valid_len));
        assert_eq!(reader.position(), valid_len);
    }

    #[test]
    fn short_header_is_torn() {
        let mut reader = LogReader::new(b"OPQ");
        assert!(reader.next().is_none());
        assert_eq!(reader.torn_tail(), Some(0));
    }

    #[test]
    fn flipped_byte_is_checksum_mismatch() {
        let (_, mut log) = frame("a");
        let (_, b) = frame("b");
        log.extend_from_slice(&b);
        log[HEADER_SIZE + 2] ^= 0xFF;

        let mut reader = LogReader::new(&log);
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { offset: 0, .. }));
        assert!(reader.next().is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let (_, mut log) = frame("a");
        log[0] = b'X';
        let err = LogReader::new(&log).next().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { offset: 0, .. }));
    }
}
