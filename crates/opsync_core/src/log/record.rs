//! Queue log record framing.
//!
//! ```text
//! magic "OPQL" (4) | version u16 (2) | type u8 (1) | len u32 (4) | payload | crc32 (4)
//! ```
//!
//! All integers are little-endian. The CRC covers everything before it.

use crate::error::{CoreError, CoreResult};
use opsync_codec::{from_cbor, to_cbor};
use opsync_protocol::QueueEntry;

/// Magic bytes opening every record.
pub const LOG_MAGIC: [u8; 4] = *b"OPQL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Full snapshot of an entry.
    Put = 1,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// The entry's state as of this write.
    Put(QueueEntry),
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Put(_) => LogRecordType::Put,
        }
    }

    /// The entry carried by the record.
    pub fn entry(&self) -> &QueueEntry {
        match self {
            Self::Put(entry) => entry,
        }
    }

    /// Consumes the record, returning its entry.
    pub fn into_entry(self) -> QueueEntry {
        match self {
            Self::Put(entry) => entry,
        }
    }

    /// Encodes the record with its envelope and checksum.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = match self {
            Self::Put(entry) => to_cbor(entry)?,
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::log_corruption(0, "record payload exceeds 4 GiB"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Decodes a record payload of the given type.
    pub fn decode_payload(record_type: LogRecordType, offset: u64, payload: &[u8]) -> CoreResult<Self> {
        match record_type {
            LogRecordType::Put => {
                let entry: QueueEntry = from_cbor(payload).map_err(|e| {
                    CoreError::log_corruption(offset, format!("undecodable entry: {e}"))
                })?;
                Ok(Self::Put(entry))
            }
        }
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
