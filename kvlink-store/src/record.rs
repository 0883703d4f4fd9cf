//! Log records.
//!
//! Each record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+
//! | magic    | kind     | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 3 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+
//! | payload (JSON)                                       |
//! | length bytes                                         |
//! +------------------------------------------------------+
//! ```

use crate::error::StoreError;
use crate::store::WriteOp;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for log records: "KVLG"
pub const LOG_MAGIC: [u8; 4] = *b"KVLG";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Put = 1,
    Del = 2,
    Batch = 3,
}

impl TryFrom<u8> for RecordKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordKind::Put),
            2 => Ok(RecordKind::Del),
            3 => Ok(RecordKind::Batch),
            other => Err(other),
        }
    }
}

/// A complete log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub payload: Bytes,
}

impl LogRecord {
    /// Builds the record describing a single mutation.
    pub fn single(op: &WriteOp) -> Result<Self, StoreError> {
        let kind = match op {
            WriteOp::Put { .. } => RecordKind::Put,
            WriteOp::Del { .. } => RecordKind::Del,
        };
        Ok(Self {
            kind,
            payload: Bytes::from(serde_json::to_vec(op)?),
        })
    }

    /// Builds one record holding a whole batch.
    pub fn batch(ops: &[WriteOp]) -> Result<Self, StoreError> {
        Ok(Self {
            kind: RecordKind::Batch,
            payload: Bytes::from(serde_json::to_vec(ops)?),
        })
    }

    /// Decodes the mutations carried by this record.
    pub fn ops(&self) -> Result<Vec<WriteOp>, StoreError> {
        match self.kind {
            RecordKind::Batch => Ok(serde_json::from_slice(&self.payload)?),
            RecordKind::Put | RecordKind::Del => {
                Ok(vec![serde_json::from_slice(&self.payload)?])
            }
        }
    }

    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<BytesMut, StoreError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&LOG_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&[0u8; 3]);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(crc32c::crc32c(&self.payload));
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// `Ok(None)` means the buffer holds no complete record: either more
    /// data is needed, or the bytes are zero padding left by a torn write.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, StoreError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != LOG_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(StoreError::InvalidRecord {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let kind = RecordKind::try_from(buf[4]).map_err(|kind| StoreError::InvalidRecord {
            offset,
            reason: format!("unknown record kind: {}", kind),
        })?;
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StoreError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self { kind, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_roundtrip() {
        let op = WriteOp::put("user:1", "alice");
        let mut buf = LogRecord::single(&op).unwrap().encode().unwrap();

        let decoded = LogRecord::decode(&mut buf, 0).unwrap().unwrap();
        assert_eq!(decoded.kind, RecordKind::Put);
        assert_eq!(decoded.ops().unwrap(), vec![op]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_batch_record() {
        let ops = vec![WriteOp::put("a", "1"), WriteOp::del("b")];
        let record = LogRecord::batch(&ops).unwrap();
        let mut buf = record.encode().unwrap();
        assert_eq!(buf.len(), record.disk_size());

        let decoded = LogRecord::decode(&mut buf, 0).unwrap().unwrap();
        assert_eq!(decoded.kind, RecordKind::Batch);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_corrupted_payload() {
        let mut buf = LogRecord::single(&WriteOp::del("k"))
            .unwrap()
            .encode()
            .unwrap();
        let len = buf.len();
        buf[len - 1] ^= 0xFF;

        assert!(matches!(
            LogRecord::decode(&mut buf, 64),
            Err(StoreError::CorruptedRecord { offset: 64, .. })
        ));
    }

    #[test]
    fn test_partial_and_padding() {
        let encoded = LogRecord::single(&WriteOp::put("k", "v"))
            .unwrap()
            .encode()
            .unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(LogRecord::decode(&mut partial, 0).unwrap().is_none());

        let mut zeros = BytesMut::from(&[0u8; 32][..]);
        assert!(LogRecord::decode(&mut zeros, 0).unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = LogRecord::single(&WriteOp::put("k", "v"))
            .unwrap()
            .encode()
            .unwrap();
        buf[4] = 9;
        assert!(matches!(
            LogRecord::decode(&mut buf, 0),
            Err(StoreError::InvalidRecord { .. })
        ));
    }
}
