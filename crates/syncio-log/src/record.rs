//! Intent log record framing
//!
//! Record format:
//! ```text
//! +--------+------+--------+--------+------+--------+
//! | Magic  | Kind | TxnID  | Length | Data | CRC32C |
//! | 4B     | 1B   | 8B     | 4B     | var  | 4B     |
//! +--------+------+--------+--------+------+--------+
//! ```
//!
//! Operational records (destroy, setattr) belong to a local
//! transaction and only count as durable once that transaction's
//! commit record follows them in the log. Generation markers, cancel
//! tombstones, commit and abort records are autonomous: they are
//! durable as soon as they are on disk.

use syncio_common::{Error, Generation, ObjectAttrs, ObjectGroup, ObjectId, Result};

/// Intent record magic number
pub const RECORD_MAGIC: u32 = 0x53594C52; // "SYLR"

/// Record header size (magic + kind + txn_id + length)
pub const RECORD_HEADER_SIZE: usize = 17;

/// CRC trailer size
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Largest payload any record kind can carry (setattr: 24 bytes)
pub const MAX_PAYLOAD_SIZE: usize = 24;

/// Worst-case on-disk size of a single record
pub const MAX_RECORD_SIZE: usize = RECORD_HEADER_SIZE + MAX_PAYLOAD_SIZE + RECORD_TRAILER_SIZE;

/// Record kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Destroy an object on the target
    Destroy = 1,
    /// Change object ownership attributes on the target
    SetAttr = 2,
    /// Process-incarnation sentinel bounding replay
    Generation = 3,
    /// Tombstone cancelling an earlier record by log offset
    Cancel = 4,
    /// Local transaction committed
    Commit = 5,
    /// Local transaction aborted
    Abort = 6,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Destroy),
            2 => Some(Self::SetAttr),
            3 => Some(Self::Generation),
            4 => Some(Self::Cancel),
            5 => Some(Self::Commit),
            6 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// A single intent log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentRecord {
    /// Destroy the object on the target
    Destroy { id: ObjectId, group: ObjectGroup },
    /// Apply ownership attributes to the object on the target
    SetAttr {
        id: ObjectId,
        group: ObjectGroup,
        attrs: ObjectAttrs,
    },
    /// Sentinel marking the start of one process incarnation
    Generation { generation: Generation },
    /// Cancel the record at `offset`
    Cancel { offset: u64 },
    /// End of a committed local transaction
    Commit,
    /// End of an aborted local transaction
    Abort,
}

impl IntentRecord {
    /// Kind tag of this record
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Destroy { .. } => RecordKind::Destroy,
            Self::SetAttr { .. } => RecordKind::SetAttr,
            Self::Generation { .. } => RecordKind::Generation,
            Self::Cancel { .. } => RecordKind::Cancel,
            Self::Commit => RecordKind::Commit,
            Self::Abort => RecordKind::Abort,
        }
    }

    /// True for records that replicate a mutation to the target
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Destroy { .. } | Self::SetAttr { .. })
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Destroy { id, group } => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&id.raw().to_le_bytes());
                buf.extend_from_slice(&group.raw().to_le_bytes());
                buf
            }
            Self::SetAttr { id, group, attrs } => {
                let mut buf = Vec::with_capacity(24);
                buf.extend_from_slice(&id.raw().to_le_bytes());
                buf.extend_from_slice(&group.raw().to_le_bytes());
                buf.extend_from_slice(&attrs.uid.to_le_bytes());
                buf.extend_from_slice(&attrs.gid.to_le_bytes());
                buf
            }
            Self::Generation { generation } => generation.as_bytes().to_vec(),
            Self::Cancel { offset } => offset.to_le_bytes().to_vec(),
            Self::Commit | Self::Abort => Vec::new(),
        }
    }

    fn from_payload(kind: RecordKind, data: &[u8]) -> Result<Self> {
        let need = |n: usize| -> Result<()> {
            if data.len() < n {
                return Err(Error::corrupt(format!(
                    "record payload too small: {} < {}",
                    data.len(),
                    n
                )));
            }
            Ok(())
        };

        match kind {
            RecordKind::Destroy => {
                need(16)?;
                Ok(Self::Destroy {
                    id: ObjectId::new(u64::from_le_bytes(data[0..8].try_into().unwrap())),
                    group: ObjectGroup::new(u64::from_le_bytes(data[8..16].try_into().unwrap())),
                })
            }
            RecordKind::SetAttr => {
                need(24)?;
                Ok(Self::SetAttr {
                    id: ObjectId::new(u64::from_le_bytes(data[0..8].try_into().unwrap())),
                    group: ObjectGroup::new(u64::from_le_bytes(data[8..16].try_into().unwrap())),
                    attrs: ObjectAttrs::new(
                        u32::from_le_bytes(data[16..20].try_into().unwrap()),
                        u32::from_le_bytes(data[20..24].try_into().unwrap()),
                    ),
                })
            }
            RecordKind::Generation => {
                need(16)?;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&data[0..16]);
                Ok(Self::Generation {
                    generation: Generation::from_bytes(bytes),
                })
            }
            RecordKind::Cancel => {
                need(8)?;
                Ok(Self::Cancel {
                    offset: u64::from_le_bytes(data[0..8].try_into().unwrap()),
                })
            }
            RecordKind::Commit => Ok(Self::Commit),
            RecordKind::Abort => Ok(Self::Abort),
        }
    }
}

/// A framed record: intent payload plus the owning transaction id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedRecord {
    pub txn_id: u64,
    pub record: IntentRecord,
}

impl FramedRecord {
    /// Frame a record under a transaction id (0 for autonomous records)
    #[must_use]
    pub fn new(txn_id: u64, record: IntentRecord) -> Self {
        Self { txn_id, record }
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.record.payload();
        let mut buf =
            Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_TRAILER_SIZE);

        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.push(self.record.kind() as u8);
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Parse one record from the front of `data`, returning it and the
    /// number of bytes consumed
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
            return Err(Error::corrupt("record too small"));
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != RECORD_MAGIC {
            return Err(Error::corrupt("invalid record magic"));
        }

        let kind =
            RecordKind::from_u8(data[4]).ok_or_else(|| Error::corrupt("invalid record kind"))?;
        let txn_id = u64::from_le_bytes(data[5..13].try_into().unwrap());
        let payload_len = u32::from_le_bytes(data[13..17].try_into().unwrap()) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::corrupt(format!(
                "record payload length {payload_len} out of range"
            )));
        }

        let total_len = RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE;
        if data.len() < total_len {
            return Err(Error::corrupt("record truncated"));
        }

        let stored_crc = u32::from_le_bytes(
            data[RECORD_HEADER_SIZE + payload_len..total_len]
                .try_into()
                .unwrap(),
        );
        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + payload_len]);
        if computed_crc != stored_crc {
            return Err(Error::corrupt("record CRC mismatch"));
        }

        let record = IntentRecord::from_payload(
            kind,
            &data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len],
        )?;

        Ok((Self { txn_id, record }, total_len))
    }

    /// Serialized size of this record
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.record.payload().len() + RECORD_TRAILER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_roundtrip() {
        let framed = FramedRecord::new(
            7,
            IntentRecord::Destroy {
                id: ObjectId::new(77),
                group: ObjectGroup::new(2),
            },
        );
        let bytes = framed.to_bytes();
        let (parsed, consumed) = FramedRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, framed);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_setattr_roundtrip() {
        let framed = FramedRecord::new(
            3,
            IntentRecord::SetAttr {
                id: ObjectId::new(12),
                group: ObjectGroup::new(0),
                attrs: ObjectAttrs::new(1000, 1000),
            },
        );
        let (parsed, _) = FramedRecord::from_bytes(&framed.to_bytes()).unwrap();
        assert_eq!(parsed, framed);
    }

    #[test]
    fn test_generation_roundtrip() {
        let generation = Generation::new();
        let framed = FramedRecord::new(0, IntentRecord::Generation { generation });
        let (parsed, _) = FramedRecord::from_bytes(&framed.to_bytes()).unwrap();
        assert_eq!(parsed.record, IntentRecord::Generation { generation });
    }

    #[test]
    fn test_bad_magic_rejected() {
        let framed = FramedRecord::new(0, IntentRecord::Commit);
        let mut bytes = framed.to_bytes();
        bytes[0] ^= 0xFF;
        assert!(FramedRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let framed = FramedRecord::new(
            1,
            IntentRecord::Destroy {
                id: ObjectId::new(1),
                group: ObjectGroup::new(0),
            },
        );
        let mut bytes = framed.to_bytes();
        let flip = RECORD_HEADER_SIZE + 2;
        bytes[flip] ^= 0xFF;
        assert!(FramedRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let framed = FramedRecord::new(
            1,
            IntentRecord::Cancel { offset: 4096 },
        );
        let bytes = framed.to_bytes();
        assert!(FramedRecord::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_max_record_size_covers_all_kinds() {
        let records = [
            IntentRecord::Destroy {
                id: ObjectId::new(u64::MAX),
                group: ObjectGroup::new(u64::MAX),
            },
            IntentRecord::SetAttr {
                id: ObjectId::new(u64::MAX),
                group: ObjectGroup::new(u64::MAX),
                attrs: ObjectAttrs::new(u32::MAX, u32::MAX),
            },
            IntentRecord::Generation {
                generation: Generation::new(),
            },
            IntentRecord::Cancel { offset: u64::MAX },
            IntentRecord::Commit,
            IntentRecord::Abort,
        ];
        for record in records {
            let framed = FramedRecord::new(u64::MAX, record);
            assert!(framed.serialized_size() <= MAX_RECORD_SIZE);
        }
    }
}
