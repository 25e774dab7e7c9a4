//! Durable intent log
//!
//! Append-only log of mutations the metadata node has performed
//! locally but the storage target has not yet durably applied. Records
//! are written inside the caller's local transaction and only count as
//! durable once the transaction's commit record reaches the log.
//! Cancellation appends a tombstone rather than rewriting the record,
//! so the file is strictly append-only.
//!
//! Replay scans the log in order, resolves commit/abort/tombstone
//! state, and stops at the generation marker of the current process
//! incarnation: everything before the marker belongs to previous
//! incarnations and must be re-dispatched, everything after is already
//! tracked in memory.

use crate::record::{FramedRecord, IntentRecord, MAX_RECORD_SIZE, RECORD_HEADER_SIZE};
use crate::txn::Txn;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use syncio_common::{Error, Generation, LogConfig, Result};
use tracing::{debug, info, warn};

/// Log header magic number
const LOG_HEADER_MAGIC: u32 = 0x53594C48; // "SYLH"

/// Log format version
const LOG_VERSION: u32 = 1;

/// Reserved header region at the start of the file
const LOG_HEADER_SIZE: u64 = 4096;

/// Serialized header length (magic + version + write_offset + crc)
const HEADER_LEN: usize = 20;

/// On-disk log header
#[derive(Debug, Clone)]
struct LogHeader {
    write_offset: u64,
}

impl LogHeader {
    fn new() -> Self {
        Self {
            write_offset: LOG_HEADER_SIZE,
        }
    }

    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_HEADER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.write_offset.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..16]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::corrupt("log header too small"));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != LOG_HEADER_MAGIC {
            return Err(Error::corrupt("invalid log header magic"));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != LOG_VERSION {
            return Err(Error::corrupt(format!("unsupported log version {version}")));
        }
        let write_offset = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(data[16..20].try_into().unwrap());
        if crc32c::crc32c(&data[..16]) != stored_crc {
            return Err(Error::corrupt("log header checksum mismatch"));
        }
        if write_offset < LOG_HEADER_SIZE {
            return Err(Error::corrupt("log header write offset out of range"));
        }
        Ok(Self { write_offset })
    }
}

/// Capability-scoped handle to one durable record.
///
/// Returned by [`IntentLog::append`] and consumed exactly once by
/// [`IntentLog::cancel`]. Deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Cookie {
    offset: u64,
}

impl Cookie {
    pub(crate) fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Reconstruct a cookie from a raw log offset (internal use only:
    /// the offset must reference a real operational record)
    #[must_use]
    pub fn new_unchecked(offset: u64) -> Self {
        Self { offset }
    }

    /// Log offset of the referenced record
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// A live operational record rediscovered by replay
#[derive(Debug)]
pub struct ReplayEntry {
    /// Handle for the eventual cancellation
    pub cookie: Cookie,
    /// The pending mutation
    pub record: IntentRecord,
}

/// Mutable log state shared across writers
struct LogState {
    header: LogHeader,
    /// Bytes promised to declared-but-not-yet-appended records
    declared: u64,
}

/// Append-only durable intent log
pub struct IntentLog {
    file: File,
    state: Mutex<LogState>,
    config: LogConfig,
}

impl IntentLog {
    /// Create a new log at the given path
    pub fn create(path: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = LogHeader::new();
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync_data()?;

        info!(path = %path.as_ref().display(), "created intent log");
        Ok(Self {
            file,
            state: Mutex::new(LogState {
                header,
                declared: 0,
            }),
            config,
        })
    }

    /// Open an existing log
    pub fn open(path: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact_at(&mut buf, 0)?;
        let header = LogHeader::from_bytes(&buf)?;

        info!(
            path = %path.as_ref().display(),
            write_offset = header.write_offset,
            "opened intent log"
        );
        Ok(Self {
            file,
            state: Mutex::new(LogState {
                header,
                declared: 0,
            }),
            config,
        })
    }

    /// Open the log if it exists, create it otherwise
    pub fn open_or_create(path: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    /// Reserve log space for one record inside `txn`.
    ///
    /// After a successful declare, the matching [`append`] cannot fail
    /// for space reasons. The reservation is released by commit or
    /// abort if it goes unused.
    ///
    /// [`append`]: Self::append
    pub fn declare(&self, txn: &mut Txn) -> Result<()> {
        let mut state = self.state.lock();
        // Headroom: the declared record, the txn's commit record, and
        // one future cancel tombstone.
        let required = state.declared + 3 * MAX_RECORD_SIZE as u64;
        let available = self.config.max_size.saturating_sub(state.header.write_offset);
        if required > available {
            return Err(Error::LogFull {
                required,
                available,
            });
        }
        state.declared += MAX_RECORD_SIZE as u64;
        txn.declared += 1;
        Ok(())
    }

    /// Append an operational record inside `txn`.
    ///
    /// The record's bytes are written immediately, but the record only
    /// becomes durable (and visible to replay) once the transaction
    /// commits. Returns the cookie used later for cancellation.
    pub fn append(&self, txn: &mut Txn, record: IntentRecord) -> Result<Cookie> {
        if !record.is_operational() {
            return Err(Error::fault(format!(
                "append of non-operational record {:?}",
                record.kind()
            )));
        }
        if txn.declared == 0 {
            return Err(Error::Undeclared(format!("{:?}", record.kind())));
        }

        let framed = FramedRecord::new(txn.id, record);
        let bytes = framed.to_bytes();

        let offset = {
            let mut state = self.state.lock();
            let offset = state.header.write_offset;
            state.header.write_offset += bytes.len() as u64;
            state.declared -= MAX_RECORD_SIZE as u64;
            offset
        };
        txn.declared -= 1;

        self.file.write_all_at(&bytes, offset)?;
        txn.cookies.push(offset);

        debug!(txn_id = txn.id, offset, kind = ?framed.record.kind(), "appended intent record");
        Ok(Cookie::new(offset))
    }

    /// Durably finish `txn` with a commit record.
    ///
    /// Called by the transaction engine only; the engine fires the
    /// commit observers after this returns.
    pub(crate) fn commit_txn(&self, txn: &Txn) -> Result<()> {
        self.append_autonomous(txn.id, IntentRecord::Commit)?;
        self.release_declared(txn.declared);
        Ok(())
    }

    /// Durably finish `txn` with an abort record
    pub(crate) fn abort_txn(&self, txn: &Txn) -> Result<()> {
        self.append_autonomous(txn.id, IntentRecord::Abort)?;
        self.release_declared(txn.declared);
        Ok(())
    }

    fn release_declared(&self, slots: u64) {
        if slots > 0 {
            let mut state = self.state.lock();
            state.declared = state
                .declared
                .saturating_sub(slots * MAX_RECORD_SIZE as u64);
        }
    }

    /// Write this incarnation's generation marker.
    ///
    /// Must happen once at proxy start, before replay, so that replay
    /// has a bound to stop at.
    pub fn append_generation(&self, generation: Generation) -> Result<()> {
        self.append_autonomous(0, IntentRecord::Generation { generation })?;
        debug!(%generation, "wrote generation marker");
        Ok(())
    }

    /// Cancel the record referenced by `cookie`.
    ///
    /// Appends a durable tombstone; the cookie is consumed and the
    /// record will never be replayed again.
    pub fn cancel(&self, cookie: Cookie) -> Result<()> {
        let offset = cookie.offset();
        self.append_autonomous(0, IntentRecord::Cancel { offset })?;
        debug!(offset, "cancelled intent record");
        Ok(())
    }

    /// Append a record outside any transaction and make it durable
    fn append_autonomous(&self, txn_id: u64, record: IntentRecord) -> Result<u64> {
        let framed = FramedRecord::new(txn_id, record);
        let bytes = framed.to_bytes();

        let (offset, header_bytes) = {
            let mut state = self.state.lock();
            let offset = state.header.write_offset;
            if offset + bytes.len() as u64 > self.config.max_size {
                return Err(Error::LogFull {
                    required: bytes.len() as u64,
                    available: self.config.max_size.saturating_sub(offset),
                });
            }
            state.header.write_offset = offset + bytes.len() as u64;
            (offset, state.header.to_bytes())
        };

        self.file.write_all_at(&bytes, offset)?;
        self.file.sync_data()?;
        self.file.write_all_at(&header_bytes, 0)?;
        self.file.sync_data()?;
        Ok(offset)
    }

    /// Sync all appended record bytes and persist the append position.
    ///
    /// Commit and abort already sync; this is only needed to make
    /// still-open transactions crash-visible, e.g. before a planned
    /// process handover.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        let header_bytes = self.state.lock().header.to_bytes();
        self.file.write_all_at(&header_bytes, 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Current append position
    #[must_use]
    pub fn write_offset(&self) -> u64 {
        self.state.lock().header.write_offset
    }

    /// Replay the log in order, bounded by `bound`.
    ///
    /// Returns every committed, uncancelled operational record that
    /// precedes the generation marker equal to `bound`, in log order.
    /// Replaying twice with the same bound yields the same entries.
    pub fn replay(&self, bound: Generation) -> Result<Vec<ReplayEntry>> {
        let end = self.write_offset();
        let len = (end - LOG_HEADER_SIZE) as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, LOG_HEADER_SIZE)?;

        let mut open_txns: HashMap<u64, Vec<(u64, IntentRecord)>> = HashMap::new();
        let mut live: BTreeMap<u64, IntentRecord> = BTreeMap::new();
        let mut cancelled: HashSet<u64> = HashSet::new();
        let mut pos = 0usize;

        while pos + RECORD_HEADER_SIZE <= len {
            let offset = LOG_HEADER_SIZE + pos as u64;
            let (framed, consumed) = match FramedRecord::from_bytes(&buf[pos..]) {
                Ok(r) => r,
                Err(e) => {
                    // A torn tail can only be the last (unsynced)
                    // write; everything durable precedes it.
                    warn!(offset, error = %e, "stopping replay at unreadable record");
                    break;
                }
            };

            match framed.record {
                IntentRecord::Destroy { .. } | IntentRecord::SetAttr { .. } => {
                    open_txns
                        .entry(framed.txn_id)
                        .or_default()
                        .push((offset, framed.record));
                }
                IntentRecord::Commit => {
                    if let Some(records) = open_txns.remove(&framed.txn_id) {
                        for (record_offset, record) in records {
                            if !cancelled.contains(&record_offset) {
                                live.insert(record_offset, record);
                            }
                        }
                    }
                }
                IntentRecord::Abort => {
                    open_txns.remove(&framed.txn_id);
                }
                IntentRecord::Cancel { offset: target } => {
                    live.remove(&target);
                    cancelled.insert(target);
                }
                IntentRecord::Generation { generation } => {
                    if generation == bound {
                        debug!(%generation, "replay reached current generation marker");
                        break;
                    }
                    // Marker of an earlier incarnation; keep scanning.
                }
            }

            pos += consumed;
        }

        let entries: Vec<ReplayEntry> = live
            .into_iter()
            .map(|(offset, record)| ReplayEntry {
                cookie: Cookie::new(offset),
                record,
            })
            .collect();
        info!(count = entries.len(), "replayed intent log");
        Ok(entries)
    }
}
