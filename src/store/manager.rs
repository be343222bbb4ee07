//! Write-ahead transaction manager for the record file
//!
//! ## Design
//!
//! The manager sits between the record file and the filesystem and
//! reconciles durability with fsync batching:
//!
//! 1. Released dirty records are collected in an in-memory slot, one
//!    slot per transaction ([`TransactionManager::start`] /
//!    [`TransactionManager::add`]).
//! 2. [`TransactionManager::commit`] appends the slot to the on-disk
//!    log as one frame and fsyncs the log. The data file itself is not
//!    touched, so a commit costs a single fsync of sequential bytes.
//! 3. Once `max_trans` transactions have accumulated, the slots are
//!    coalesced by record id and written through to the data file in
//!    one pass ([`TransactionManager::sync_log_from_memory`]), after
//!    which the log is truncated and re-created empty.
//!
//! Should the process crash, the log is replayed into the data file on
//! the next startup by [`TransactionManager::with_max_trans`] before
//! normal operation resumes. Replay is idempotent: every image is a
//! whole record written at a fixed offset.
//!
//! ## Log format
//!
//! ```text
//! [ 2 bytes magic = 0x66 0x42 ]
//! [ frame ]*
//! frame  := [ i64 LE: record count n ] [ record ]{n}
//! record := u32 LE length prefix + encoded (id, payload)
//! ```
//!
//! There is no per-frame checksum; a torn trailing frame surfaces as a
//! [`GraphiteError::Truncated`] during replay and frames before it
//! remain fully applied.
//!
//! ## Record lifecycle
//!
//! A record may sit in several slots at once (it was released in
//! several transactions); its transaction count tracks the number of
//! live slot references. The drain coalesces duplicates, decrementing
//! the count for every reference it discards, and releases a record
//! back to the owner only when its count reaches zero.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::{GraphiteError, Result};

use super::log_file::LogFile;
use super::record::{Record, RecordId, SharedRecord};
use super::record_file::DataFile;

/// Suffix appended to the owner's name to form the log file path.
pub const LOG_FILE_SUFFIX: &str = "tlg";

/// Header magic identifying a transaction log file.
pub const LOG_MAGIC: [u8; 2] = [0x66, 0x42];

/// Default number of transactions buffered in memory before the log is
/// drained into the data file.
pub const DEFAULT_MAX_TRANS: usize = 10;

/// Initial record capacity allocated per transaction slot.
const TRANS_SLOT_CAPACITY: usize = 10;

/// Buffers transactions in memory, serialises them to the on-disk log
/// on commit, periodically drains the log into the data file and
/// performs crash recovery.
#[derive(Debug)]
pub struct TransactionManager {
    /// Path of the log file, `<owner name>.tlg`
    name: String,
    /// Currently open log, absent between close and reopen
    log_file: Option<LogFile>,
    /// Index of the slot being built, `None` while no transaction is
    /// open
    cur: Option<usize>,
    /// Transaction slots, exactly `max_trans` long
    slots: Vec<Vec<SharedRecord>>,
    max_trans: usize,
}

impl TransactionManager {
    /// Create a manager bound to `owner` with the default capacity.
    pub fn new(owner: &mut DataFile, do_recover: bool) -> Result<Self> {
        Self::with_max_trans(owner, DEFAULT_MAX_TRANS, do_recover)
    }

    /// Create a manager with an explicit transaction capacity.
    ///
    /// When `do_recover` is set, a log left behind by a previous run is
    /// replayed into `owner` first. A log with a foreign header is
    /// tolerated and overwritten; any other replay failure aborts
    /// construction.
    pub fn with_max_trans(
        owner: &mut DataFile,
        max_trans: usize,
        do_recover: bool,
    ) -> Result<Self> {
        if max_trans == 0 {
            return Err(GraphiteError::Internal(
                "transaction capacity must be non-zero".to_string(),
            ));
        }

        let mut manager = Self {
            name: format!("{}.{}", owner.name(), LOG_FILE_SUFFIX),
            log_file: None,
            cur: None,
            slots: (0..max_trans).map(|_| Vec::new()).collect(),
            max_trans,
        };

        if do_recover {
            match manager.recover(owner) {
                Ok(()) => {}
                Err(GraphiteError::BadMagic(_)) => {
                    warn!(
                        "transaction log {} has a bad magic header, discarding it",
                        manager.name
                    );
                }
                Err(e) => return Err(e),
            }
        }

        manager.open_log()?;
        Ok(manager)
    }

    /// Path of the on-disk log file.
    pub fn log_name(&self) -> &str {
        &self.name
    }

    /// Index of the slot currently being built.
    pub fn cur_slot(&self) -> Option<usize> {
        self.cur
    }

    /// Total number of record references held across all slots.
    pub fn pending_records(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Open the next transaction slot. Reaching the slot capacity
    /// first drains all buffered transactions into the data file.
    pub fn start(&mut self, owner: &mut DataFile) -> Result<()> {
        let mut next = match self.cur {
            Some(cur) => cur + 1,
            None => 0,
        };
        if next >= self.max_trans {
            self.sync_log_from_memory(owner)?;
            next = 0;
        }

        self.slots[next] = Vec::with_capacity(TRANS_SLOT_CAPACITY);
        self.cur = Some(next);
        Ok(())
    }

    /// Enrol a record into the current slot.
    pub fn add(&mut self, record: SharedRecord) {
        record
            .lock()
            .expect("record lock poisoned")
            .inc_trans_count();

        let cur = self.cur.expect("no open transaction slot");
        self.slots[cur].push(record);
    }

    /// Persist the current slot to the log as one frame and fsync.
    ///
    /// On failure the slot is left intact and every record keeps its
    /// dirty flag and transaction count, so a later drain can still
    /// apply them.
    pub fn commit(&mut self) -> Result<()> {
        let cur = match self.cur {
            Some(cur) => cur,
            None => return Ok(()),
        };
        let log = self.log_file.as_mut().ok_or(GraphiteError::LogClosed)?;

        let slot = &self.slots[cur];
        log.write_all(&(slot.len() as i64).to_le_bytes())?;
        for record in slot {
            record
                .lock()
                .expect("record lock poisoned")
                .write_to(log)?;
        }
        log.sync()?;

        // The images are durable in the log now.
        for record in slot {
            record
                .lock()
                .expect("record lock poisoned")
                .clear_dirty();
        }
        Ok(())
    }

    /// Discard all in-memory transactions and re-establish the state
    /// recorded in the durable log: the last drain plus any committed
    /// frames since. Records that lose their final slot reference are
    /// released back to the owner without being written.
    pub fn sync_log_from_disk(&mut self, owner: &mut DataFile) -> Result<()> {
        self.close();

        for slot in &mut self.slots {
            for record in slot.iter() {
                let in_trans = {
                    let mut rec = record.lock().expect("record lock poisoned");
                    rec.dec_trans_count();
                    rec.in_transaction()
                };
                if !in_trans {
                    owner.release_in_trans(record, false);
                }
            }
            slot.clear();
        }

        self.recover(owner)?;
        self.open_log()
    }

    /// Sync and close the log file. Close errors are dropped: the next
    /// open truncates the file anyway.
    pub fn close(&mut self) {
        if let Some(log) = self.log_file.take() {
            if let Err(e) = log.close() {
                debug!("dropping close error for transaction log {}: {}", self.name, e);
            }
        }
    }

    /// Coalesce all buffered transactions and write the surviving
    /// record images through to the data file, then truncate the log.
    ///
    /// A failure while applying leaves the log closed and on disk;
    /// replay on the next startup applies the same images again, which
    /// is safe because every image is a whole record at a fixed
    /// offset.
    pub fn sync_log_from_memory(&mut self, owner: &mut DataFile) -> Result<()> {
        self.close();

        let mut rec_map: HashMap<RecordId, SharedRecord> = HashMap::new();
        for slot in &mut self.slots {
            for record in slot.iter() {
                let mut rec = record.lock().expect("record lock poisoned");
                if rec_map.contains_key(&rec.id()) {
                    // Duplicate reference being coalesced away; the
                    // first-seen image wins and this one only gives up
                    // its slot count.
                    rec.dec_trans_count();
                } else {
                    let id = rec.id();
                    drop(rec);
                    rec_map.insert(id, Arc::clone(record));
                }
            }
            slot.clear();
        }

        debug!(
            "draining {} record(s) from transaction log {} into {}",
            rec_map.len(),
            self.name,
            owner.name()
        );

        Self::sync_records(owner, &rec_map, true)?;
        owner.sync()?;

        self.open_log()
    }

    /// Replay a pending transaction log into the owner. A missing log
    /// file means there is nothing to do; a log without the expected
    /// magic fails with [`GraphiteError::BadMagic`].
    fn recover(&mut self, owner: &mut DataFile) -> Result<()> {
        let mut file = match File::open(&self.name) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        info!("recovering transaction log {}", self.name);

        let mut magic = [0u8; 2];
        if file.read_exact(&mut magic).is_err() || magic != LOG_MAGIC {
            return Err(GraphiteError::BadMagic(self.name.clone()));
        }

        let mut frames = 0usize;
        loop {
            let mut count_buf = [0u8; 8];
            if !read_frame_header(&mut file, &mut count_buf)? {
                break;
            }
            let count = i64::from_le_bytes(count_buf);
            if count < 0 {
                return Err(GraphiteError::Truncated(format!(
                    "negative record count in frame {} of {}",
                    frames, self.name
                )));
            }

            let mut rec_map: HashMap<RecordId, SharedRecord> = HashMap::new();
            for _ in 0..count {
                let record = Record::read_from(&mut file)?;
                // Duplicates within one frame resolve to the latest
                // image.
                rec_map.insert(record.id(), Arc::new(Mutex::new(record)));
            }

            Self::sync_records(owner, &rec_map, false)?;
            frames += 1;
        }

        info!("replayed {} frame(s) from transaction log {}", frames, self.name);
        Ok(())
    }

    /// Write a coalesced record map through to the data file. During a
    /// drain (`clear_mem_trans_log`) each applied record additionally
    /// gives up one transaction count and is released back to the
    /// owner once no slot references it; during recovery there are no
    /// in-memory references to maintain.
    fn sync_records(
        owner: &mut DataFile,
        records: &HashMap<RecordId, SharedRecord>,
        clear_mem_trans_log: bool,
    ) -> Result<()> {
        for record in records.values() {
            owner.write_record(record)?;

            if clear_mem_trans_log {
                let in_trans = {
                    let mut rec = record.lock().expect("record lock poisoned");
                    rec.dec_trans_count();
                    rec.in_transaction()
                };
                if !in_trans {
                    owner.release_in_trans(record, true);
                }
            }
        }
        Ok(())
    }

    /// Create a fresh, header-only log file, discarding any previous
    /// contents. Callers must have replayed or drained the previous
    /// log beforehand.
    fn open_log(&mut self) -> Result<()> {
        let mut log = LogFile::create(&self.name)?;
        log.write_all(&LOG_MAGIC)?;
        log.sync()?;

        self.log_file = Some(log);
        self.cur = None;
        Ok(())
    }
}

impl fmt::Display for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TransactionManager: {} (log open: {}, cur: {:?}, max: {})",
            self.name,
            self.log_file.is_some(),
            self.cur,
            self.max_trans
        )?;
        for (i, slot) in self.slots.iter().enumerate() {
            write!(f, "  {}:", i)?;
            for record in slot {
                match record.lock() {
                    Ok(rec) => write!(f, " {}", rec.id())?,
                    Err(_) => write!(f, " <poisoned>")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Read a full 8-byte frame header. Returns `false` on a clean end of
/// file; a header cut short mid-way is a torn frame.
fn read_frame_header(file: &mut File, buf: &mut [u8; 8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(GraphiteError::Truncated(
                    "frame header cut short".to_string(),
                ))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
