//! Paged record file
//!
//! ## Storage Format
//!
//! The data file is a flat array of fixed-size records: record `id`
//! lives at byte offset `id * record_size`. Ids that were never
//! written read back as zero-filled records. Next to the data file the
//! transaction manager keeps its log at `<name>.tlg`.
//!
//! ## Record lifecycle
//!
//! A higher layer checks a record out with [`RecordFile::get`],
//! mutates it and hands it back with [`RecordFile::release`]. A dirty
//! record is enrolled into the current in-memory transaction at that
//! point; [`RecordFile::flush`] commits the transaction to the on-disk
//! log. The record images only reach the data file when the manager
//! drains its log, which happens after enough transactions have
//! accumulated or when the file is closed.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{GraphiteError, Result};

use super::manager::{TransactionManager, DEFAULT_MAX_TRANS};
use super::record::{Record, RecordId, SharedRecord};

/// Default size of a record payload in bytes.
pub const DEFAULT_RECORD_SIZE: usize = 4096;

/// Configuration for a record file and its transaction manager.
///
/// The defaults match production use; tests inject smaller values via
/// struct update syntax.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Size of every record payload in bytes
    pub record_size: usize,
    /// Number of in-memory transactions buffered before the log is
    /// drained into the data file
    pub max_trans: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            max_trans: DEFAULT_MAX_TRANS,
        }
    }
}

/// The flat data file together with the bookkeeping the transaction
/// manager relies on. This is the collaborator surface the manager
/// sees: `name`, `write_record`, `release_in_trans` and `sync`.
#[derive(Debug)]
pub struct DataFile {
    name: String,
    file: File,
    record_size: usize,
    /// Records currently checked out by a higher layer
    in_use: HashSet<RecordId>,
    /// Records referenced by at least one in-memory transaction slot
    in_trans: HashMap<RecordId, SharedRecord>,
}

impl DataFile {
    /// Open or create the data file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, record_size: usize) -> Result<Self> {
        if record_size == 0 {
            return Err(GraphiteError::Internal(
                "record size must be non-zero".to_string(),
            ));
        }

        let name = path.as_ref().to_string_lossy().into_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        Ok(Self {
            name,
            file,
            record_size,
            in_use: HashSet::new(),
            in_trans: HashMap::new(),
        })
    }

    /// Path of the data file; the transaction log derives its own name
    /// from this.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Apply a record image to its canonical offset in the data file
    /// and clear the record's dirty flag.
    pub fn write_record(&mut self, record: &SharedRecord) -> Result<()> {
        let mut rec = record.lock().expect("record lock poisoned");

        if rec.data().len() != self.record_size {
            return Err(GraphiteError::Internal(format!(
                "record {} has payload of {} bytes, expected {}",
                rec.id(),
                rec.data().len(),
                self.record_size
            )));
        }

        self.file
            .seek(SeekFrom::Start(rec.id() * self.record_size as u64))?;
        self.file.write_all(rec.data())?;
        rec.clear_dirty();
        Ok(())
    }

    /// Release a record from the in-transaction set. `dirty` is true
    /// when the image was just applied to the data file; false when it
    /// is being discarded during a rollback, in which case the dirty
    /// flag is cleared so the stale image can never re-enrol.
    pub fn release_in_trans(&mut self, record: &SharedRecord, dirty: bool) {
        let mut rec = record.lock().expect("record lock poisoned");
        if self.in_trans.remove(&rec.id()).is_some() && !dirty {
            rec.clear_dirty();
        }
    }

    /// Fsync the data file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read the record image at the id's offset. Ids beyond the end of
    /// the file come back as fresh zero-filled records.
    fn read_record(&mut self, id: RecordId) -> Result<Record> {
        let offset = id * self.record_size as u64;
        let end = self.file.metadata()?.len();

        let mut data = vec![0u8; self.record_size];
        if offset < end {
            self.file.seek(SeekFrom::Start(offset))?;
            let available = (end - offset).min(self.record_size as u64) as usize;
            self.file.read_exact(&mut data[..available])?;
        }
        Ok(Record::with_data(id, data))
    }
}

/// A paged record file with transaction management.
///
/// Owns the [`DataFile`] and the [`TransactionManager`]; the manager
/// holds no reference back, every manager operation that touches the
/// owner takes the data file as an argument.
#[derive(Debug)]
pub struct RecordFile {
    data: DataFile,
    tm: TransactionManager,
    /// True while the current transaction slot is open and uncommitted
    trans_open: bool,
}

impl RecordFile {
    /// Open a record file with default configuration, recovering any
    /// pending transaction log left behind by a crash.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Open a record file with explicit configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let mut data = DataFile::open(path, config.record_size)?;
        let tm = TransactionManager::with_max_trans(&mut data, config.max_trans, true)?;
        Ok(Self {
            data,
            tm,
            trans_open: false,
        })
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn record_size(&self) -> usize {
        self.data.record_size()
    }

    /// Check a record out for reading or mutation. A record that is
    /// still referenced by an in-memory transaction is handed back as
    /// the same shared instance so its bookkeeping stays linked.
    pub fn get(&mut self, id: RecordId) -> Result<SharedRecord> {
        if self.in_use(id) {
            return Err(GraphiteError::RecordInUse(id));
        }

        let record = match self.data.in_trans.get(&id).map(Arc::clone) {
            Some(rec) => rec,
            None => Arc::new(Mutex::new(self.data.read_record(id)?)),
        };

        self.data.in_use.insert(id);
        Ok(record)
    }

    /// Check a record back in. A dirty record is enrolled into the
    /// current in-memory transaction; a clean one is simply dropped.
    pub fn release(&mut self, record: SharedRecord) -> Result<()> {
        let (id, dirty) = {
            let rec = record.lock().expect("record lock poisoned");
            (rec.id(), rec.is_dirty())
        };

        if !self.data.in_use.remove(&id) {
            return Err(GraphiteError::RecordNotInUse(id));
        }

        if dirty {
            if !self.trans_open {
                self.tm.start(&mut self.data)?;
                self.trans_open = true;
            }
            self.tm.add(Arc::clone(&record));
            self.data.in_trans.entry(id).or_insert(record);
        }
        Ok(())
    }

    /// True if the record is currently checked out.
    pub fn in_use(&self, id: RecordId) -> bool {
        self.data.in_use.contains(&id)
    }

    /// Commit the current in-memory transaction to the on-disk log.
    /// A no-op when nothing was enrolled since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if self.trans_open {
            self.tm.commit()?;
            self.trans_open = false;
        }
        Ok(())
    }

    /// Discard all in-memory transactions and re-establish the state
    /// of the last durable log. Fails if records are still checked out.
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(&id) = self.data.in_use.iter().next() {
            return Err(GraphiteError::RecordInUse(id));
        }
        self.tm.sync_log_from_disk(&mut self.data)?;
        self.trans_open = false;
        Ok(())
    }

    /// Fsync the data file.
    pub fn sync(&mut self) -> Result<()> {
        self.data.sync()
    }

    /// Flush pending transactions, drain the log into the data file
    /// and close both files. Fails if records are still checked out.
    pub fn close(mut self) -> Result<()> {
        if let Some(&id) = self.data.in_use.iter().next() {
            return Err(GraphiteError::RecordInUse(id));
        }

        self.flush()?;
        self.tm.sync_log_from_memory(&mut self.data)?;
        self.tm.close();
        Ok(())
    }
}
