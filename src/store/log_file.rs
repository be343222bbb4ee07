//! Append-only sink for the transaction log
//!
//! The manager only ever needs three things from its log: ordered
//! writes, an explicit fsync and a close. A tagged variant keeps the
//! boundary small while still allowing an in-memory buffer to stand in
//! for the real file in tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::Result;

/// The transaction manager's byte sink: a real log file on disk or an
/// in-memory buffer.
#[derive(Debug)]
pub enum LogFile {
    Disk(File),
    Mem(Vec<u8>),
}

impl LogFile {
    /// Open a log file on disk with create-or-truncate semantics. Any
    /// previous contents are discarded.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(LogFile::Disk(file))
    }

    /// An in-memory log buffer.
    pub fn memory() -> Self {
        LogFile::Mem(Vec::new())
    }

    /// Flush written bytes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        match self {
            LogFile::Disk(file) => file.sync_data()?,
            LogFile::Mem(_) => {}
        }
        Ok(())
    }

    /// Sync and release the underlying handle.
    pub fn close(self) -> Result<()> {
        match self {
            LogFile::Disk(file) => file.sync_all()?,
            LogFile::Mem(_) => {}
        }
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogFile::Disk(file) => file.write(buf),
            LogFile::Mem(bytes) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogFile::Disk(file) => file.flush(),
            LogFile::Mem(_) => Ok(()),
        }
    }
}
