//! Fixed-size record images and their transaction bookkeeping
//!
//! A [`Record`] is a page-sized byte image addressed by a 64-bit id.
//! The record itself owns no file handle; it is a value that moves
//! between the record file's cache and the transaction manager's
//! in-memory slots. Two pieces of state track that journey: the dirty
//! flag (set on first mutation, cleared when the image reaches the
//! data file) and the transaction count (one increment per in-memory
//! transaction slot that still references the record).

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{GraphiteError, Result};

/// Identifier of a record, doubling as its logical page number in the
/// data file.
pub type RecordId = u64;

/// A record shared between the record file's bookkeeping maps and the
/// transaction manager's slots.
pub type SharedRecord = Arc<Mutex<Record>>;

/// Wire form of a record image as written to the transaction log.
/// Only the id and the payload are persisted; dirty flag and
/// transaction count are runtime state.
#[derive(Serialize)]
struct ImageRef<'a> {
    id: RecordId,
    data: &'a [u8],
}

#[derive(Deserialize)]
struct Image {
    id: RecordId,
    data: Vec<u8>,
}

/// A fixed-size page image with an identifier, dirty flag and
/// in-transaction counter.
#[derive(Debug)]
pub struct Record {
    id: RecordId,
    data: Vec<u8>,
    dirty: bool,
    trans_count: u32,
}

impl Record {
    /// Create a new record with a zero-filled payload of the given size.
    pub fn new(id: RecordId, size: usize) -> Self {
        Self {
            id,
            data: vec![0; size],
            dirty: false,
            trans_count: 0,
        }
    }

    /// Create a record around an existing payload. The record starts
    /// out clean.
    pub fn with_data(id: RecordId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            dirty: false,
            trans_count: 0,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Raw payload access.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload access. Marks the record dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn inc_trans_count(&mut self) {
        self.trans_count += 1;
    }

    pub fn dec_trans_count(&mut self) {
        debug_assert!(
            self.trans_count > 0,
            "transaction count underflow for record {}",
            self.id
        );
        self.trans_count = self.trans_count.saturating_sub(1);
    }

    /// True while at least one in-memory transaction slot references
    /// this record.
    pub fn in_transaction(&self) -> bool {
        self.trans_count > 0
    }

    // Field access into the payload. All offsets are in bytes, all
    // values little-endian. Out-of-range offsets panic, as with slice
    // indexing.

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&self.data[offset..offset + 2]);
        u16::from_le_bytes(buf)
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
        self.dirty = true;
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
    }

    /// Serialise the record image into a sink. The image is a u32
    /// little-endian length prefix followed by the encoded id and
    /// payload, so that [`Record::read_from`] round-trips.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> Result<()> {
        let encoded = bincode::serialize(&ImageRef {
            id: self.id,
            data: &self.data,
        })
        .map_err(|e| GraphiteError::Internal(format!("record {} failed to encode: {}", self.id, e)))?;

        sink.write_all(&(encoded.len() as u32).to_le_bytes())?;
        sink.write_all(&encoded)?;
        Ok(())
    }

    /// Read a record image back from a source. A source that ends
    /// mid-image fails with [`GraphiteError::Truncated`].
    pub fn read_from<R: Read>(source: &mut R) -> Result<Record> {
        let mut len_buf = [0u8; 4];
        source
            .read_exact(&mut len_buf)
            .map_err(|e| truncation(e, "record image length"))?;

        let mut encoded = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        source
            .read_exact(&mut encoded)
            .map_err(|e| truncation(e, "record image body"))?;

        let image: Image = bincode::deserialize(&encoded)
            .map_err(|e| GraphiteError::Truncated(format!("malformed record image: {}", e)))?;

        Ok(Record::with_data(image.id, image.data))
    }
}

fn truncation(e: std::io::Error, what: &str) -> GraphiteError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        GraphiteError::Truncated(format!("unexpected end of log while reading {}", what))
    } else {
        GraphiteError::Io(e)
    }
}
