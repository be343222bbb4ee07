//! Graphite - the durability core of a graph database storage layer
//!
//! Graphite stores fixed-size records in a flat data file and makes
//! record mutations crash-safe through a write-ahead transaction log.
//! A crash at any instant leaves the file recoverable to a state that
//! reflects every committed transaction and none of the uncommitted
//! ones, while the cost of fsyncing the data file is amortised over
//! many transactions.
//!
//! Architecture Overview:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               Higher layers                   │
//! │      (graph model, indexes, interpreter)      │
//! └───────────────────────────────────────────────┘
//!             │ get / release / flush
//!             ▼
//! ┌───────────────────────────────────────────────┐
//! │                 RecordFile                    │
//! │     (checkout lifecycle, in-use tracking)     │
//! └───────────────────────────────────────────────┘
//!        │                         │
//!        ▼                         ▼
//! ┌────────────────┐   ┌─────────────────────────┐
//! │    DataFile    │◄──│   TransactionManager    │
//! │ (records at    │   │ (in-memory slots, log   │
//! │  id * size)    │   │  frames, drain, replay) │
//! └────────────────┘   └─────────────────────────┘
//!        │                         │
//!        ▼                         ▼
//! ┌───────────────────────────────────────────────┐
//! │                 File System                   │
//! │        (data file, <name>.tlg log file)       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A mutation flows through the system as follows: a record is checked
//! out with [`RecordFile::get`], mutated and released; the release
//! enrols it into the current in-memory transaction.
//! [`RecordFile::flush`] appends that transaction to the on-disk log
//! and fsyncs. Once enough transactions have accumulated (or the file
//! is closed) the manager coalesces them and writes the record images
//! through to the data file. On startup a pending log is replayed
//! before normal operation resumes.

pub mod error;
pub mod store;

pub use error::{GraphiteError, Result};
pub use store::log_file::LogFile;
pub use store::manager::TransactionManager;
pub use store::record::{Record, RecordId, SharedRecord};
pub use store::record_file::{DataFile, RecordFile, StoreConfig};
