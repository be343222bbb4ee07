//! Storage layer: paged record file with write-ahead transaction
//! management
//!
//! Four collaborating pieces, leaves first:
//!
//! - [`record::Record`]: a fixed-size page image with an identifier,
//!   dirty flag and in-transaction counter
//! - [`log_file::LogFile`]: an append-only byte sink with an explicit
//!   sync primitive
//! - [`record_file::DataFile`] / [`record_file::RecordFile`]: the main
//!   data file, reading and writing record images at `id * size`, and
//!   the checkout/release lifecycle around it
//! - [`manager::TransactionManager`]: buffers transactions in memory,
//!   commits them to the on-disk log and drains the log into the data
//!   file

pub mod log_file;
pub mod manager;
pub mod record;
pub mod record_file;

pub use log_file::LogFile;
pub use manager::TransactionManager;
pub use record::{Record, RecordId, SharedRecord};
pub use record_file::{DataFile, RecordFile, StoreConfig};
