//! A log-structured, append-only key-value storage engine in the
//! [Bitcask](https://riak.com/assets/bitcask-intro.pdf) lineage.
//!
//! A store is a directory of append-only data files plus an in-memory
//! directory (the KeyDir) that maps every live key to the location of its
//! value on disk. Reads are a single positioned read; writes are a single
//! append. Space occupied by overwritten and deleted records is reclaimed
//! by an explicit merge.

pub mod storage;

pub use storage::bitcask::{Bitcask, Config, Error, Handle, PutOutcome, StorageStats};
pub use storage::KeyValueStorage;
