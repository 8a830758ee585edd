//! Persistent storage engines and the interface they expose.

pub mod bitcask;

use bytes::Bytes;

/// An interface for a thread-safe key-value storage engine.
///
/// Implementations are cheaply cloneable handles onto a shared store, so
/// they can be passed to the threads that need them.
pub trait KeyValueStorage: Clone + Send + 'static {
    /// Error type returned by the storage engine.
    type Error: std::error::Error + Send + Sync;

    /// Set the value of a key, overwriting any existing value at that key.
    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Self::Error>;

    /// Get the value of a key, if it exists.
    fn get(&self, key: Bytes) -> Result<Option<Bytes>, Self::Error>;

    /// Delete a key and return `true` if it existed.
    fn del(&self, key: Bytes) -> Result<bool, Self::Error>;
}
