use std::path::Path;

use bytesize::ByteSize;

use super::Bitcask;

/// Configuration for a `Bitcask` instance.
///
/// The store performs no background work of its own; when to call
/// [`merge`](super::Handle::merge) is the caller's decision, typically
/// informed by [`stats`](super::Handle::stats).
#[derive(Debug, Clone)]
pub struct Config {
    pub(super) concurrency: usize,
    pub(super) max_file_size: ByteSize,
    pub(super) sync_on_put: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            max_file_size: ByteSize::gib(2),
            sync_on_put: false,
        }
    }
}

impl Config {
    /// Create a `Bitcask` instance at the given path with the available options.
    pub fn open<P>(self, path: P) -> Result<Bitcask, super::Error>
    where
        P: AsRef<Path>,
    {
        Bitcask::open(path, self)
    }

    /// Set the max number of concurrent readers. Default to the number of logical cores.
    pub fn concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the max file size above which the active data file is sealed
    /// and a successor created. Default to `2GiBs`.
    ///
    /// A write whose single record exceeds this size is rejected. The
    /// limit can also be adjusted on a live store through
    /// [`max_file_size`](super::Handle::max_file_size).
    pub fn max_file_size(&mut self, max_file_size: ByteSize) -> &mut Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Force a disk synchronization after every write. Default to `false`,
    /// leaving the flush schedule to the operating system.
    pub fn sync_on_put(&mut self, sync_on_put: bool) -> &mut Self {
        self.sync_on_put = sync_on_put;
        self
    }
}
