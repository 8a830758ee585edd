//! An implementation of [Bitcask](https://riak.com/assets/bitcask-intro.pdf).

mod bufio;
mod config;
mod log;
mod record;
mod utils;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{self, Path};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use dashmap::{DashMap, DashSet};
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use self::config::Config;
use self::log::{LogDir, LogIterator, LogWriter, RecordIndex};
use self::record::RecordError;
use super::KeyValueStorage;

/// Error returned by Bitcask.
#[derive(Error, Debug)]
pub enum Error {
    /// Another process holds the lock on the storage directory.
    #[error("storage directory is locked by another process - {path}")]
    LockHeld {
        /// Path to the contended storage directory.
        path: path::PathBuf,
    },

    /// A data file contains a record that fails validation. Fatal when
    /// encountered during recovery; the ground truth for the affected keys
    /// is lost.
    #[error("corrupted record in file {fileid} at offset {pos} - {reason}")]
    Corrupt {
        /// Logical id of the offending file.
        fileid: u32,
        /// Byte offset at which the offending record starts.
        pos: u64,
        /// What failed to validate.
        reason: &'static str,
    },

    /// Error from I/O operations, with the operation that failed.
    #[error("I/O error - could not {op} - {source}")]
    Io {
        /// The operation that failed.
        op: String,
        /// The underlying filesystem error.
        #[source]
        source: io::Error,
    },

    /// The given key or value cannot be stored.
    #[error("invalid argument - {0}")]
    InvalidArgument(&'static str),

    /// A single record does not fit within the configured max file size.
    #[error("record of {record_size} bytes exceeds the max file size of {max_file_size} bytes")]
    FileSizeBelowRecord {
        /// Encoded size of the rejected record.
        record_size: u64,
        /// The configured limit.
        max_file_size: u64,
    },

    /// An earlier write error left the tail of the active data file
    /// untrustworthy. Writes fail fast until the store is reopened; reads
    /// remain available.
    #[error("store is degraded by an earlier write error and must be reopened")]
    Degraded,
}

impl Error {
    fn io<S>(op: S) -> impl FnOnce(io::Error) -> Self
    where
        S: Into<String>,
    {
        let op = op.into();
        move |source| Self::Io { op, source }
    }
}

/// Whether a [`put`](Handle::put) inserted a new key or overwrote an
/// existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not present before the write.
    Inserted,
    /// The key was present and its previous record is now garbage.
    Updated,
}

/// A point-in-time report of the store's on-disk occupancy, aggregated
/// over all data files. Callers typically use this to decide when to
/// [`merge`](Handle::merge).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StorageStats {
    /// Number of data files with recorded statistics.
    pub files: usize,
    /// Records that are the current value of some key.
    pub live_keys: u64,
    /// Records superseded by a newer write or a deletion.
    pub dead_keys: u64,
    /// Bytes occupied by dead records, reclaimable by a merge.
    pub dead_bytes: u64,
    /// Highest fraction of dead keys to total keys across files.
    pub max_fragmentation: f64,
}

/// An implementation of a Bitcask instance whose APIs resemble the one
/// given in [bitcask-intro.pdf] with a few extensions.
///
/// Each Bitcask instance is a directory containing data files. At any
/// moment, one file is "active" for writing, and Bitcask sequentially
/// appends data to the active data file. Bitcask keeps a KeyDir that maps
/// a key to the position of its value in the data files and uses the
/// KeyDir to access the data file entries directly without having to scan
/// all data files.
///
/// Operations on the Bitcask instance are not directly handled by this
/// struct. Instead, it gives out handles to the Bitcask instance to
/// threads that need it, and operations on the instance are concurrently
/// executed through these handles. When this struct is dropped, the
/// active data file is sealed; the directory lock is released once the
/// last handle goes away.
///
/// [bitcask-intro.pdf]: https://riak.com/assets/bitcask-intro.pdf
pub struct Bitcask {
    /// The handle to the Bitcask instance.
    handle: Handle,
}

/// A handle that can be shared across threads that want to access the storage.
#[derive(Clone, Debug)]
pub struct Handle {
    /// The states of the storage that are shared across multiple threads.
    ctx: Arc<Context>,

    /// A mutex-protected writer used for appending data entries to the
    /// active data file. All operations that make changes to the active
    /// data file are delegated to this object. The merger also takes this
    /// lock, but only while it swaps the keydir over to its outputs.
    writer: Arc<Mutex<Writer>>,

    /// A readers queue for parallelizing read-access to the key-value
    /// store. Upon a read-access, a reader is taken from the queue and
    /// used for reading the data files. Once we finish reading, the
    /// reader is returned back to the queue.
    readers: Arc<ArrayQueue<Reader>>,
}

/// The context holds states that are shared across both read and write
/// operations.
#[derive(Debug)]
struct Context {
    /// Storage configurations.
    conf: Config,

    /// Path to the storage directory.
    path: path::PathBuf,

    /// Size threshold above which the active data file is rolled.
    /// Runtime-adjustable through [`Handle::max_file_size`].
    max_file_size: AtomicU64,

    /// The id of the file currently accepting appends, published by the
    /// writer so the merger can exclude it from its snapshot.
    active_fileid: AtomicU32,

    /// Ids of files that have been (or are about to be) unlinked by the
    /// merger. Readers drop their cached handles to these files and use
    /// the set to tell a retirement race from real file loss.
    retired: DashSet<u32>,

    /// The mapping from keys to the positions of their values on disk.
    keydir: DashMap<Bytes, KeyDirEntry>,

    /// Counts of different metrics about the storage.
    stats: DashMap<u32, LogStatistics>,

    /// Serializes merges; held for the whole merge, unlike the writer
    /// lock which the merger only takes for the swap.
    merging: Mutex<()>,

    /// The lock file. Holding its exclusive OS lock for the lifetime of
    /// this struct keeps other processes out of the directory.
    dirlock: File,
}

/// The writer appends log entries to data files and ensures that indices
/// in KeyDir point to valid file locations.
#[derive(Debug)]
struct Writer {
    /// The shared states.
    ctx: Arc<Context>,

    /// A writer that appends entries to the currently active file.
    writer: LogWriter,

    /// The id of the currently active file.
    active_fileid: u32,

    /// The timestamp of the most recent record, so the sequence stays
    /// strictly increasing even when the wall clock regresses.
    last_tstamp: u64,

    /// Set when an append fails partway. The bytes behind the active
    /// file's write position are then unknown, so further writes are
    /// refused rather than risking interleaved garbage that recovery
    /// could not distinguish from corruption.
    degraded: bool,
}

/// The reader reads log entries from data files given the locations found
/// in KeyDir. Since data files are immutable (except for the active one),
/// we can safely read them concurrently without any extra synchronization
/// between threads.
#[derive(Debug)]
struct Reader {
    /// The shared states.
    ctx: Arc<Context>,

    /// The thread-local cache of file descriptors for reading the data files.
    readers: RefCell<LogDir>,
}

impl Bitcask {
    fn open<P>(path: P, conf: Config) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .map_err(Error::io(format!("create directory {}", path.display())))?;
        let dirlock = lock_directory(path)?;

        // Reconstruct in-memory data from on-disk data
        let recovered = rebuild_storage(path)?;
        debug!(
            active_fileid = recovered.active_fileid,
            keys = recovered.keydir.len(),
            "rebuilt keydir"
        );

        let ctx = Arc::new(Context {
            max_file_size: AtomicU64::new(conf.max_file_size.as_u64()),
            active_fileid: AtomicU32::new(recovered.active_fileid),
            conf,
            path: path.to_path_buf(),
            retired: DashSet::default(),
            keydir: recovered.keydir,
            stats: recovered.stats,
            merging: Mutex::new(()),
            dirlock,
        });

        // In case the user gave 0, we still create a reader
        let readers = Arc::new(ArrayQueue::new(ctx.conf.concurrency.max(1)));
        for _ in 0..readers.capacity() {
            readers
                .push(Reader {
                    ctx: ctx.clone(),
                    readers: RefCell::default(),
                })
                .expect("unreachable error");
        }

        let active = log::create(utils::datafile_name(path, recovered.active_fileid))
            .map_err(Error::io(format!(
                "create data file {}",
                recovered.active_fileid
            )))?;
        let writer = Arc::new(Mutex::new(Writer {
            ctx: ctx.clone(),
            writer: LogWriter::new(active).map_err(Error::io("open the active data file"))?,
            active_fileid: recovered.active_fileid,
            last_tstamp: recovered.last_tstamp,
            degraded: false,
        }));

        Ok(Self {
            handle: Handle {
                ctx,
                writer,
                readers,
            },
        })
    }

    /// Get the handle to the storage.
    pub fn get_handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Remove every file belonging to the store at `path`. The store must
    /// not be open, here or in any other process.
    pub fn clear<P>(path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let dirlock = lock_directory(path)?;
        let files = utils::list_fileids(path).map_err(Error::io("list data files"))?;
        for fileid in files.datafiles.iter().chain(files.mergefiles.iter()) {
            let file_path = utils::fileid_path(path, *fileid);
            fs::remove_file(&file_path)
                .map_err(Error::io(format!("remove {}", file_path.display())))?;
        }
        fs::remove_file(path.join(utils::LOCK_FILE))
            .map_err(Error::io("remove the lock file"))?;
        drop(dirlock);
        Ok(())
    }
}

impl Drop for Bitcask {
    fn drop(&mut self) {
        if let Err(e) = self.handle.writer.lock().close() {
            error!(cause = ?e, "failed to seal the active data file");
        }
    }
}

impl KeyValueStorage for Handle {
    type Error = Error;

    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Self::Error> {
        self.put(key, value).map(|_| ())
    }

    fn get(&self, key: Bytes) -> Result<Option<Bytes>, Self::Error> {
        self.get(key)
    }

    fn del(&self, key: Bytes) -> Result<bool, Self::Error> {
        self.del(key)
    }
}

impl Handle {
    /// Set the value of a key, overwriting any existing value at that key.
    /// Reports whether the key was inserted or updated.
    ///
    /// # Error
    ///
    /// Errors from I/O operations will be propagated. An empty key, or a
    /// key or value whose length does not fit its 32-bit size field, is
    /// rejected with `InvalidArgument`.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<PutOutcome, Error> {
        self.writer.lock().put(key, value)
    }

    /// Delete a key and return `true`, if it exists. Otherwise, return
    /// `false` without writing anything.
    ///
    /// # Error
    ///
    /// Errors from I/O operations will be propagated.
    pub fn del(&self, key: Bytes) -> Result<bool, Error> {
        self.writer.lock().delete(key)
    }

    /// Get the value of a key and return it, if it exists, otherwise
    /// return `None`.
    ///
    /// # Error
    ///
    /// Errors from I/O operations will be propagated.
    pub fn get(&self, key: Bytes) -> Result<Option<Bytes>, Error> {
        self.with_reader(|reader| reader.get(&key))
    }

    /// Visit every live key and its value, in no particular order. The
    /// key set is snapshotted when the call starts; values are read as
    /// the traversal reaches them. Returning `false` from the visitor
    /// stops the traversal early.
    ///
    /// # Error
    ///
    /// Errors from I/O operations will be propagated.
    pub fn traverse<F>(&self, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&Bytes, &Bytes) -> bool,
    {
        self.with_reader(|reader| {
            let keys: Vec<Bytes> = reader.ctx.keydir.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                // A key deleted since the snapshot was taken is skipped.
                if let Some(value) = reader.get(&key)? {
                    if !visit(&key, &value) {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    }

    /// Return `true` if the store holds no live keys.
    pub fn empty(&self) -> bool {
        self.ctx.keydir.is_empty()
    }

    /// Number of live keys in the store.
    pub fn len(&self) -> usize {
        self.ctx.keydir.len()
    }

    /// Adjust the size threshold above which the active data file is
    /// sealed and a successor created. An active file already above the
    /// new threshold is rolled by the next write.
    pub fn max_file_size(&self, max_file_size: u64) {
        self.ctx.max_file_size.store(max_file_size, Ordering::Relaxed);
    }

    /// Aggregate the per-file storage statistics.
    pub fn stats(&self) -> StorageStats {
        let mut report = StorageStats::default();
        for entry in self.ctx.stats.iter() {
            report.files += 1;
            report.live_keys += entry.live_keys;
            report.dead_keys += entry.dead_keys;
            report.dead_bytes += entry.dead_bytes;
            report.max_fragmentation = report.max_fragmentation.max(entry.fragmentation());
        }
        report
    }

    /// Copy every live record out of the immutable data files into fresh
    /// merge files, retarget the keydir, and delete the originals,
    /// reclaiming the space held by overwritten and deleted records.
    ///
    /// The merge runs concurrently with readers and with the writer; the
    /// writer lock is only taken for the final keydir swap. At most one
    /// merge runs at a time.
    ///
    /// # Error
    ///
    /// Errors from I/O operations will be propagated. If the error occurs
    /// before the swap, the store's state is the pre-merge state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn merge(&self) -> Result<(), Error> {
        let _merging = self.ctx.merging.lock();
        let path = self.ctx.path.as_path();

        // Snapshot the immutable files: everything on disk except the
        // active file and anything already retired. Files the writer
        // creates after this point have higher ids and are left alone.
        let files = utils::list_fileids(path).map_err(Error::io("list data files"))?;
        let active_fileid = self.ctx.active_fileid.load(Ordering::Acquire);
        let snapshot: BTreeSet<u32> = files
            .datafiles
            .iter()
            .copied()
            .filter(|id| *id < active_fileid)
            .chain(files.mergefiles.iter().copied())
            .filter(|id| !self.ctx.retired.contains(id))
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }
        let mut merge_seq = files
            .mergefiles
            .iter()
            .map(|id| (id & !utils::MERGE_FILEID_BASE) + 1)
            .max()
            .unwrap_or(0);

        // Collect the keydir entries whose records live in the snapshot.
        // Entries that get updated or removed while we copy lose the swap
        // below, so working over a stale listing is fine.
        let entries: Vec<(Bytes, KeyDirEntry)> = self
            .ctx
            .keydir
            .iter()
            .filter(|e| snapshot.contains(&e.value().fileid))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let max_file_size = self.ctx.max_file_size.load(Ordering::Relaxed);
        let mut readers = LogDir::default();
        let mut shadow: Vec<(Bytes, KeyDirEntry)> = Vec::with_capacity(entries.len());
        let mut output: Option<(u32, LogWriter)> = None;

        for (key, entry) in entries {
            let value = readers
                .get(path, entry.fileid)
                .and_then(|file| file.read_value(entry.pos, entry.len))
                .map_err(Error::io(format!("copy a record from file {}", entry.fileid)))?;
            let record_len = record::encoded_len(key.len(), Some(value.len()));

            // Merge outputs roll on the same threshold as the writer.
            if let Some((_, writer)) = &mut output {
                if writer.pos() > 0 && writer.pos() + record_len > max_file_size {
                    writer.seal().map_err(Error::io("seal a merge file"))?;
                    output = None;
                }
            }
            if output.is_none() {
                let fileid = utils::MERGE_FILEID_BASE | merge_seq;
                let file = log::create(utils::mergefile_name(path, merge_seq))
                    .map_err(Error::io(format!("create merge file {merge_seq}")))?;
                debug!(merge_seq, "new merge file");
                merge_seq += 1;
                output = Some((
                    fileid,
                    LogWriter::new(file).map_err(Error::io("open a merge file"))?,
                ));
            }
            let (fileid, writer) = output.as_mut().expect("merge output was just created");

            let index = writer
                .append(entry.tstamp, &key, Some(&value))
                .map_err(Error::io("append to a merge file"))?;
            self.ctx.stats.entry(*fileid).or_default().add_live();
            let new_entry = KeyDirEntry {
                fileid: *fileid,
                pos: value_pos(&index, &key),
                len: value.len() as u32,
                tstamp: entry.tstamp,
            };
            shadow.push((key, new_entry));
        }
        // Sync the outputs before the swap; once the originals are gone
        // the copies are the only ones left.
        if let Some((_, writer)) = &mut output {
            writer.seal().map_err(Error::io("seal a merge file"))?;
        }

        // Atomically retarget the keydir. Keys written or deleted since
        // the snapshot keep their newer state; their copies in the merge
        // output become garbage for the next merge to reclaim.
        {
            let _writer = self.writer.lock();
            for (key, entry) in shadow {
                let mut swapped = false;
                if let Some(mut cur) = self.ctx.keydir.get_mut(&key) {
                    if snapshot.contains(&cur.fileid) {
                        *cur = entry;
                        swapped = true;
                    }
                }
                if !swapped {
                    self.ctx
                        .stats
                        .entry(entry.fileid)
                        .or_default()
                        .overwrite(record_len(key.len(), entry.len));
                }
            }
        }

        // Retire the merged files. Publishing the id before the unlink
        // lets a reader that loses the race tell retirement apart from
        // real file loss and retry its lookup.
        for fileid in &snapshot {
            self.ctx.stats.remove(fileid);
            self.ctx.retired.insert(*fileid);
            let file_path = utils::fileid_path(path, *fileid);
            if let Err(e) = fs::remove_file(&file_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::io(format!("remove {}", file_path.display()))(e));
                }
            }
            debug!(fileid, "retired data file");
        }
        Ok(())
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Reader) -> T) -> T {
        let backoff = Backoff::new();
        let reader = loop {
            if let Some(reader) = self.readers.pop() {
                break reader;
            }
            // Spin until we have access to a reader
            backoff.spin();
        };
        let result = f(&reader);
        self.readers.push(reader).expect("unreachable error");
        result
    }
}

impl Writer {
    /// Set the value of a key and overwrite any existing value at that key.
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<PutOutcome, Error> {
        check_key_value(&key, &value)?;
        let tstamp = self.next_tstamp();
        let index = self.write(tstamp, &key, Some(&value))?;
        let keydir_entry = KeyDirEntry {
            fileid: self.active_fileid,
            pos: value_pos(&index, &key),
            len: value.len() as u32,
            tstamp,
        };
        let key_len = key.len();
        // If we overwrite an existing value, update the storage statistics
        match self.ctx.keydir.insert(key, keydir_entry) {
            Some(prev) => {
                self.ctx
                    .stats
                    .entry(prev.fileid)
                    .or_default()
                    .overwrite(record_len(key_len, prev.len));
                Ok(PutOutcome::Updated)
            }
            None => Ok(PutOutcome::Inserted),
        }
    }

    /// Delete a key and return `true`, if it exists. Otherwise, return
    /// `false`. Nothing is written for an absent key.
    fn delete(&mut self, key: Bytes) -> Result<bool, Error> {
        if !self.ctx.keydir.contains_key(&key) {
            return Ok(false);
        }
        let tstamp = self.next_tstamp();
        self.write(tstamp, &key, None)?;
        match self.ctx.keydir.remove(&key) {
            Some((key, prev)) => {
                self.ctx
                    .stats
                    .entry(prev.fileid)
                    .or_default()
                    .overwrite(record_len(key.len(), prev.len));
                Ok(true)
            }
            // The writer is the only thread that removes keys, and it is
            // serialized, so the entry cannot have gone away in between.
            None => Ok(false),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, key, value))]
    fn write(
        &mut self,
        tstamp: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<RecordIndex, Error> {
        if self.degraded {
            return Err(Error::Degraded);
        }
        let record_size = record::encoded_len(key.len(), value.map(<[u8]>::len));
        let max_file_size = self.ctx.max_file_size.load(Ordering::Relaxed);
        if record_size > max_file_size {
            return Err(Error::FileSizeBelowRecord {
                record_size,
                max_file_size,
            });
        }

        // Roll before appending: seal the active file, then create its
        // successor, then append. A record never pushes a file past the
        // size limit and never straddles two files.
        if self.writer.pos() > 0 && self.writer.pos() + record_size > max_file_size {
            self.new_active_datafile(self.active_fileid + 1)?;
        }

        let index = match self.writer.append(tstamp, key, value) {
            Ok(index) => index,
            Err(e) => {
                self.degraded = true;
                return Err(Error::io(format!(
                    "append to data file {}",
                    self.active_fileid
                ))(e));
            }
        };
        if self.ctx.conf.sync_on_put {
            if let Err(e) = self.writer.sync() {
                self.degraded = true;
                return Err(Error::io(format!(
                    "sync data file {}",
                    self.active_fileid
                ))(e));
            }
        }

        // Collect statistics of the active data file for the merging
        // process. If we add a value to a key, we increase the number of
        // live keys. If we add a tombstone, we increase the number of
        // dead keys.
        {
            let mut stats = self.ctx.stats.entry(self.active_fileid).or_default();
            if value.is_some() {
                stats.add_live();
            } else {
                stats.add_dead(index.len);
            }
            debug!(
                entry_len = index.len,
                entry_pos = index.pos,
                active_fileid = self.active_fileid,
                active_file_size = self.writer.pos(),
                active_live_keys = stats.live_keys,
                active_dead_keys = stats.dead_keys,
                active_dead_bytes = stats.dead_bytes,
                "appended new log entry"
            );
        }
        Ok(index)
    }

    /// Seal the active file and open a new one with the given id.
    #[tracing::instrument(level = "debug", skip(self))]
    fn new_active_datafile(&mut self, fileid: u32) -> Result<(), Error> {
        if let Err(e) = self.try_new_active_datafile(fileid) {
            // Either the old file did not flush or the new one did not
            // open; in both cases the writer has no trustworthy file to
            // append to.
            self.degraded = true;
            return Err(e);
        }
        Ok(())
    }

    fn try_new_active_datafile(&mut self, fileid: u32) -> Result<(), Error> {
        self.writer
            .seal()
            .map_err(Error::io(format!("seal data file {}", self.active_fileid)))?;
        let file = log::create(utils::datafile_name(&self.ctx.path, fileid))
            .map_err(Error::io(format!("create data file {fileid}")))?;
        self.writer = LogWriter::new(file).map_err(Error::io("open the active data file"))?;
        self.active_fileid = fileid;
        self.ctx.active_fileid.store(fileid, Ordering::Release);
        debug!(fileid, "created new active data file");
        Ok(())
    }

    /// Seal the active file when the store is closed.
    fn close(&mut self) -> io::Result<()> {
        self.writer.seal()
    }

    fn next_tstamp(&mut self) -> u64 {
        let now = utils::timestamp();
        self.last_tstamp = if now > self.last_tstamp {
            now
        } else {
            // The clock regressed; keep the sequence increasing.
            self.last_tstamp + 1
        };
        self.last_tstamp
    }
}

impl Reader {
    /// Get the value of a key and return it, if it exists, otherwise
    /// return `None`.
    fn get(&self, key: &Bytes) -> Result<Option<Bytes>, Error> {
        loop {
            let entry = match self.ctx.keydir.get(key) {
                Some(entry) => *entry.value(),
                None => return Ok(None),
            };

            // Cached descriptors of retired files keep unlinked files
            // alive; drop them so the space can actually be reclaimed.
            let retired: Vec<u32> = self.ctx.retired.iter().map(|id| *id).collect();
            let mut readers = self.readers.borrow_mut();
            readers.drop(retired);

            match readers.get(self.ctx.path.as_path(), entry.fileid) {
                Ok(file) => {
                    return match file.read_value(entry.pos, entry.len) {
                        Ok(value) => Ok(Some(value)),
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            // The keydir never points past the end of a
                            // fully-written record.
                            Err(Error::Corrupt {
                                fileid: entry.fileid,
                                pos: entry.pos,
                                reason: "value extends past the end of the file",
                            })
                        }
                        Err(e) => Err(Error::io(format!(
                            "read a value from file {}",
                            entry.fileid
                        ))(e)),
                    };
                }
                Err(e)
                    if e.kind() == io::ErrorKind::NotFound
                        && self.ctx.retired.contains(&entry.fileid) =>
                {
                    // Lost the race with the merger: the entry was read
                    // before the swap and the file is gone. A fresh
                    // lookup sees either the post-swap location or the
                    // key's absence.
                    continue;
                }
                Err(e) => {
                    return Err(Error::io(format!("open data file {}", entry.fileid))(e));
                }
            }
        }
    }
}

/// Location of a key's live value on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyDirEntry {
    /// Logical id of the file holding the record.
    fileid: u32,
    /// Byte offset of the value within that file.
    pos: u64,
    /// Size of the value in bytes.
    len: u32,
    /// Timestamp of the record holding the value.
    tstamp: u64,
}

/// Keeping track of the number of live/dead keys and how much space the
/// dead keys occupy.
#[derive(Debug, Default)]
struct LogStatistics {
    live_keys: u64,
    dead_keys: u64,
    dead_bytes: u64,
}

impl LogStatistics {
    /// Add a live key to the statistics.
    fn add_live(&mut self) {
        self.live_keys += 1;
    }

    /// Add a dead key to the statistics where `nbytes` is the size of the
    /// entry on disk.
    fn add_dead(&mut self, nbytes: u64) {
        self.dead_keys += 1;
        self.dead_bytes += nbytes;
    }

    /// Turn a live key into a dead key where `nbytes` is the size of the
    /// entry on disk.
    fn overwrite(&mut self, nbytes: u64) {
        self.live_keys -= 1;
        self.dead_keys += 1;
        self.dead_bytes += nbytes;
    }

    /// Calculate the fraction of dead keys to total keys.
    fn fragmentation(&self) -> f64 {
        // This also avoids a division by zero when the file is empty.
        if self.dead_keys == 0 {
            0.0
        } else {
            let dead_keys = self.dead_keys as f64;
            let live_keys = self.live_keys as f64;
            dead_keys / (dead_keys + live_keys)
        }
    }
}

/// Total on-disk size of a record given its key and value lengths.
fn record_len(key_len: usize, value_len: u32) -> u64 {
    record::encoded_len(key_len, Some(value_len as usize))
}

/// Byte offset of a record's value, given where the record starts and the
/// bytes preceding the value.
fn value_pos(index: &RecordIndex, key: &[u8]) -> u64 {
    index.pos + record::RECORD_HEADER_SIZE as u64 + key.len() as u64
}

fn check_key_value(key: &[u8], value: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty"));
    }
    if key.len() as u64 > u32::MAX as u64 {
        return Err(Error::InvalidArgument("key does not fit in 32 bits"));
    }
    if value.len() as u64 >= record::TOMBSTONE as u64 {
        return Err(Error::InvalidArgument("value does not fit in 32 bits"));
    }
    Ok(())
}

/// Acquire the exclusive lock on the storage directory.
fn lock_directory(path: &Path) -> Result<File, Error> {
    let dirlock = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.join(utils::LOCK_FILE))
        .map_err(Error::io("open the lock file"))?;
    dirlock.try_lock_exclusive().map_err(|e| {
        if e.kind() == io::ErrorKind::WouldBlock {
            Error::LockHeld {
                path: path.to_path_buf(),
            }
        } else {
            Error::io("lock the storage directory")(e)
        }
    })?;
    Ok(dirlock)
}

/// What recovery does when a file ends in the middle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnShortRead {
    /// Truncate the file to the last record boundary. Applied to the last
    /// data file, whose tail a crashed append may have left incomplete.
    Truncate,
    /// Stop scanning the file and keep it as-is. Applied to merge files:
    /// a partial tail means the merge never swapped, so every complete
    /// record in the file is superseded by the data files scanned later
    /// and the file is removed as debris.
    Discard,
    /// Fail recovery. Applied everywhere else, where a short record can
    /// only mean corruption.
    Fail,
}

/// The in-memory state recovered from the data files at open.
#[derive(Debug)]
struct Recovered {
    keydir: DashMap<Bytes, KeyDirEntry>,
    stats: DashMap<u32, LogStatistics>,
    active_fileid: u32,
    last_tstamp: u64,
}

/// Read the given directory, rebuild the KeyDir, and gather statistics
/// about the Bitcask instance at that directory.
fn rebuild_storage(path: &Path) -> Result<Recovered, Error> {
    let keydir = DashMap::default();
    let stats = DashMap::default();
    let files = utils::list_fileids(path).map_err(Error::io("list data files"))?;
    let mut last_tstamp = 0;

    // Scan merge files before data files: a merge output only ever holds
    // copies that are no newer than a surviving data file record for the
    // same key, so this order makes "last record scanned wins" agree with
    // the order the records were originally written.
    for fileid in &files.mergefiles {
        populate_keydir_with_datafile(
            path,
            *fileid,
            &keydir,
            &stats,
            &mut last_tstamp,
            OnShortRead::Discard,
        )?;
    }
    for fileid in &files.datafiles {
        let on_short_read = if Some(fileid) == files.datafiles.last() {
            OnShortRead::Truncate
        } else {
            OnShortRead::Fail
        };
        populate_keydir_with_datafile(
            path,
            *fileid,
            &keydir,
            &stats,
            &mut last_tstamp,
            on_short_read,
        )?;
    }

    // A merge file referenced by no key is debris from a merge that never
    // swapped (or whose every copy has since been superseded). Merge
    // files never hold tombstones, so removing one cannot resurrect a
    // deleted key.
    let referenced: BTreeSet<u32> = keydir.iter().map(|entry| entry.value().fileid).collect();
    for fileid in &files.mergefiles {
        if !referenced.contains(fileid) {
            let file_path = utils::fileid_path(path, *fileid);
            warn!(fileid, "removing unreferenced merge file");
            stats.remove(fileid);
            fs::remove_file(&file_path)
                .map_err(Error::io(format!("remove {}", file_path.display())))?;
        }
    }

    let active_fileid = files.datafiles.last().map(|id| id + 1).unwrap_or_default();
    Ok(Recovered {
        keydir,
        stats,
        active_fileid,
        last_tstamp,
    })
}

/// Read the data file with `fileid` in `path` and populate the given maps.
fn populate_keydir_with_datafile(
    path: &Path,
    fileid: u32,
    keydir: &DashMap<Bytes, KeyDirEntry>,
    stats: &DashMap<u32, LogStatistics>,
    last_tstamp: &mut u64,
    on_short_read: OnShortRead,
) -> Result<(), Error> {
    let file_path = utils::fileid_path(path, fileid);
    let file =
        log::open(&file_path).map_err(Error::io(format!("open {}", file_path.display())))?;
    let mut iter =
        LogIterator::new(file).map_err(Error::io(format!("open {}", file_path.display())))?;
    loop {
        match iter.next() {
            Ok(Some((index, record))) => {
                *last_tstamp = (*last_tstamp).max(record.tstamp);
                match record.value {
                    // Tombstone
                    None => {
                        stats.entry(fileid).or_default().add_dead(index.len);
                        if let Some((key, prev)) = keydir.remove(&record.key) {
                            stats
                                .entry(prev.fileid)
                                .or_default()
                                .overwrite(record_len(key.len(), prev.len));
                        }
                    }
                    Some(value) => {
                        let key_len = record.key.len();
                        let keydir_entry = KeyDirEntry {
                            fileid,
                            pos: value_pos(&index, &record.key),
                            len: value.len() as u32,
                            tstamp: record.tstamp,
                        };
                        // Add live keys
                        stats.entry(fileid).or_default().add_live();
                        // Overwrite previous value
                        if let Some(prev) = keydir.insert(record.key, keydir_entry) {
                            if prev.tstamp > record.tstamp {
                                // Scan order stays authoritative; the
                                // wall clock went backwards at some point.
                                debug!(
                                    fileid,
                                    pos = index.pos,
                                    "timestamp regression between records of one key"
                                );
                            }
                            stats
                                .entry(prev.fileid)
                                .or_default()
                                .overwrite(record_len(key_len, prev.len));
                        }
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(RecordError::ShortRead) => match on_short_read {
                OnShortRead::Truncate => {
                    warn!(
                        fileid,
                        pos = iter.valid_pos(),
                        "dropping a truncated record at the end of the last data file"
                    );
                    let file = OpenOptions::new()
                        .write(true)
                        .open(&file_path)
                        .map_err(Error::io(format!("open {}", file_path.display())))?;
                    file.set_len(iter.valid_pos())
                        .map_err(Error::io(format!("truncate {}", file_path.display())))?;
                    return Ok(());
                }
                OnShortRead::Discard => {
                    warn!(
                        fileid,
                        pos = iter.valid_pos(),
                        "ignoring a truncated record at the end of a merge file"
                    );
                    return Ok(());
                }
                OnShortRead::Fail => {
                    return Err(Error::Corrupt {
                        fileid,
                        pos: iter.valid_pos(),
                        reason: "record truncated in the middle of the file",
                    })
                }
            },
            Err(RecordError::Corrupt(reason)) => {
                return Err(Error::Corrupt {
                    fileid,
                    pos: iter.valid_pos(),
                    reason,
                })
            }
            Err(RecordError::Io(e)) => {
                return Err(Error::io(format!("scan {}", file_path.display()))(e))
            }
        }
    }
}
