//! Append-only log files: the writer for the active file, positioned
//! readers for sealed files, and the sequential iterator used by recovery.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;

use super::bufio::{BufReaderWithPos, BufWriterWithPos};
use super::record::{self, Record, RecordError};
use super::utils;

/// Location and size of one record within a data file.
#[derive(Debug, Clone, Copy)]
pub(super) struct RecordIndex {
    pub(super) pos: u64,
    pub(super) len: u64,
}

/// Create a fresh log file. The file must not already exist; fileids are
/// never reused, so a collision is a logic error surfaced as `Io`.
pub(super) fn create<P>(path: P) -> io::Result<File>
where
    P: AsRef<Path>,
{
    OpenOptions::new().create_new(true).write(true).open(path)
}

/// Open an existing log file for reading.
pub(super) fn open<P>(path: P) -> io::Result<File>
where
    P: AsRef<Path>,
{
    OpenOptions::new().read(true).open(path)
}

/// Appends records to one log file.
///
/// Every append flushes the buffered bytes to the OS before returning, so
/// a location published to the keydir always refers to readable bytes.
#[derive(Debug)]
pub(super) struct LogWriter {
    writer: BufWriterWithPos<File>,
    sealed: bool,
}

impl LogWriter {
    pub(super) fn new(file: File) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriterWithPos::new(file)?,
            sealed: false,
        })
    }

    /// Append one record, returning where it landed.
    pub(super) fn append(
        &mut self,
        tstamp: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> io::Result<RecordIndex> {
        if self.sealed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "append to a sealed log file",
            ));
        }
        let pos = self.writer.pos();
        let len = record::write_record(&mut self.writer, tstamp, key, value)?;
        self.writer.flush()?;
        Ok(RecordIndex { pos, len })
    }

    /// Current logical size of the file.
    pub(super) fn pos(&self) -> u64 {
        self.writer.pos()
    }

    /// Flush buffered bytes and force them to stable storage.
    pub(super) fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Sync and mark the file immutable. Further appends fail.
    pub(super) fn seal(&mut self) -> io::Result<()> {
        self.sync()?;
        self.sealed = true;
        Ok(())
    }
}

/// Reads value bytes from one log file at known positions.
#[derive(Debug)]
pub(super) struct LogReader {
    file: File,
}

impl LogReader {
    fn new(file: File) -> Self {
        Self { file }
    }

    /// Read `len` bytes at `pos`. Running past the end of the file means
    /// the location does not point at fully-written bytes.
    pub(super) fn read_value(&mut self, pos: u64, len: u32) -> io::Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf.into())
    }
}

/// A cache of open read handles keyed by fileid, opening files on demand.
///
/// Each reader owns one of these, so no synchronization is needed around
/// the seek-then-read pairs. An open handle keeps the backing file alive
/// even after the merger unlinks it; [`LogDir::drop`] evicts handles of
/// retired files so the space can be reclaimed.
#[derive(Debug, Default)]
pub(super) struct LogDir(HashMap<u32, LogReader>);

impl LogDir {
    pub(super) fn get<P>(&mut self, path: P, fileid: u32) -> io::Result<&mut LogReader>
    where
        P: AsRef<Path>,
    {
        use std::collections::hash_map::Entry;
        match self.0.entry(fileid) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let file = open(utils::fileid_path(path, fileid))?;
                Ok(e.insert(LogReader::new(file)))
            }
        }
    }

    /// Evict the cached handles of the given fileids.
    pub(super) fn drop<I>(&mut self, fileids: I)
    where
        I: IntoIterator<Item = u32>,
    {
        for fileid in fileids {
            self.0.remove(&fileid);
        }
    }
}

/// Sequentially decodes the records of one log file, reporting the byte
/// position of each.
#[derive(Debug)]
pub(super) struct LogIterator {
    reader: BufReaderWithPos<File>,
    // End of the last successfully decoded record. A failed decode may
    // leave the underlying reader past this point.
    valid_pos: u64,
}

impl LogIterator {
    pub(super) fn new(file: File) -> io::Result<Self> {
        let reader = BufReaderWithPos::new(file)?;
        let valid_pos = reader.pos();
        Ok(Self { reader, valid_pos })
    }

    /// Decode the next record, or `None` at a clean end-of-file.
    pub(super) fn next(&mut self) -> Result<Option<(RecordIndex, Record)>, RecordError> {
        let pos = self.valid_pos;
        match record::read_record(&mut self.reader)? {
            Some((record, len)) => {
                self.valid_pos = pos + len;
                Ok(Some((RecordIndex { pos, len }, record)))
            }
            None => Ok(None),
        }
    }

    /// Byte offset one past the last successfully decoded record. After a
    /// short read this is the truncation boundary.
    pub(super) fn valid_pos(&self) -> u64 {
        self.valid_pos
    }
}
