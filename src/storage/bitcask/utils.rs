//! Naming conventions and enumeration for the files in a storage directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the file whose exclusive OS lock guards the storage directory.
pub(super) const LOCK_FILE: &str = "LOCK";

const DATAFILE_EXT: &str = "data";
const MERGEFILE_EXT: &str = "merge";

/// High bit of the fileid space, reserved for merge output files. Data
/// files allocated by the writer always stay below it, so the merger can
/// allocate fileids without coordinating with the writer.
pub(super) const MERGE_FILEID_BASE: u32 = 1 << 31;

/// Path of the data file with the given fileid. Fileids are zero-padded so
/// lexicographic order matches numeric order.
pub(super) fn datafile_name<P>(path: P, fileid: u32) -> PathBuf
where
    P: AsRef<Path>,
{
    path.as_ref().join(format!("{fileid:010}.{DATAFILE_EXT}"))
}

/// Path of the merge output file with the given sequence number (the
/// logical fileid without [`MERGE_FILEID_BASE`]).
pub(super) fn mergefile_name<P>(path: P, seq: u32) -> PathBuf
where
    P: AsRef<Path>,
{
    path.as_ref().join(format!("{seq:010}.{MERGEFILE_EXT}"))
}

/// Path of the file backing a logical fileid, either kind.
pub(super) fn fileid_path<P>(path: P, fileid: u32) -> PathBuf
where
    P: AsRef<Path>,
{
    if fileid & MERGE_FILEID_BASE != 0 {
        mergefile_name(path, fileid & !MERGE_FILEID_BASE)
    } else {
        datafile_name(path, fileid)
    }
}

/// Parse the logical fileid encoded in a file name. Returns `None` for
/// files that don't follow the store's naming conventions; such files are
/// ignored, never deleted.
pub(super) fn parse_fileid(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: u32 = stem.parse().ok()?;
    if id & MERGE_FILEID_BASE != 0 {
        return None;
    }
    match path.extension()?.to_str()? {
        DATAFILE_EXT => Some(id),
        MERGEFILE_EXT => Some(id | MERGE_FILEID_BASE),
        _ => None,
    }
}

/// The recognized files of a storage directory, each list sorted by
/// ascending logical fileid.
#[derive(Debug, Default)]
pub(super) struct StoreFiles {
    pub(super) datafiles: Vec<u32>,
    pub(super) mergefiles: Vec<u32>,
}

/// Enumerate the recognized files in the storage directory.
pub(super) fn list_fileids<P>(path: P) -> io::Result<StoreFiles>
where
    P: AsRef<Path>,
{
    let mut files = StoreFiles::default();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if let Some(fileid) = parse_fileid(&entry.path()) {
            if fileid & MERGE_FILEID_BASE != 0 {
                files.mergefiles.push(fileid);
            } else {
                files.datafiles.push(fileid);
            }
        }
    }
    files.datafiles.sort_unstable();
    files.mergefiles.sort_unstable();
    Ok(files)
}

/// Microseconds since the Unix epoch. The writer makes the sequence
/// strictly monotonic even when the wall clock regresses.
pub(super) fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
