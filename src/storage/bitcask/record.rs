//! The on-disk record codec.
//!
//! Each record is a fixed-size header followed by the key and value bytes:
//!
//! ```text
//! +-------+--------+----------+------------+-----~~~-----+------~~~------+
//! | crc32 | tstamp | key_size | value_size |     key     |     value     |
//! |  (4)  |  (8)   |   (4)    |    (4)     | (key_size)  | (value_size)  |
//! +-------+--------+----------+------------+-----~~~-----+------~~~------+
//! ```
//!
//! All integers are little-endian. A `value_size` equal to [`TOMBSTONE`]
//! marks a deletion and the value bytes are omitted. The CRC-32 (IEEE) is
//! computed over every header field after the checksum itself plus the key
//! and value bytes, so any flipped bit in a record is detected.

use std::io::{self, Read, Write};

use bytes::Bytes;

/// Number of bytes occupied by the record header.
pub(super) const RECORD_HEADER_SIZE: usize = 20;

/// Sentinel stored in the `value_size` field of a tombstone record. The
/// checksum covers this literal, not a logical zero length.
pub(super) const TOMBSTONE: u32 = u32::MAX;

/// A decoded data file record. A `None` value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Record {
    pub(super) tstamp: u64,
    pub(super) key: Bytes,
    pub(super) value: Option<Bytes>,
}

/// Failure modes of [`read_record`].
#[derive(Debug)]
pub(super) enum RecordError {
    /// The source ended inside a record. During recovery this marks a
    /// truncated trailing record; anywhere else it is corruption.
    ShortRead,
    /// The record is structurally invalid or its checksum does not match.
    Corrupt(&'static str),
    /// The underlying source failed with something other than a clean EOF.
    Io(io::Error),
}

/// Total encoded size of a record with the given key and value lengths.
/// `None` encodes a tombstone, which carries no value bytes.
pub(super) fn encoded_len(key_len: usize, value_len: Option<usize>) -> u64 {
    RECORD_HEADER_SIZE as u64 + key_len as u64 + value_len.unwrap_or(0) as u64
}

/// Encode one record into `w`. Returns the number of bytes written.
///
/// The caller is responsible for validating that `key` is non-empty and
/// that the key and value lengths fit their 32-bit size fields.
pub(super) fn write_record<W: Write>(
    w: &mut W,
    tstamp: u64,
    key: &[u8],
    value: Option<&[u8]>,
) -> io::Result<u64> {
    let key_size = key.len() as u32;
    let value_size = match value {
        Some(v) => v.len() as u32,
        None => TOMBSTONE,
    };

    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[4..12].copy_from_slice(&tstamp.to_le_bytes());
    header[12..16].copy_from_slice(&key_size.to_le_bytes());
    header[16..20].copy_from_slice(&value_size.to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(key);
    if let Some(v) = value {
        hasher.update(v);
    }
    header[..4].copy_from_slice(&hasher.finalize().to_le_bytes());

    w.write_all(&header)?;
    w.write_all(key)?;
    if let Some(v) = value {
        w.write_all(v)?;
    }
    Ok(encoded_len(key.len(), value.map(<[u8]>::len)))
}

/// Decode one record from `r`.
///
/// Returns `Ok(None)` on a clean EOF before the first header byte, i.e.
/// the end of a well-formed file.
pub(super) fn read_record<R: Read>(r: &mut R) -> Result<Option<(Record, u64)>, RecordError> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let mut filled = 0;
    while filled < header.len() {
        match r.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecordError::Io(e)),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < header.len() {
        return Err(RecordError::ShortRead);
    }

    let crc = u32::from_le_bytes(header[..4].try_into().unwrap());
    let tstamp = u64::from_le_bytes(header[4..12].try_into().unwrap());
    let key_size = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let value_size = u32::from_le_bytes(header[16..20].try_into().unwrap());

    if key_size == 0 {
        return Err(RecordError::Corrupt("zero key size"));
    }

    let mut key = vec![0u8; key_size as usize];
    read_exact_or_short(r, &mut key)?;

    let value = if value_size == TOMBSTONE {
        None
    } else {
        let mut value = vec![0u8; value_size as usize];
        read_exact_or_short(r, &mut value)?;
        Some(value)
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(&key);
    if let Some(v) = &value {
        hasher.update(v);
    }
    if hasher.finalize() != crc {
        return Err(RecordError::Corrupt("checksum mismatch"));
    }

    let len = encoded_len(key.len(), value.as_ref().map(Vec::len));
    let record = Record {
        tstamp,
        key: Bytes::from(key),
        value: value.map(Bytes::from),
    };
    Ok(Some((record, len)))
}

fn read_exact_or_short<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), RecordError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RecordError::ShortRead,
        _ => RecordError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn encode(tstamp: u64, key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = write_record(&mut buf, tstamp, key, value).unwrap();
        assert_eq!(len, buf.len() as u64);
        buf
    }

    #[test]
    fn roundtrip() {
        let buf = encode(42, b"key_a", Some(b"value_a"));
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 5 + 7);

        let (record, len) = read_record(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(len, buf.len() as u64);
        assert_eq!(42, record.tstamp);
        assert_eq!(Bytes::from_static(b"key_a"), record.key);
        assert_eq!(Some(Bytes::from_static(b"value_a")), record.value);
    }

    #[test]
    fn roundtrip_empty_value() {
        let buf = encode(7, b"k", Some(b""));
        let (record, _) = read_record(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(Some(Bytes::new()), record.value);
    }

    #[test]
    fn roundtrip_tombstone() {
        let buf = encode(7, b"gone", None);
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 4);
        // The sentinel is stored literally in the value_size field.
        assert_eq!([0xff; 4], buf[16..20]);

        let (record, len) = read_record(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(len, buf.len() as u64);
        assert_eq!(None, record.value);
    }

    #[test]
    fn clean_eof_yields_none() {
        assert!(read_record(&mut Cursor::new(&[])).unwrap().is_none());
    }

    #[test]
    fn multiple_records_in_sequence() {
        let mut buf = encode(1, b"a", Some(b"1"));
        buf.extend(encode(2, b"b", None));
        buf.extend(encode(3, b"c", Some(b"3")));

        let mut cursor = Cursor::new(&buf);
        let keys: Vec<Bytes> = std::iter::from_fn(|| {
            read_record(&mut cursor).unwrap().map(|(r, _)| r.key)
        })
        .collect();
        assert_eq!(
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ],
            keys
        );
    }

    #[test]
    fn truncation_at_every_length_is_short_read() {
        let buf = encode(9, b"key", Some(b"value"));
        for cut in 1..buf.len() {
            match read_record(&mut Cursor::new(&buf[..cut])) {
                Err(RecordError::ShortRead) => {}
                other => panic!("cut at {cut}: expected ShortRead, got {other:?}"),
            }
        }
    }

    #[test]
    fn every_flipped_bit_is_rejected() {
        let buf = encode(1234567, b"key_a", Some(b"value_a"));
        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut flipped = buf.clone();
                flipped[byte] ^= 1 << bit;
                match read_record(&mut Cursor::new(&flipped)) {
                    // A flipped size field may run past the end of the
                    // input; anything else must fail the checksum.
                    Err(RecordError::Corrupt(_)) | Err(RecordError::ShortRead) => {}
                    other => panic!("flip {byte}:{bit}: record accepted: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn zero_key_size_is_corrupt() {
        let mut buf = encode(1, b"x", Some(b"y"));
        // Zero out the key_size field and fix up the checksum so only the
        // structural check can reject it.
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..]);
        let crc = hasher.finalize();
        buf[..4].copy_from_slice(&crc.to_le_bytes());
        match read_record(&mut Cursor::new(&buf)) {
            Err(RecordError::Corrupt(reason)) => assert_eq!("zero key size", reason),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
