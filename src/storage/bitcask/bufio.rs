//! Buffered reader and writer that keep track of their own byte position,
//! so callers don't have to issue `seek` just to learn where they are.

use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

/// A buffered reader that tracks the position of its next read.
#[derive(Debug)]
pub(super) struct BufReaderWithPos<R>
where
    R: Read + Seek,
{
    reader: BufReader<R>,
    pos: u64,
}

impl<R> BufReaderWithPos<R>
where
    R: Read + Seek,
{
    pub(super) fn new(mut inner: R) -> io::Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(Self {
            reader: BufReader::new(inner),
            pos,
        })
    }

    /// Byte offset of the next read.
    pub(super) fn pos(&self) -> u64 {
        self.pos
    }
}

impl<R> Read for BufReaderWithPos<R>
where
    R: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R> Seek for BufReaderWithPos<R>
where
    R: Read + Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// A buffered writer that tracks the position of its next write.
#[derive(Debug)]
pub(super) struct BufWriterWithPos<W>
where
    W: Write + Seek,
{
    writer: BufWriter<W>,
    pos: u64,
}

impl<W> BufWriterWithPos<W>
where
    W: Write + Seek,
{
    pub(super) fn new(mut inner: W) -> io::Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            writer: BufWriter::new(inner),
            pos,
        })
    }

    /// Byte offset of the next write, i.e. the current logical file size
    /// when appending.
    pub(super) fn pos(&self) -> u64 {
        self.pos
    }

    pub(super) fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl<W> Write for BufWriterWithPos<W>
where
    W: Write + Seek,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn writer_tracks_position() {
        let mut w = BufWriterWithPos::new(Cursor::new(Vec::new())).unwrap();
        assert_eq!(0, w.pos());
        w.write_all(b"hello").unwrap();
        assert_eq!(5, w.pos());
        w.write_all(b" world").unwrap();
        assert_eq!(11, w.pos());
        w.flush().unwrap();
        assert_eq!(b"hello world".as_slice(), w.get_ref().get_ref().as_slice());
    }

    #[test]
    fn writer_starts_at_end() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        cursor.seek(SeekFrom::Start(0)).unwrap();
        let w = BufWriterWithPos::new(cursor).unwrap();
        assert_eq!(3, w.pos());
    }

    #[test]
    fn reader_tracks_position() {
        let mut r = BufReaderWithPos::new(Cursor::new(b"hello world".to_vec())).unwrap();
        let mut buf = [0u8; 5];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(5, r.pos());
        assert_eq!(b"hello", &buf);
        r.seek(SeekFrom::Start(6)).unwrap();
        r.read_exact(&mut buf).unwrap();
        assert_eq!(11, r.pos());
        assert_eq!(b"world", &buf);
    }
}
