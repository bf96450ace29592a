use std::cmp;
use std::io;

/// Initial capacity of a fresh buffer.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Granularity of writable space requested by the ingress loop.
const READ_CHUNK: usize = 4 * 1024;

/// A contiguous byte region with read and write cursors. Data is appended
/// behind the write cursor and drained from the read cursor; both cursors
/// rewind to zero once the buffer is fully drained. Growth doubles the
/// backing storage unless the dead prefix in front of the read cursor
/// already covers the shortage, in which case the live bytes are compacted
/// to the front instead.
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_CAPACITY)
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; cmp::max(capacity, 1)],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Free space behind the write cursor.
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// View of the unread bytes.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advances the read cursor; both cursors rewind once everything has
    /// been consumed.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.read_pos = cmp::min(self.read_pos + count, self.write_pos);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Region behind the write cursor for direct-read syscalls.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Marks `count` bytes of the writable region as written.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        debug_assert!(self.write_pos + count <= self.data.len());
        self.write_pos += count;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Makes room for at least `needed` writable bytes, compacting when the
    /// dead prefix covers the shortage and doubling otherwise.
    pub fn ensure_writable(&mut self, needed: usize) {
        let tail = self.data.len() - self.write_pos;
        if tail >= needed {
            return;
        }

        let shortage = needed - tail;
        if self.read_pos >= shortage {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
            return;
        }

        let mut new_capacity = cmp::max(self.data.len() * 2, 1);
        while new_capacity - self.write_pos < needed {
            new_capacity *= 2;
        }
        self.data.resize(new_capacity, 0);
    }

    /// Reads from `reader` until it would block or signals end of stream.
    /// Returns the byte count and whether end of stream was observed.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        loop {
            if self.writable_len() == 0 {
                self.ensure_writable(READ_CHUNK);
            }
            match reader.read(self.write_slice()) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.advance(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, false))
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the unread bytes to `writer`, advancing the read cursor.
    /// Stops without error when the writer would block.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cursor_accounting() {
        let mut buffer = Buffer::with_capacity(64);

        buffer.append(b"hello world");
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.read_slice(), b"hello world");

        buffer.consume(6);
        assert_eq!(buffer.read_slice(), b"world");

        // Draining fully rewinds both cursors.
        buffer.consume(5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.writable_len(), 64);
    }

    #[test]
    fn test_append_grows_by_doubling() {
        let mut buffer = Buffer::with_capacity(8);

        buffer.append(&[7u8; 20]);

        assert_eq!(buffer.len(), 20);
        assert!(buffer.capacity() >= 20);
        assert_eq!(buffer.read_slice(), &[7u8; 20][..]);
    }

    #[test]
    fn test_compaction_instead_of_growth() {
        let mut buffer = Buffer::with_capacity(16);

        buffer.append(&[1u8; 12]);
        buffer.consume(10);
        let capacity_before = buffer.capacity();

        // 2 live bytes, 10 dead prefix bytes, 4 tail bytes: an 8-byte
        // append fits after compaction without reallocating.
        buffer.append(&[2u8; 8]);

        assert_eq!(buffer.capacity(), capacity_before);
        assert_eq!(buffer.len(), 10);
        assert_eq!(&buffer.read_slice()[..2], &[1u8, 1u8]);
        assert_eq!(&buffer.read_slice()[2..], &[2u8; 8][..]);
    }

    #[test]
    fn test_ingress_reads_until_would_block() {
        let payload: Vec<u8> = (0..1000).map(|n| n as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 64, 0);

        let mut buffer = Buffer::with_capacity(256);
        let (count, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, payload.len());
        assert!(!eof);
        assert_eq!(buffer.read_slice(), &payload[..]);
    }

    #[test]
    fn test_ingress_reports_end_of_stream() {
        let mut empty = io::Cursor::new(Vec::<u8>::new());
        let mut buffer = Buffer::new();

        let (count, eof) = buffer.ingress(&mut empty).unwrap();

        assert_eq!(count, 0);
        assert!(eof);
    }

    #[test]
    fn test_egress_partial_write() {
        let mut channel = MockChannel::new(Vec::new(), 10, 25);
        let mut buffer = Buffer::new();
        buffer.append(&[9u8; 40]);

        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, 25);
        assert_eq!(buffer.len(), 15);

        channel.max_size = 100;
        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, 15);
        assert!(buffer.is_empty());
        assert_eq!(channel.data, vec![9u8; 40]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroWriter;
        impl io::Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new();
        buffer.append(b"x");

        let result = buffer.egress(&mut ZeroWriter);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_write_slice_roundtrip() {
        let mut buffer = Buffer::with_capacity(32);

        let slice = buffer.write_slice();
        slice[..4].copy_from_slice(b"abcd");
        buffer.advance(4);

        assert_eq!(buffer.read_slice(), b"abcd");
    }
}
