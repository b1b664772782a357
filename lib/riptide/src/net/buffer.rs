use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Page-mirrored deques only come in 64k steps.
const BUF_SIZE_INCREMENT: usize = 65536;

/// Bounded FIFO byte queue backing one direction of a stream. Bytes are
/// appended at the tail and consumed from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Room left before the buffer refuses further ingress.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Drop `count` bytes off the head after they have been consumed.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Mark `count` bytes of the spare area as written.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Buffered bytes, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Writable spare area; follow up with `commit`.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Pull bytes from the reader until it would block or the buffer is
    /// full. A clean end-of-stream surfaces as `UnexpectedEof` so callers
    /// can tear the connection down.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.free_capacity() > 0 {
            let spare = self.free_capacity();
            let read_count = match reader.read(&mut self.spare_mut()[..spare]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            self.commit(read_count);
            total += read_count;
        }

        Ok(total)
    }

    /// Push buffered bytes into the writer, advancing the head past
    /// whatever was accepted. A `WouldBlock` mid-way is surfaced so the
    /// caller re-arms for writable readiness.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.consume(write_count);
        }

        Ok(orig_len - self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

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

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
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

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.data(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2).map(|item| item as u8).collect();

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let count = buffer.ingress(&mock_data[..]).unwrap();

        assert_eq!(count, BUF_SIZE_INCREMENT);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_ingress_eof() {
        let short: Vec<u8> = vec![1, 2, 3];

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(Cursor::new(&short));

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(buffer.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.spare_mut()[0] = 1;
        buffer.commit(1);

        let result = buffer.egress(&mut zero_vec[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_egress_would_block_keeps_tail() {
        let mock_data: Vec<_> = (0..1000u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(Vec::new(), 100, 300);

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.spare_mut()[..mock_data.len()].copy_from_slice(&mock_data);
        buffer.commit(mock_data.len());

        let result = buffer.egress(&mut channel);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 700);
        assert_eq!(channel.data[..], mock_data[..300]);
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 65536, got 100000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(100000);
    }
}
