use bytes::{Buf, BytesMut};
use std::cmp::min;
use std::io;

/// Bounded FIFO byte queue feeding the frame reader. Data is appended at the
/// tail from the transport and consumed from the head by the codec; the bound
/// keeps one misbehaving peer from buffering unbounded garbage.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(size),
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drops `count` consumed bytes from the head.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.data.advance(count)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear()
    }

    /// Reads from the transport until it would block, the buffer fills, or
    /// the peer closes. Returns the bytes read and whether EOF was observed.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];

        while self.data.len() < self.size {
            let want = min(chunk.len(), self.size - self.data.len());

            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok((total, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport stand-in delivering its data in fixed-size chunks, then
    /// signalling either would-block or EOF.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        eof_at_end: bool,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, eof_at_end: bool) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                eof_at_end,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof_at_end {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_ingress_reads_until_would_block() {
        let payload: Vec<u8> = (0..200).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 7, false);
        let mut buffer = Buffer::new(1024);

        let (count, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, payload.len());
        assert!(!eof);
        assert_eq!(buffer.read_slice(), &payload[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut channel = MockChannel::new(vec![1, 2, 3], 16, true);
        let mut buffer = Buffer::new(1024);

        let (count, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 3);
        assert!(eof);
    }

    #[test]
    fn test_ingress_stops_at_capacity() {
        let payload = vec![9u8; 100];
        let mut channel = MockChannel::new(payload, 16, false);
        let mut buffer = Buffer::new(64);

        let (count, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 64);
        assert!(!eof);
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer.free_capacity(), 0);

        // Draining the head makes room for the rest.
        buffer.advance(32);
        let (count, _) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 32);
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn test_ingress_propagates_errors() {
        struct Broken;

        impl io::Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }

        let mut buffer = Buffer::new(64);
        let result = buffer.ingress(Broken);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_advance_and_clear() {
        let mut buffer = Buffer::new(64);
        buffer.ingress(&mut MockChannel::new(vec![1, 2, 3, 4], 16, false)).unwrap();

        buffer.advance(2);
        assert_eq!(buffer.read_slice(), &[3, 4]);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 64);
    }
}
