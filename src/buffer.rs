use std::io::{self, IoSliceMut};

use crate::net::tcp::TcpStream;

/// Cheap-prepend byte buffer in the netty/muduo mould:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=     capacity
/// ```
///
/// `kCheapPrepend` bytes at the front are reserved so a caller can prepend a
/// length header without a second allocation.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

pub const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advances the reader index past `len` bytes; if `len` would consume
    /// everything readable (or more), resets both indices instead.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn begin_write_mut(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.buf[start..]
    }

    /// Scatter-reads from `stream` into the writable tail plus a stack-local
    /// overflow region, so a payload larger than the current tail doesn't
    /// require pre-growing the buffer for every wake-up. Returns the number
    /// of bytes read (0 on EOF).
    pub fn read_from(&mut self, stream: &TcpStream) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let tail = self.begin_write_mut();
            let mut slices = [
                IoSliceMut::new(tail),
                IoSliceMut::new(&mut extra_buf),
            ];
            stream.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the readable region to `stream` and retires the bytes that
    /// were actually accepted. Returns the number of bytes written.
    pub fn write_to(&mut self, stream: &TcpStream) -> io::Result<usize> {
        let n = stream.write_once(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.retrieve_all_as_string(), "hello");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_partial_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.retrieve_all_as_string(), "world");
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new();
        let big = vec![7u8; INITIAL_SIZE * 4];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn compacts_instead_of_growing_when_room_exists() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.retrieve(8);
        let cap_before = buf.buf.len();
        buf.ensure_writable(INITIAL_SIZE - 16);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.reader_index, CHEAP_PREPEND);
    }
}
