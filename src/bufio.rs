/*!
 * Buffered Connection I/O
 *
 * A reader that refills a pooled [`Buffer`](crate::buffer::Buffer) from any
 * `Read` source and exposes mark/advance/line/slice/exact primitives that
 * never themselves perform I/O (parsing only ever looks at what's already
 * buffered, and backs off with `ProxyError::BufferFull` when it needs more).
 * A writer that accumulates scatter-gather segments and flushes them with a
 * single vectored write, latching on first error the way a `bufio.Writer`
 * does.
 */

use crate::buffer::{self, Buffer};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::io::{IoSlice, Read, Write};

const MAX_WRITEV_SIZE: usize = 1024;

/// Buffered reader over any byte source, backed by a pooled [`Buffer`].
pub struct Reader<R> {
    rd: R,
    buf: Buffer,
    err: Option<ProxyError>,
}

impl<R: Read> Reader<R> {
    pub fn new(rd: R, buf: Buffer) -> Self {
        Reader { rd, buf, err: None }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    /// Borrow the underlying source, e.g. to interleave a write on the same
    /// connection between reads.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rd
    }

    /// Current read position, to be restored via [`Reader::advance_to`] if a
    /// parse attempt runs out of buffered bytes partway through.
    pub fn mark(&self) -> usize {
        self.buf.read_cursor()
    }

    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub fn advance_to(&mut self, mark: usize) {
        self.buf.advance_to(mark);
    }

    fn fill(&mut self) -> std::io::Result<usize> {
        let n = self.rd.read(self.buf.write_tail_mut())?;
        self.buf.advance_write(n);
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        }
        Ok(n)
    }

    /// Refill the buffer with everything currently available on the socket,
    /// growing or shrinking the backing storage first if needed.
    pub fn read(&mut self) -> Result<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if self.buf.buffered() == self.buf.len() {
            self.buf.grow();
        }
        if self.buf.write_cursor() == self.buf.len() {
            self.buf.shrink();
        }
        match self.fill() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => {
                let pe = ProxyError::from(e);
                self.err = Some(pe.clone());
                Err(pe)
            }
        }
    }

    /// Read up to and including the next `\r\n`, or fail with `BufferFull`.
    pub fn read_line(&mut self) -> Result<&[u8]> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        let bytes = self.buf.bytes();
        match find_crlf(bytes) {
            Some(idx) => {
                let start = self.buf.read_cursor();
                self.buf.advance(idx + 2);
                Ok(&self.buf_slice(start, start + idx + 2))
            }
            None => Err(ProxyError::BufferFull),
        }
    }

    /// Read up to and including `delim`, or fail with `BufferFull`.
    pub fn read_slice(&mut self, delim: u8) -> Result<&[u8]> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        let bytes = self.buf.bytes();
        match bytes.iter().position(|&b| b == delim) {
            Some(idx) => {
                let start = self.buf.read_cursor();
                self.buf.advance(idx + 1);
                Ok(self.buf_slice(start, start + idx + 1))
            }
            None => Err(ProxyError::BufferFull),
        }
    }

    /// Read exactly `n` bytes, or fail with `BufferFull`. Never touches the
    /// socket: it only ever serves what's already buffered.
    pub fn read_exact(&mut self, n: usize) -> Result<&[u8]> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if self.buf.buffered() < n {
            return Err(ProxyError::BufferFull);
        }
        let start = self.buf.read_cursor();
        self.buf.advance(n);
        Ok(self.buf_slice(start, start + n))
    }

    fn buf_slice(&self, start: usize, end: usize) -> &[u8] {
        &self.buf.full()[start..end]
    }
}

fn find_crlf(s: &[u8]) -> Option<usize> {
    s.windows(2).position(|w| w == b"\r\n")
}

/// Buffered, scatter-gather writer. Accumulates segments until `flush` or
/// the segment cap is hit, then issues one vectored write.
pub struct Writer<W> {
    wr: W,
    segs: Vec<Bytes>,
    err: Option<ProxyError>,
}

impl<W: Write> Writer<W> {
    pub fn new(wr: W) -> Self {
        Writer {
            wr,
            segs: Vec::with_capacity(MAX_WRITEV_SIZE),
            err: None,
        }
    }

    /// Queue a segment for the next flush. Flushes automatically once the
    /// segment cap is reached.
    pub fn write(&mut self, p: Bytes) -> Result<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if p.is_empty() {
            return Ok(());
        }
        self.segs.push(p);
        if self.segs.len() >= MAX_WRITEV_SIZE {
            return self.flush();
        }
        Ok(())
    }

    /// Flush all queued segments via a single (possibly multi-syscall)
    /// vectored write. Once an error occurs the writer latches: every
    /// subsequent write/flush returns the same error.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if self.segs.is_empty() {
            return Ok(());
        }
        let result = write_all_vectored(&mut self.wr, &self.segs);
        self.segs.clear();
        if let Err(e) = result {
            let pe = ProxyError::from(e);
            self.err = Some(pe.clone());
            return Err(pe);
        }
        Ok(())
    }
}

fn write_all_vectored<W: Write>(w: &mut W, segs: &[Bytes]) -> std::io::Result<()> {
    let mut offsets: Vec<usize> = vec![0; segs.len()];
    loop {
        let slices: Vec<IoSlice> = segs
            .iter()
            .zip(offsets.iter())
            .filter(|(s, &off)| off < s.len())
            .map(|(s, &off)| IoSlice::new(&s[off..]))
            .collect();
        if slices.is_empty() {
            return Ok(());
        }
        let mut n = w.write_vectored(&slices)?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "write zero"));
        }
        for (seg, off) in segs.iter().zip(offsets.iter_mut()) {
            if n == 0 {
                break;
            }
            let remaining = seg.len() - *off;
            let take = remaining.min(n);
            *off += take;
            n -= take;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_line_returns_buffer_full_until_crlf_arrives() {
        let mut r = Reader::new(Cursor::new(b"PING\r\n".to_vec()), buffer::get(64));
        r.read().unwrap();
        let line = r.read_line().unwrap();
        assert_eq!(line, b"PING\r\n");
    }

    #[test]
    fn read_exact_never_touches_socket() {
        let mut r = Reader::new(Cursor::new(b"12345".to_vec()), buffer::get(64));
        assert!(matches!(r.read_exact(3), Err(ProxyError::BufferFull)));
        r.read().unwrap();
        assert_eq!(r.read_exact(3).unwrap(), b"123");
    }

    #[test]
    fn writer_flushes_multiple_segments_in_order() {
        let mut out = Vec::new();
        {
            let mut w = Writer::new(&mut out);
            w.write(Bytes::from_static(b"+")).unwrap();
            w.write(Bytes::from_static(b"OK")).unwrap();
            w.write(Bytes::from_static(b"\r\n")).unwrap();
            w.flush().unwrap();
        }
        assert_eq!(out, b"+OK\r\n");
    }
}
