/*!
 * Pooled Byte Buffers
 *
 * Power-of-two size-classed buffers, recycled through per-class free lists
 * so steady-state operation allocates nothing on the hot path. Mirrors the
 * size ladder and grow/shrink primitives of a classic bufio-style buffer:
 * a single backing `Vec<u8>` with independent read (`r`) and write (`w`)
 * cursors over the unread span `[r, w)`.
 */

use parking_lot::Mutex;
use std::sync::OnceLock;

const MIN_SIZE: usize = 512;
const MAX_SIZE: usize = 512 * 1024 * 1024;
const GROW_FACTOR: usize = 2;

fn size_classes() -> &'static [usize] {
    static CLASSES: OnceLock<Vec<usize>> = OnceLock::new();
    CLASSES.get_or_init(|| {
        let mut v = Vec::new();
        let mut sz = MIN_SIZE;
        while sz <= MAX_SIZE {
            v.push(sz);
            sz *= GROW_FACTOR;
        }
        v
    })
}

fn pools() -> &'static [Mutex<Vec<Buffer>>] {
    static POOLS: OnceLock<Vec<Mutex<Vec<Buffer>>>> = OnceLock::new();
    POOLS.get_or_init(|| size_classes().iter().map(|_| Mutex::new(Vec::new())).collect())
}

fn class_index(size: usize) -> Option<usize> {
    size_classes().iter().position(|&s| s >= size)
}

/// A pooled, cursor-tracked byte slab.
///
/// Invariant: unread bytes live in `buf[r..w]`; `r <= w <= buf.len()`.
pub struct Buffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl Buffer {
    fn with_capacity(size: usize) -> Self {
        Buffer {
            buf: vec![0u8; size],
            r: 0,
            w: 0,
        }
    }

    /// The unread span of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.r..self.w]
    }

    /// The whole backing slice. Used to re-slice a span the read cursor has
    /// already advanced past (e.g. a line or exact-count read that returns
    /// the consumed bytes to its caller).
    pub fn full(&self) -> &[u8] {
        &self.buf
    }

    /// Total backing capacity (not the unread length).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Bytes currently unread.
    pub fn buffered(&self) -> usize {
        self.w - self.r
    }

    pub fn read_cursor(&self) -> usize {
        self.r
    }

    pub fn write_cursor(&self) -> usize {
        self.w
    }

    /// Mutable access to the write tail, for filling from a socket.
    pub fn write_tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.w..]
    }

    /// Record `n` newly written bytes.
    pub fn advance_write(&mut self, n: usize) {
        self.w += n;
    }

    /// Consume `n` bytes from the unread span.
    pub fn advance(&mut self, n: usize) {
        self.r = (self.r as isize + n as isize) as usize;
    }

    /// Move the read cursor to an absolute mark (used to rewind a failed parse).
    pub fn advance_to(&mut self, mark: usize) {
        self.r = mark;
    }

    /// Double the backing capacity, preserving `[0, w)`.
    pub fn grow(&mut self) {
        let mut nb = vec![0u8; self.buf.len() * GROW_FACTOR];
        nb[..self.w].copy_from_slice(&self.buf[..self.w]);
        self.buf = nb;
    }

    /// Compact the unread span to the front, resetting `r` to 0.
    pub fn shrink(&mut self) {
        if self.r == 0 {
            return;
        }
        self.buf.copy_within(self.r..self.w, 0);
        self.w -= self.r;
        self.r = 0;
    }

    /// Clear cursors without touching the backing storage.
    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
    }
}

/// Fetch a buffer of at least `size` bytes from the size-classed pool.
///
/// Requests larger than the largest class bypass the pool entirely and are
/// dropped (not returned) on `put`.
pub fn get(size: usize) -> Buffer {
    let size = size.max(MIN_SIZE);
    match class_index(size) {
        Some(idx) => {
            let mut slot = pools()[idx].lock();
            let mut b = slot.pop().unwrap_or_else(|| Buffer::with_capacity(size_classes()[idx]));
            b.reset();
            b
        }
        None => Buffer::with_capacity(size),
    }
}

/// Return a buffer to its size class's free list.
pub fn put(b: Buffer) {
    if let Some(idx) = size_classes().iter().position(|&s| s == b.buf.len()) {
        pools()[idx].lock().push(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_size_class() {
        let b = get(600);
        assert_eq!(b.len(), 1024);
    }

    #[test]
    fn grow_preserves_written_bytes() {
        let mut b = get(512);
        b.write_tail_mut()[..5].copy_from_slice(b"hello");
        b.advance_write(5);
        b.grow();
        assert_eq!(b.len(), 1024);
        assert_eq!(b.bytes(), b"hello");
    }

    #[test]
    fn shrink_compacts_unread_tail() {
        let mut b = get(512);
        b.write_tail_mut()[..10].copy_from_slice(b"0123456789");
        b.advance_write(10);
        b.advance(4);
        assert_eq!(b.bytes(), b"456789");
        b.shrink();
        assert_eq!(b.read_cursor(), 0);
        assert_eq!(b.bytes(), b"456789");
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let b = get(MAX_SIZE * 4);
        assert_eq!(b.len(), MAX_SIZE * 4);
        put(b); // dropped silently, no panic
    }

    #[test]
    fn put_then_get_reuses_allocation() {
        let b = get(512);
        let ptr = b.buf.as_ptr();
        put(b);
        let b2 = get(512);
        assert_eq!(b2.buf.as_ptr(), ptr);
    }
}
