//! Bounded single-producer/single-consumer byte ring with blocking
//! read/write and independent half-close.
//!
//! The ring uses the one-slot-empty convention: empty iff `r == w`, full iff
//! `(w + 1) % N == r`, usable capacity is `N - 1`. This is data only —
//! the blocking read/write loops live on [`crate::kernel::Kernel`], which
//! owns the single lock these condvars wait against; see that module for
//! "write blocks on `has_space`, read blocks on `has_data`" (4.B).

use crate::constants::PIPE_BUFFER_SIZE;
use crate::sched::Cv;

/// One pipe's buffer and the two sides' reference counts.
///
/// `reader_refs`/`writer_refs` count how many descriptor-table entries (across
/// possibly several processes, after `Exec` clones a table) currently name
/// this side — grounded on the teacher's `ipc::anon_pipe::AnonPipe`'s
/// `read_refs`/`write_refs` fields. A side is "present" (for EOF/dead-peer
/// purposes) iff its refcount is nonzero; `Kernel` decrements on every close
/// and only treats the side as gone once it hits zero.
///
/// Concurrency: every field here is only ever touched while the caller
/// holds the single kernel lock (enforced by `Kernel`, not by this type).
pub struct Pipe {
    buf: Box<[u8]>,
    r: usize,
    w: usize,
    pub(crate) reader_refs: u32,
    pub(crate) writer_refs: u32,
    pub(crate) has_space: Cv,
    pub(crate) has_data: Cv,
}

impl Pipe {
    pub fn new() -> Self {
        Self::with_capacity(PIPE_BUFFER_SIZE)
    }

    /// Build a pipe with a non-default ring size. Used by tests that need a
    /// small, easily-filled buffer; production code always goes through
    /// [`Pipe::new`].
    pub fn with_capacity(cap: usize) -> Self {
        Pipe {
            buf: vec![0u8; cap].into_boxed_slice(),
            r: 0,
            w: 0,
            reader_refs: 1,
            writer_refs: 1,
            has_space: Cv::new(),
            has_data: Cv::new(),
        }
    }

    pub fn reader_present(&self) -> bool {
        self.reader_refs > 0
    }

    pub fn writer_present(&self) -> bool {
        self.writer_refs > 0
    }

    fn cap(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    pub fn is_full(&self) -> bool {
        (self.w + 1) % self.cap() == self.r
    }

    /// Bytes currently buffered (not capacity remaining).
    pub fn len(&self) -> usize {
        (self.w + self.cap() - self.r) % self.cap()
    }

    /// Copy as many bytes as fit from `src` into the ring, advancing `w`.
    /// Returns the number of bytes actually copied (may be less than
    /// `src.len()` if the ring fills up first).
    pub fn push(&mut self, src: &[u8]) -> usize {
        let mut n = 0;
        while n < src.len() && !self.is_full() {
            self.buf[self.w] = src[n];
            self.w = (self.w + 1) % self.cap();
            n += 1;
        }
        n
    }

    /// Copy as many bytes as available into `dst`, advancing `r`. Returns
    /// the number of bytes actually copied.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dst.len() && !self.is_empty() {
            dst[n] = self.buf[self.r];
            self.r = (self.r + 1) % self.cap();
            n += 1;
        }
        n
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_full_and_capacity() {
        let mut p = Pipe::new();
        assert!(p.is_empty());
        assert!(!p.is_full());
        assert_eq!(p.len(), 0);
        let written = p.push(&vec![7u8; PIPE_BUFFER_SIZE]);
        assert_eq!(written, PIPE_BUFFER_SIZE - 1, "usable capacity is N - 1");
        assert!(p.is_full());
    }

    #[test]
    fn ring_wraps_and_preserves_order() {
        let mut p = Pipe::new();
        p.push(b"abcdef");
        let mut out = [0u8; 3];
        assert_eq!(p.pop(&mut out), 3);
        assert_eq!(&out, b"abc");
        p.push(b"ghij");
        let mut out = vec![0u8; 16];
        let n = p.pop(&mut out);
        assert_eq!(&out[..n], b"defghij");
    }

    #[test]
    fn ring_discipline_invariant() {
        let mut p = Pipe::new();
        for chunk in [b"1234".as_slice(), b"5678", b"90"] {
            p.push(chunk);
            assert!(p.r < p.cap());
            assert!(p.w < p.cap());
            assert!(p.len() <= p.cap() - 1);
            let mut scratch = [0u8; 2];
            p.pop(&mut scratch);
        }
    }
}
