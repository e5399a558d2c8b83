//! Growable ring buffer.
//!
//! A fixed-capacity circular byte store with separate read and write cursors.
//! One byte of capacity is always left unused so that an empty buffer
//! (`head == tail`) can be told apart from a full one.
//!
//! The buffer never exposes raw cursors; callers see only lengths, slices
//! and copy-in/copy-out operations. [`RingBuffer::resize`] swaps in a new
//! allocation while preserving the unread bytes in order.

/// Circular byte buffer with a reserved sentinel byte.
#[derive(Debug, Default)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Read cursor.
    head: usize,
    /// Write cursor.
    tail: usize,
}

impl RingBuffer {
    /// Create a buffer with `capacity` bytes of storage (`capacity - 1`
    /// usable). A zero capacity yields a buffer that accepts nothing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Physical size of the underlying allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.buf.len() - self.head + self.tail
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that can still be pushed.
    #[inline]
    pub fn free(&self) -> usize {
        self.buf.len().saturating_sub(1).saturating_sub(self.len())
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Copy as much of `data` as fits, splitting at the physical end of the
    /// buffer when needed. Returns the number of bytes stored.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let mut copied = 0;
        while copied < n {
            let spare = self.spare_mut();
            let step = spare.len().min(n - copied);
            spare[..step].copy_from_slice(&data[copied..copied + step]);
            self.commit(step);
            copied += step;
        }
        n
    }

    /// Copy unread bytes into `out` and consume them.
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek_into(out);
        self.consume(n);
        n
    }

    /// Copy unread bytes into `out` without consuming them.
    pub fn peek_into(&self, out: &mut [u8]) -> usize {
        let (first, second) = self.as_slices();
        let a = first.len().min(out.len());
        out[..a].copy_from_slice(&first[..a]);
        let b = second.len().min(out.len() - a);
        out[a..a + b].copy_from_slice(&second[..b]);
        a + b
    }

    /// Discard up to `n` unread bytes. Returns how many were discarded.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        if n > 0 {
            self.head = (self.head + n) % self.buf.len();
        }
        if self.is_empty() {
            // Rewind so the next write gets the largest contiguous region.
            self.head = 0;
            self.tail = 0;
        }
        n
    }

    /// Remove and return the oldest unread byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.head];
        self.consume(1);
        Some(byte)
    }

    /// Length of the first complete line (including its `\n`), scanning
    /// across the wrap boundary without consuming anything.
    pub fn peek_line(&self) -> Option<usize> {
        let (first, second) = self.as_slices();
        if let Some(pos) = first.iter().position(|&b| b == b'\n') {
            return Some(pos + 1);
        }
        second
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| first.len() + pos + 1)
    }

    /// Remove and return the first complete line, terminator included.
    pub fn pop_line(&mut self) -> Option<Vec<u8>> {
        let n = self.peek_line()?;
        let mut line = vec![0u8; n];
        self.pop_into(&mut line);
        Some(line)
    }

    /// Unread bytes as two contiguous slices, oldest first. The second
    /// slice is empty unless the data wraps.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.tail >= self.head {
            (&self.buf[self.head..self.tail], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..self.tail])
        }
    }

    /// Largest contiguous writable region. Bytes written here become
    /// readable after [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let cap = self.buf.len();
        if cap == 0 {
            return &mut [];
        }
        let end = if self.tail >= self.head {
            // Writing up to the physical end is fine unless the read cursor
            // sits at zero, in which case the sentinel byte must stay free.
            if self.head == 0 { cap - 1 } else { cap }
        } else {
            self.head - 1
        };
        &mut self.buf[self.tail..end]
    }

    /// Mark `n` bytes of [`spare_mut`](Self::spare_mut) as written.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        if n > 0 {
            self.tail = (self.tail + n) % self.buf.len();
        }
    }

    /// Reallocate to `capacity` bytes, moving unread bytes to offset 0.
    ///
    /// Returns `false` without touching the buffer if `capacity` cannot hold
    /// the unread bytes plus the sentinel, or if the allocation fails.
    pub fn resize(&mut self, capacity: usize) -> bool {
        let len = self.len();
        if capacity <= len && !(capacity == 0 && len == 0) {
            return false;
        }
        let mut fresh = Vec::new();
        if fresh.try_reserve_exact(capacity).is_err() {
            return false;
        }
        fresh.resize(capacity, 0);
        let copied = self.peek_into(&mut fresh);
        debug_assert_eq!(copied, len);
        self.buf = fresh.into_boxed_slice();
        self.head = 0;
        self.tail = if capacity == 0 { 0 } else { len };
        true
    }

    /// Drop all unread bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}
