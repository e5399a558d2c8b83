//! Write-chunk queue.
//!
//! Buffered writes go into the connection's write ring; everything else that
//! must be ordered against them (zero-copy spans and triggers) goes here.
//! Each chunk records how many write-buffer bytes were queued ahead of it.
//! That count is decremented as the write buffer drains, and a chunk may
//! only be processed once it reaches the front of the queue with nothing
//! left ahead of it.

use bytes::Bytes;
use std::collections::VecDeque;

/// Payload handed back to the trigger callback.
pub type TriggerToken = u64;

/// A zero-copy span and how far into it we have sent.
#[derive(Debug, Clone)]
pub struct Span {
    data: Bytes,
    pos: usize,
}

impl Span {
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[derive(Debug, Clone)]
pub enum Chunk {
    Span(Span),
    Trigger(TriggerToken),
}

#[derive(Debug, Clone)]
pub struct QueuedChunk {
    /// Write-buffer bytes that must be sent before this chunk.
    pub wait: usize,
    pub chunk: Chunk,
}

impl QueuedChunk {
    #[inline]
    pub fn is_due(&self) -> bool {
        self.wait == 0
    }
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<QueuedChunk>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a span that goes out after `wait` already-buffered bytes.
    pub fn push_span(&mut self, data: Bytes, wait: usize) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(QueuedChunk {
            wait,
            chunk: Chunk::Span(Span { data, pos: 0 }),
        });
    }

    /// Append a trigger that fires after `wait` already-buffered bytes.
    pub fn push_trigger(&mut self, token: TriggerToken, wait: usize) {
        self.chunks.push_back(QueuedChunk {
            wait,
            chunk: Chunk::Trigger(token),
        });
    }

    /// Account for `n` bytes of the write buffer having been sent.
    pub fn consumed(&mut self, n: usize) {
        for queued in &mut self.chunks {
            queued.wait = queued.wait.saturating_sub(n);
        }
    }

    /// Write-buffer bytes that may be sent before the front chunk is due,
    /// or `None` when the queue is empty.
    #[inline]
    pub fn front_wait(&self) -> Option<usize> {
        self.chunks.front().map(|c| c.wait)
    }

    #[inline]
    pub fn front_mut(&mut self) -> Option<&mut QueuedChunk> {
        self.chunks.front_mut()
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<QueuedChunk> {
        self.chunks.pop_front()
    }

    /// Span bytes still waiting to be sent.
    pub fn pending_bytes(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| match &c.chunk {
                Chunk::Span(span) => span.remaining().len(),
                Chunk::Trigger(_) => 0,
            })
            .sum()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Discard every pending chunk, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.chunks.len();
        self.chunks.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_becomes_due_after_preceding_bytes_drain() {
        let mut q = WriteQueue::new();
        q.push_trigger(7, 10);
        assert_eq!(q.front_wait(), Some(10));
        q.consumed(4);
        assert_eq!(q.front_wait(), Some(6));
        q.consumed(100);
        assert!(q.front_mut().is_some_and(|c| c.is_due()));
        assert!(matches!(q.pop_front().map(|c| c.chunk), Some(Chunk::Trigger(7))));
        assert!(q.is_empty());
    }

    #[test]
    fn later_chunks_wait_on_later_bytes() {
        let mut q = WriteQueue::new();
        q.push_trigger(1, 3);
        q.push_trigger(2, 8);
        q.consumed(3);
        q.pop_front();
        assert_eq!(q.front_wait(), Some(5));
    }

    #[test]
    fn span_cursor_tracks_progress() {
        let mut q = WriteQueue::new();
        q.push_span(Bytes::from_static(b"hello world"), 0);
        q.push_span(Bytes::new(), 0);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending_bytes(), 11);
        if let Some(QueuedChunk {
            chunk: Chunk::Span(span),
            ..
        }) = q.front_mut()
        {
            span.advance(6);
            assert_eq!(span.remaining(), b"world");
            span.advance(5);
            assert!(span.is_done());
        }
        assert_eq!(q.pending_bytes(), 0);
        assert_eq!(q.clear(), 1);
    }
}
