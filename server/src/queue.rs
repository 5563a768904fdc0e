//! Ordered queue of buffers awaiting transmission.

use crate::Buffer;
use std::collections::VecDeque;

/// A FIFO of buffers that were handed off for sending while another send was in flight.
///
/// Buffers leave in exactly the order they were pushed, so bytes reach the peer in the
/// order they were written.
#[derive(Debug, Default)]
pub struct BufferQueue {
    buffers: VecDeque<Buffer>,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer prepared for sending.
    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push_back(buffer);
    }

    /// Remove the oldest buffer.
    pub fn pop(&mut self) -> Option<Buffer> {
        self.buffers.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total number of bytes waiting to be sent.
    pub fn pending_bytes(&self) -> usize {
        self.buffers.iter().map(Buffer::remaining).sum()
    }

    /// Remove every queued buffer (oldest first).
    pub fn drain(&mut self) -> impl Iterator<Item = Buffer> + '_ {
        self.buffers.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPool;

    fn filled(pool: &BufferPool, bytes: &[u8]) -> Buffer {
        let mut buffer = pool.try_acquire().unwrap();
        buffer.prepare_for_write();
        buffer.write(bytes);
        buffer.prepare_for_send();
        buffer
    }

    #[test]
    fn test_fifo_order() {
        let pool = BufferPool::new(3, 8);
        let mut queue = BufferQueue::new();
        queue.push(filled(&pool, b"one"));
        queue.push(filled(&pool, b"three"));
        queue.push(filled(&pool, b"seven"));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending_bytes(), 13);

        assert_eq!(queue.pop().unwrap().as_slice(), b"one");
        assert_eq!(queue.pop().unwrap().as_slice(), b"three");
        let last = queue.pop().unwrap();
        assert_eq!(last.as_slice(), b"seven");
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        pool.release(last);
    }

    #[test]
    fn test_drain_returns_everything() {
        let pool = BufferPool::new(2, 8);
        let mut queue = BufferQueue::new();
        queue.push(filled(&pool, b"a"));
        queue.push(filled(&pool, b"b"));
        assert_eq!(pool.available(), 0);

        for buffer in queue.drain() {
            pool.release(buffer);
        }
        assert!(queue.is_empty());
        assert_eq!(pool.available(), 2);
    }
}
