//! Bounded pool of pre-allocated buffers.
//!
//! A [BufferPool] allocates all of its buffers up front (an arena indexed by slot) and
//! hands them out from a stack of free slot indices. Exhaustion never allocates: callers
//! block in [BufferPool::acquire] until a buffer is released or their timeout elapses,
//! which is the only backpressure the engine applies.
//!
//! # Thread Safety
//!
//! [BufferPool] is `Send + Sync`. The free stack is guarded by a mutex and waiters park
//! on a condition variable, so the length of the free stack doubles as the count of a
//! counting semaphore (and the two can never disagree).

use crate::{Buffer, Error};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

/// Source of unique pool identities (used to catch buffers released to the wrong pool).
static NEXT_POOL: AtomicU64 = AtomicU64::new(0);

struct Arena {
    /// Buffers currently owned by the pool, indexed by slot.
    slots: Vec<Option<Buffer>>,
    /// Slots that hold a buffer, in LIFO order.
    free: Vec<usize>,
}

/// A bounded pool of `capacity` buffers of `buffer_size` bytes each.
pub struct BufferPool {
    id: u64,
    buffer_size: usize,
    arena: Mutex<Arena>,
    available: Condvar,
}

impl BufferPool {
    /// Allocate a pool of `capacity` buffers, each `buffer_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `buffer_size` is zero.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        assert!(buffer_size > 0, "buffer_size must be non-zero");
        let id = NEXT_POOL.fetch_add(1, Ordering::Relaxed);
        let slots = (0..capacity)
            .map(|slot| Some(Buffer::new(id, slot, buffer_size)))
            .collect();
        let free = (0..capacity).rev().collect();
        Self {
            id,
            buffer_size,
            arena: Mutex::new(Arena { slots, free }),
            available: Condvar::new(),
        }
    }

    /// Number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.arena.lock().unwrap().slots.len()
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers that can be acquired without waiting.
    pub fn available(&self) -> usize {
        self.arena.lock().unwrap().free.len()
    }

    /// Number of buffers currently acquired.
    pub fn outstanding(&self) -> usize {
        let arena = self.arena.lock().unwrap();
        arena.slots.len() - arena.free.len()
    }

    /// Acquire a buffer, waiting at most `timeout` for one to be released.
    ///
    /// Returns [Error::Timeout] if the pool is still exhausted when the timeout elapses.
    pub fn acquire(&self, timeout: Duration) -> Result<Buffer, Error> {
        let arena = self.arena.lock().unwrap();
        let (mut arena, _) = self
            .available
            .wait_timeout_while(arena, timeout, |arena| arena.free.is_empty())
            .unwrap();
        Self::take(&mut arena).ok_or(Error::Timeout)
    }

    /// Acquire a buffer if one is immediately available.
    pub fn try_acquire(&self) -> Option<Buffer> {
        let mut arena = self.arena.lock().unwrap();
        Self::take(&mut arena)
    }

    fn take(arena: &mut Arena) -> Option<Buffer> {
        let slot = arena.free.pop()?;
        let buffer = arena.slots[slot].take();
        debug_assert!(buffer.is_some(), "free slot {slot} is empty");
        buffer
    }

    /// Return a buffer to the pool, waking one waiter.
    ///
    /// Releasing a buffer that belongs to another pool, or one whose slot is already
    /// free, is a caller bug.
    pub fn release(&self, mut buffer: Buffer) {
        debug_assert_eq!(buffer.pool(), self.id, "buffer released to foreign pool");
        buffer.reset();
        {
            let mut arena = self.arena.lock().unwrap();
            let slot = buffer.slot();
            assert!(arena.free.len() < arena.slots.len(), "pool overflow");
            debug_assert!(arena.slots[slot].is_none(), "slot {slot} released twice");
            debug_assert!(!arena.free.contains(&slot), "slot {slot} already free");
            arena.slots[slot] = Some(buffer);
            arena.free.push(slot);
        }
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Instant,
    };

    #[test]
    fn test_acquire_and_release() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let mut buffer = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(pool.outstanding(), 1);

        // Dirty the buffer, it must come back rewound
        buffer.prepare_for_write();
        buffer.write(b"dirty");
        pool.release(buffer);
        assert_eq!(pool.available(), 2);

        let buffer = pool.try_acquire().unwrap();
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.size(), 0);
        pool.release(buffer);
    }

    #[test]
    fn test_exhaustion_times_out() {
        let pool = BufferPool::new(2, 16);
        let first = pool.acquire(Duration::from_millis(10)).unwrap();
        let second = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_ne!(first.slot(), second.slot());
        assert!(pool.try_acquire().is_none());

        let start = Instant::now();
        let result = pool.acquire(Duration::from_millis(50));
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));

        pool.release(first);
        pool.release(second);
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let pool = Arc::new(BufferPool::new(1, 16));
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buffer = pool.acquire(Duration::from_secs(10)).unwrap();
                tx.send(buffer.slot()).unwrap();
                pool.release(buffer);
            })
        };

        // The waiter must still be parked
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        let slot = held.slot();
        pool.release(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), slot);
        waiter.join().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_outstanding_never_exceeds_capacity() {
        const CAPACITY: usize = 3;
        let pool = Arc::new(BufferPool::new(CAPACITY, 8));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let outstanding = outstanding.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let buffer = pool.acquire(Duration::from_secs(10)).unwrap();
                        let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        pool.release(buffer);
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.available(), CAPACITY);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "buffer released to foreign pool")]
    fn test_release_to_foreign_pool() {
        let first = BufferPool::new(1, 8);
        let second = BufferPool::new(1, 8);
        let buffer = first.try_acquire().unwrap();
        second.release(buffer);
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity() {
        BufferPool::new(0, 8);
    }
}
