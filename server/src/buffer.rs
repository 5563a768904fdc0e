//! Fixed-capacity byte blocks used as both receive targets and send sources.

/// A fixed-capacity block of bytes with a read/write cursor.
///
/// A [Buffer] is allocated once by its [crate::BufferPool] and never freed individually.
/// Because it is neither `Clone` nor `Copy`, a buffer can only ever be in one place at a
/// time: the pool's free list, a bound stream, the write queue, or an in-flight operation
/// inside the driver.
///
/// The heap block backing a buffer never moves, even when the [Buffer] value itself
/// does, so a driver may hand its address to the kernel for the lifetime of an operation.
pub struct Buffer {
    pool: u64,
    slot: usize,
    position: usize,
    size: usize,
    data: Box<[u8]>,
}

impl Buffer {
    pub(crate) fn new(pool: u64, slot: usize, capacity: usize) -> Self {
        Self {
            pool,
            slot,
            position: 0,
            size: 0,
            data: vec![0; capacity].into_boxed_slice(),
        }
    }

    /// Identity of the pool that owns this buffer.
    pub(crate) fn pool(&self) -> u64 {
        self.pool
    }

    /// Index of this buffer in its pool's arena.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.capacity(), "position out of bounds");
        self.position = position;
    }

    /// Number of valid bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.capacity(), "size out of bounds");
        self.size = size;
    }

    /// Bytes between the cursor and the end of the valid region.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.position)
    }

    /// Returns true when the cursor has reached the end of the valid region.
    pub fn at_end(&self) -> bool {
        self.position == self.size
    }

    /// Rewind the buffer before it is returned to its pool.
    pub fn reset(&mut self) {
        self.position = 0;
        self.size = 0;
    }

    /// Prepare the buffer to be filled by [Buffer::write].
    pub fn prepare_for_write(&mut self) {
        self.position = 0;
        self.size = self.capacity();
    }

    /// Prepare the buffer to be drained by [Buffer::read] after `received` bytes arrived.
    pub fn prepare_for_read(&mut self, received: usize) {
        self.position = 0;
        self.set_size(received);
    }

    /// Prepare the buffer to hold any data delivered with an accepted connection.
    pub fn prepare_for_accept(&mut self) {
        self.prepare_for_receive();
    }

    /// Prepare the buffer to be the target of a receive.
    pub fn prepare_for_receive(&mut self) {
        self.position = 0;
        self.size = self.capacity();
    }

    /// Turn everything written so far into the valid region for a send.
    pub fn prepare_for_send(&mut self) {
        self.size = self.position;
        self.position = 0;
    }

    /// Copy as much of `src` as fits after the cursor, returning the number of bytes copied.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.capacity() - self.position);
        self.data[self.position..self.position + count].copy_from_slice(&src[..count]);
        self.position += count;
        count
    }

    /// Copy as many valid bytes after the cursor as fit into `dst`, returning the
    /// number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.remaining());
        dst[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        count
    }

    /// The valid region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The region a receive may fill (from the cursor to the end of the valid region).
    pub fn receive_region(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.size]
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("slot", &self.slot)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_send() {
        let mut buffer = Buffer::new(0, 0, 8);
        buffer.prepare_for_write();
        assert_eq!(buffer.write(b"hello"), 5);
        assert_eq!(buffer.write(b"world"), 3);
        assert_eq!(buffer.position(), 8);

        buffer.prepare_for_send();
        assert_eq!(buffer.size(), 8);
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.as_slice(), b"hellowor");
    }

    #[test]
    fn test_receive_then_read() {
        let mut buffer = Buffer::new(0, 0, 16);
        buffer.prepare_for_receive();
        assert_eq!(buffer.receive_region().len(), 16);
        buffer.receive_region()[..4].copy_from_slice(b"ping");
        buffer.prepare_for_read(4);

        let mut dst = [0u8; 3];
        assert_eq!(buffer.read(&mut dst), 3);
        assert_eq!(&dst, b"pin");
        assert!(!buffer.at_end());
        assert_eq!(buffer.read(&mut dst), 1);
        assert_eq!(dst[0], b'g');
        assert!(buffer.at_end());
        assert_eq!(buffer.read(&mut dst), 0);
    }

    #[test]
    fn test_reset() {
        let mut buffer = Buffer::new(0, 0, 4);
        buffer.prepare_for_write();
        buffer.write(b"ab");
        buffer.reset();
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.at_end());
    }

    #[test]
    #[should_panic(expected = "size out of bounds")]
    fn test_read_beyond_capacity() {
        let mut buffer = Buffer::new(0, 0, 4);
        buffer.prepare_for_read(5);
    }
}
