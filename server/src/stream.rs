//! Byte stream over a connection's receive and send buffers.
//!
//! A [BufferedStream] is built for a single protocol round. Reads drain the buffer that
//! the completed receive filled and, once it is exhausted, wait for exactly one more
//! receive at a time until the request is satisfied or the peer closes. Writes fill a
//! send buffer and hand it to the connection's write queue whenever it is full, which
//! may start transmitting it immediately.

use crate::Buffer;
use std::io::{self, Read, Write};

/// Where a [BufferedStream] gets its buffers from and sends them to.
pub(crate) trait Conduit {
    /// Acquire an empty receive buffer (bounded by the acquire timeout).
    fn acquire_receive(&self) -> io::Result<Buffer>;

    fn release_receive(&self, buffer: Buffer);

    /// Acquire an empty send buffer (bounded by the acquire timeout).
    fn acquire_send(&self) -> io::Result<Buffer>;

    fn release_send(&self, buffer: Buffer);

    /// Hand a filled send buffer (not yet prepared for sending) to the write queue.
    fn enqueue(&self, buffer: Buffer) -> io::Result<()>;

    /// Receive into `buffer` (bounded by the receive timeout), returning it prepared for
    /// reading together with the number of bytes received. Zero bytes means the peer
    /// closed its side.
    ///
    /// On error, the conduit has taken care of `buffer`.
    fn refill(&self, buffer: Buffer) -> io::Result<(Buffer, usize)>;
}

/// A [Read] + [Write] view of one connection for the duration of a protocol round.
pub struct BufferedStream<'a> {
    conduit: &'a dyn Conduit,
    read: Option<Buffer>,
    write: Option<Buffer>,
    readable: bool,
    faulted: bool,
    /// Error to report on the next write, after an earlier one copied some bytes.
    deferred: Option<io::Error>,
    consumed: u64,
}

impl<'a> BufferedStream<'a> {
    /// Create a stream whose first reads are served from `input` (prepared for reading).
    pub(crate) fn new(conduit: &'a dyn Conduit, input: Buffer) -> Self {
        Self {
            conduit,
            read: Some(input),
            write: None,
            readable: true,
            faulted: false,
            deferred: None,
            consumed: 0,
        }
    }

    /// Returns true if the bound receive buffer holds bytes that have not been read.
    pub fn has_input(&self) -> bool {
        self.read.as_ref().is_some_and(|buffer| !buffer.at_end())
    }

    /// Returns true once the peer has closed its side (or reading has failed).
    pub fn at_eof(&self) -> bool {
        !self.readable
    }

    /// Returns true if a buffer could not be acquired, enqueued, or refilled.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Total number of bytes read.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Release the receive buffer and return the partially filled send buffer (if any).
    pub(crate) fn finish(mut self) -> Option<Buffer> {
        self.write.take()
    }

    fn fault(&mut self, err: io::Error) -> io::Error {
        self.faulted = true;
        self.readable = false;
        err
    }

    fn next_write(&mut self) -> io::Result<Buffer> {
        match self.write.take() {
            Some(buffer) if buffer.position() < buffer.capacity() => Ok(buffer),
            full => {
                if let Some(full) = full {
                    self.conduit.enqueue(full).map_err(|err| self.fault(err))?;
                }
                let mut buffer = self.conduit.acquire_send().map_err(|err| self.fault(err))?;
                buffer.prepare_for_write();
                Ok(buffer)
            }
        }
    }
}

impl Read for BufferedStream<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < dst.len() {
            if let Some(buffer) = self.read.as_mut() {
                total += buffer.read(&mut dst[total..]);
                if total == dst.len() {
                    break;
                }
            }
            if !self.readable {
                break;
            }

            // The bound buffer is exhausted: receive once more into it
            let buffer = match self.read.take() {
                Some(buffer) => buffer,
                None => match self.conduit.acquire_receive() {
                    Ok(buffer) => buffer,
                    Err(err) if total == 0 => return Err(self.fault(err)),
                    Err(err) => {
                        self.fault(err);
                        break;
                    }
                },
            };
            match self.conduit.refill(buffer) {
                Ok((buffer, received)) => {
                    self.read = Some(buffer);
                    if received == 0 {
                        self.readable = false;
                    }
                }
                Err(err) if total == 0 => return Err(self.fault(err)),
                Err(err) => {
                    self.fault(err);
                    break;
                }
            }
        }
        self.consumed += total as u64;
        Ok(total)
    }
}

impl Write for BufferedStream<'_> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let mut total = 0;
        while total < src.len() {
            let buffer = match self.next_write() {
                Ok(buffer) => buffer,
                Err(err) if total > 0 => {
                    self.deferred = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            };
            let buffer = self.write.insert(buffer);
            total += buffer.write(&src[total..]);
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.write.take() {
            Some(buffer) if buffer.position() > 0 => {
                self.conduit.enqueue(buffer).map_err(|err| self.fault(err))
            }
            Some(buffer) => {
                self.conduit.release_send(buffer);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for BufferedStream<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.read.take() {
            self.conduit.release_receive(buffer);
        }
        if let Some(buffer) = self.write.take() {
            self.conduit.release_send(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPool;
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        time::Duration,
    };

    /// A conduit whose peer is a script of inbound chunks and whose sends are recorded.
    struct Script {
        receive: BufferPool,
        send: BufferPool,
        inbound: RefCell<VecDeque<io::Result<Vec<u8>>>>,
        sent: RefCell<Vec<Vec<u8>>>,
        /// Whether enqueued buffers stay in flight instead of returning to the pool.
        stalled: Cell<bool>,
        in_flight: RefCell<Vec<Buffer>>,
        refills: RefCell<usize>,
    }

    impl Script {
        fn new(buffer_size: usize, send_buffers: usize) -> Self {
            Self {
                receive: BufferPool::new(2, buffer_size),
                send: BufferPool::new(send_buffers, buffer_size),
                inbound: RefCell::new(VecDeque::new()),
                sent: RefCell::new(Vec::new()),
                stalled: Cell::new(false),
                in_flight: RefCell::new(Vec::new()),
                refills: RefCell::new(0),
            }
        }

        fn input(&self, bytes: &[u8]) -> Buffer {
            let mut buffer = self.receive.try_acquire().unwrap();
            buffer.prepare_for_receive();
            buffer.receive_region()[..bytes.len()].copy_from_slice(bytes);
            buffer.prepare_for_read(bytes.len());
            buffer
        }

        fn peer_sends(&self, bytes: &[u8]) {
            self.inbound.borrow_mut().push_back(Ok(bytes.to_vec()));
        }

        fn transmitted(&self) -> Vec<u8> {
            self.sent.borrow().concat()
        }
    }

    impl Conduit for Script {
        fn acquire_receive(&self) -> io::Result<Buffer> {
            self.receive
                .acquire(Duration::from_millis(10))
                .map_err(|_| io::ErrorKind::TimedOut.into())
        }

        fn release_receive(&self, buffer: Buffer) {
            self.receive.release(buffer);
        }

        fn acquire_send(&self) -> io::Result<Buffer> {
            self.send
                .acquire(Duration::from_millis(10))
                .map_err(|_| io::ErrorKind::TimedOut.into())
        }

        fn release_send(&self, buffer: Buffer) {
            self.send.release(buffer);
        }

        fn enqueue(&self, mut buffer: Buffer) -> io::Result<()> {
            // Transmit immediately
            buffer.prepare_for_send();
            self.sent.borrow_mut().push(buffer.as_slice().to_vec());
            if self.stalled.get() {
                self.in_flight.borrow_mut().push(buffer);
            } else {
                self.send.release(buffer);
            }
            Ok(())
        }

        fn refill(&self, mut buffer: Buffer) -> io::Result<(Buffer, usize)> {
            *self.refills.borrow_mut() += 1;
            buffer.prepare_for_receive();
            match self.inbound.borrow_mut().pop_front() {
                None => {
                    buffer.prepare_for_read(0);
                    Ok((buffer, 0))
                }
                Some(Ok(chunk)) => {
                    let region = buffer.receive_region();
                    let count = chunk.len().min(region.len());
                    region[..count].copy_from_slice(&chunk[..count]);
                    buffer.prepare_for_read(count);
                    Ok((buffer, count))
                }
                Some(Err(err)) => {
                    self.receive.release(buffer);
                    Err(err)
                }
            }
        }
    }

    #[test]
    fn test_read_within_buffer() {
        let script = Script::new(16, 2);
        let mut stream = BufferedStream::new(&script, script.input(b"hello world"));
        let mut dst = [0u8; 5];
        stream.read_exact(&mut dst).unwrap();
        assert_eq!(&dst, b"hello");
        assert!(stream.has_input());
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b" world");
        assert!(!stream.has_input());
        assert!(stream.at_eof());
        assert!(!stream.is_faulted());
        assert_eq!(stream.consumed(), 11);
    }

    #[test]
    fn test_read_refills_one_receive_at_a_time() {
        let script = Script::new(8, 2);
        script.peer_sends(b"lo wo");
        script.peer_sends(b"rld");
        let mut stream = BufferedStream::new(&script, script.input(b"hel"));

        let mut dst = [0u8; 11];
        stream.read_exact(&mut dst).unwrap();
        assert_eq!(&dst, b"hello world");
        assert_eq!(*script.refills.borrow(), 2);
        assert!(!stream.at_eof());
        drop(stream);
        assert_eq!(script.receive.available(), 2);
    }

    #[test]
    fn test_short_read_when_peer_closes() {
        let script = Script::new(8, 2);
        let mut stream = BufferedStream::new(&script, script.input(b"abc"));
        let mut dst = [0u8; 6];
        assert_eq!(stream.read(&mut dst).unwrap(), 3);
        assert!(stream.at_eof());
        assert_eq!(
            stream.read_exact(&mut dst).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert!(!stream.is_faulted());
    }

    #[test]
    fn test_refill_error_faults_stream() {
        let script = Script::new(8, 2);
        script
            .inbound
            .borrow_mut()
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        let mut stream = BufferedStream::new(&script, script.input(b"ab"));
        let mut dst = [0u8; 2];
        stream.read_exact(&mut dst).unwrap();

        let err = stream.read(&mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(stream.is_faulted());
        assert!(stream.at_eof());
        drop(stream);
        assert_eq!(script.receive.available(), 2);
    }

    #[test]
    fn test_write_rotates_buffers_in_order() {
        let script = Script::new(4, 2);
        let payload = (0..=40u8).collect::<Vec<_>>();
        {
            let mut stream = BufferedStream::new(&script, script.input(b"x"));
            stream.write_all(&payload[..10]).unwrap();
            stream.write_all(&payload[10..]).unwrap();
            stream.flush().unwrap();
            assert!(stream.finish().is_none());
        }
        assert_eq!(script.transmitted(), payload);
        assert!(script.sent.borrow().iter().all(|chunk| chunk.len() <= 4));
        assert_eq!(script.send.available(), 2);
        assert_eq!(script.receive.available(), 2);
    }

    #[test]
    fn test_finish_returns_partial_buffer() {
        let script = Script::new(8, 2);
        let stream = {
            let mut stream = BufferedStream::new(&script, script.input(b"x"));
            stream.write_all(b"abc").unwrap();
            stream
        };
        let pending = stream.finish().unwrap();
        assert_eq!(pending.position(), 3);
        assert!(script.sent.borrow().is_empty());
        script.release_send(pending);
    }

    #[test]
    fn test_write_faults_when_send_buffers_exhausted() {
        let script = Script::new(4, 1);
        let held = script.send.try_acquire().unwrap();
        let mut stream = BufferedStream::new(&script, script.input(b"x"));
        let err = stream.write(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(stream.is_faulted());
        drop(stream);
        script.release_send(held);
    }

    #[test]
    fn test_write_reports_copied_bytes_before_fault() {
        let script = Script::new(4, 1);
        script.stalled.set(true);
        let mut stream = BufferedStream::new(&script, script.input(b"x"));

        // The first buffer is filled and enqueued, then no other buffer is free
        assert_eq!(stream.write(b"abcdef").unwrap(), 4);
        assert!(stream.is_faulted());
        assert_eq!(script.transmitted(), b"abcd");

        // The next write surfaces the error
        let err = stream.write(b"ef").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(stream);
        for buffer in script.in_flight.take() {
            script.release_send(buffer);
        }
        assert_eq!(script.send.available(), 1);
    }
}
