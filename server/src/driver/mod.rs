//! Submit socket operations and report their completion.
//!
//! A [Driver] is the only component that touches the operating system. The engine hands
//! it an operation (with the [Buffer] the operation reads from or writes into) and a
//! [Callback]. Exactly one [Completion] is delivered to the callback per submission, on
//! any thread (possibly inline, before the submitting call returns). Failures to submit
//! are reported the same way, never as returned errors, so the connection state machine
//! has a single entry point for every outcome.
//!
//! Callbacks must not block. The engine uses them to update connection bookkeeping and
//! to hand protocol work to its [crate::Executor].

use crate::{Buffer, Error};
use std::{fmt, io, net::SocketAddr, ops::Range};

pub mod tokio;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "iouring", target_os = "linux"))] {
        pub mod iouring;
    }
}

/// Driver-assigned identity of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a completed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// Failed for a reason not covered below.
    Aborted,
    /// The socket was closed while the operation was pending.
    Cancelled,
    /// The socket was shut down locally.
    LocalDisconnect,
    /// The peer reset or closed the connection.
    RemoteDisconnect,
    /// The socket identity does not refer to a usable socket.
    NotSocket,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Map an `errno` value (positive) to a status.
    #[cfg(unix)]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED | libc::EINTR => Status::Cancelled,
            libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED => Status::RemoteDisconnect,
            libc::ENOTCONN | libc::ESHUTDOWN => Status::LocalDisconnect,
            libc::EBADF | libc::ENOTSOCK => Status::NotSocket,
            _ => Status::Aborted,
        }
    }
}

impl From<&io::Error> for Status {
    fn from(err: &io::Error) -> Self {
        #[cfg(unix)]
        if let Some(errno) = err.raw_os_error() {
            return Status::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::Interrupted => Status::Cancelled,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Status::RemoteDisconnect,
            io::ErrorKind::NotConnected => Status::LocalDisconnect,
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => Status::NotSocket,
            _ => Status::Aborted,
        }
    }
}

/// Result of one submitted operation.
#[derive(Debug)]
pub struct Completion {
    pub status: Status,
    /// Bytes received or sent (zero for accept without data and for disconnect).
    pub transferred: usize,
    /// The buffer the operation was submitted with, returned to the caller.
    pub buffer: Option<Buffer>,
    /// Address of the peer (accept only).
    pub peer: Option<SocketAddr>,
}

impl Completion {
    pub fn new(status: Status, transferred: usize, buffer: Option<Buffer>) -> Self {
        Self {
            status,
            transferred,
            buffer,
            peer: None,
        }
    }

    /// A completion for an operation that failed before (or instead of) transferring data.
    pub fn failed(status: Status, buffer: Option<Buffer>) -> Self {
        Self::new(status, 0, buffer)
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Invoked exactly once with the result of an operation.
pub type Callback = Box<dyn FnOnce(Completion) + Send>;

/// Interface to an asynchronous, completion-based socket API.
pub trait Driver: Send + Sync + 'static {
    /// Bind `address` and start listening, returning the listening socket and the address
    /// actually bound.
    fn listen(&self, address: SocketAddr) -> Result<(SocketId, SocketAddr), Error>;

    /// Reserve the identity of a socket that a later [Driver::accept] will populate.
    fn open(&self) -> Result<SocketId, Error>;

    /// Accept one connection on `listener` into `socket`.
    ///
    /// Any bytes delivered with the connection are written to the receive region of
    /// `buffer` and reported as `transferred`.
    fn accept(&self, listener: SocketId, socket: SocketId, buffer: Buffer, callback: Callback);

    /// Receive into the receive region of `buffer`. A successful completion that
    /// transferred zero bytes means the peer closed its side.
    fn receive(&self, socket: SocketId, buffer: Buffer, callback: Callback);

    /// Send `range` of `buffer`. The transfer may be partial.
    fn send(&self, socket: SocketId, buffer: Buffer, range: Range<usize>, callback: Callback);

    /// Gracefully shut the connection down.
    ///
    /// Sends FIN, then discards input until the peer closes its side (bounded by a
    /// driver-specific timeout) before releasing the socket, so output already sent is
    /// never lost to a reset. Pending operations on the socket complete with
    /// [Status::Cancelled]. A [Driver::close] while draining completes the disconnect with
    /// [Status::Cancelled].
    fn disconnect(&self, socket: SocketId, callback: Callback);

    /// Close `socket` immediately. Pending operations complete with [Status::Cancelled].
    fn close(&self, socket: SocketId);
}
