//! [crate::Driver] backed by a Linux `io_uring` completion ring.
//!
//! A dedicated thread owns the ring. Submissions arrive over a channel, are tagged with a
//! work ID, and are parked in a map (together with the buffer, file descriptor, and
//! address storage the kernel writes into) until their CQE arrives. Each operation owns
//! a reference to its file descriptor, so a socket closed while operations are pending
//! is never reused before they complete.
//!
//! Closing a socket shuts it down (waking every pending operation on it) and marks those
//! operations so they complete with [Status::Cancelled].
//!
//! A disconnect shuts down the write side and then keeps receiving (and discarding) input
//! until the peer closes or [Config::drain_timeout] elapses, so the descriptor is never
//! closed with unread input (which would reset the connection and drop unsent output).

use super::{Callback, Completion, SocketId, Status};
use crate::{Buffer, Error};
use futures::{channel::mpsc, executor::block_on, StreamExt as _};
use io_uring::{
    opcode::{self, LinkTimeout},
    squeue::{Entry as SqueueEntry, Flags},
    types::{Fd, Timespec},
    IoUring,
};
use std::{
    collections::{HashMap, VecDeque},
    mem::MaybeUninit,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::Range,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// Reserved ID for a CQE that indicates the event loop should
/// wake up to check for new work.
const POLL_WORK_ID: u64 = u64::MAX;

/// Size of the scratch buffer input is discarded into while disconnecting.
const DRAIN_CHUNK: usize = 4 * 1024;

/// Configuration for an io_uring [Driver].
/// See `man io_uring`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the ring (and the maximum number of operations in flight).
    pub size: u32,
    /// If true, use IOPOLL mode.
    pub io_poll: bool,
    /// If true, use single issuer mode.
    pub single_issuer: bool,
    /// While operations are in flight, wait at most this long for a completion before
    /// checking for new work to submit.
    ///
    /// Operations submitted while the ring thread is parked (for example, a send queued
    /// while every connection is waiting on a receive) are picked up no later than this.
    pub force_poll: Duration,
    /// Maximum time a disconnect waits for the peer to close its side.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: 256,
            io_poll: false,
            single_issuer: true,
            force_poll: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

fn new_ring(cfg: &Config) -> Result<IoUring, std::io::Error> {
    let mut builder = &mut IoUring::builder();
    if cfg.io_poll {
        builder = builder.setup_iopoll();
    }
    if cfg.single_issuer {
        builder = builder.setup_single_issuer();
    }
    builder.build(cfg.size)
}

enum Slot {
    Listener(Arc<OwnedFd>),
    Reserved,
    Connected(Arc<OwnedFd>),
    /// Write side shut down, discarding input until the peer closes.
    Draining(Arc<OwnedFd>),
}

type Sockets = Arc<Mutex<HashMap<SocketId, Slot>>>;

enum Request {
    Accept {
        listener: Arc<OwnedFd>,
        socket: SocketId,
        buffer: Buffer,
        callback: Callback,
    },
    Receive {
        fd: Arc<OwnedFd>,
        socket: SocketId,
        buffer: Buffer,
        callback: Callback,
    },
    Send {
        fd: Arc<OwnedFd>,
        socket: SocketId,
        buffer: Buffer,
        range: Range<usize>,
        callback: Callback,
    },
    Shutdown {
        fd: Arc<OwnedFd>,
        socket: SocketId,
        callback: Callback,
        deadline: Instant,
    },
    /// Discard input after a shutdown.
    Drain {
        fd: Arc<OwnedFd>,
        socket: SocketId,
        callback: Callback,
        deadline: Instant,
    },
    /// Close a socket (a reserved socket has no descriptor yet).
    Close {
        fd: Option<Arc<OwnedFd>>,
        socket: SocketId,
    },
}

impl Request {
    /// Report that the request could not be submitted.
    fn fail(self, status: Status) {
        match self {
            Request::Accept {
                buffer, callback, ..
            }
            | Request::Receive {
                buffer, callback, ..
            }
            | Request::Send {
                buffer, callback, ..
            } => callback(Completion::failed(status, Some(buffer))),
            Request::Shutdown { callback, .. } | Request::Drain { callback, .. } => {
                callback(Completion::failed(status, None))
            }
            Request::Close { .. } => {}
        }
    }
}

enum Kind {
    Accept {
        address: Box<libc::sockaddr_storage>,
        length: Box<libc::socklen_t>,
    },
    Receive,
    Send,
    Shutdown {
        deadline: Instant,
    },
    Drain {
        scratch: Box<[u8; DRAIN_CHUNK]>,
        timeout: Box<Timespec>,
        deadline: Instant,
    },
}

/// An operation the kernel may still be writing into.
struct Op {
    kind: Kind,
    /// Socket the operation targets (for an accept, the socket being populated).
    socket: SocketId,
    fd: Arc<OwnedFd>,
    buffer: Option<Buffer>,
    callback: Callback,
    cancelled: bool,
}

fn peer_address(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    // SAFETY: the family tag determines which layout the kernel wrote
    unsafe {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                let address = &*(storage as *const _ as *const libc::sockaddr_in);
                Some(SocketAddr::from((
                    Ipv4Addr::from(u32::from_be(address.sin_addr.s_addr)),
                    u16::from_be(address.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let address = &*(storage as *const _ as *const libc::sockaddr_in6);
                Some(SocketAddr::from((
                    Ipv6Addr::from(address.sin6_addr.s6_addr),
                    u16::from_be(address.sin6_port),
                )))
            }
            _ => None,
        }
    }
}

fn shutdown(fd: &OwnedFd) {
    // SAFETY: the descriptor is owned and open
    unsafe {
        libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR);
    }
}

/// Turn a request into the entry to submit and the state to keep until it completes.
fn prepare(request: Request, work_id: u64) -> (SqueueEntry, Op) {
    let (entry, op) = match request {
        Request::Accept {
            listener,
            socket,
            buffer,
            callback,
        } => {
            // SAFETY: all-zeros is a valid sockaddr_storage
            let mut address = Box::new(unsafe {
                MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init()
            });
            let mut length =
                Box::new(std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t);
            let entry = opcode::Accept::new(
                Fd(listener.as_raw_fd()),
                &mut *address as *mut _ as *mut libc::sockaddr,
                &mut *length,
            )
            .flags(libc::SOCK_CLOEXEC)
            .build();
            let op = Op {
                kind: Kind::Accept { address, length },
                socket,
                fd: listener,
                buffer: Some(buffer),
                callback,
                cancelled: false,
            };
            (entry, op)
        }
        Request::Receive {
            fd,
            socket,
            mut buffer,
            callback,
        } => {
            let region = buffer.receive_region();
            let entry =
                opcode::Recv::new(Fd(fd.as_raw_fd()), region.as_mut_ptr(), region.len() as u32)
                    .build();
            let op = Op {
                kind: Kind::Receive,
                socket,
                fd,
                buffer: Some(buffer),
                callback,
                cancelled: false,
            };
            (entry, op)
        }
        Request::Send {
            fd,
            socket,
            buffer,
            range,
            callback,
        } => {
            let bytes = &buffer.as_slice()[range];
            let entry = opcode::Send::new(Fd(fd.as_raw_fd()), bytes.as_ptr(), bytes.len() as u32)
                .flags(libc::MSG_NOSIGNAL)
                .build();
            let op = Op {
                kind: Kind::Send,
                socket,
                fd,
                buffer: Some(buffer),
                callback,
                cancelled: false,
            };
            (entry, op)
        }
        Request::Shutdown {
            fd,
            socket,
            callback,
            deadline,
        } => {
            let entry = opcode::Shutdown::new(Fd(fd.as_raw_fd()), libc::SHUT_WR).build();
            let op = Op {
                kind: Kind::Shutdown { deadline },
                socket,
                fd,
                buffer: None,
                callback,
                cancelled: false,
            };
            (entry, op)
        }
        Request::Drain {
            fd,
            socket,
            callback,
            deadline,
        } => {
            let mut scratch = Box::new([0u8; DRAIN_CHUNK]);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = Box::new(
                Timespec::new()
                    .sec(remaining.as_secs())
                    .nsec(remaining.subsec_nanos()),
            );
            let entry = opcode::Recv::new(
                Fd(fd.as_raw_fd()),
                scratch.as_mut_ptr(),
                DRAIN_CHUNK as u32,
            )
            .build()
            .flags(Flags::IO_LINK);
            let op = Op {
                kind: Kind::Drain {
                    scratch,
                    timeout,
                    deadline,
                },
                socket,
                fd,
                buffer: None,
                callback,
                cancelled: false,
            };
            (entry, op)
        }
        Request::Close { .. } => unreachable!("close is never submitted to the ring"),
    };
    (entry.user_data(work_id), op)
}

/// Release a socket whose disconnect finished and report it.
fn finish(
    sockets: &Sockets,
    socket: SocketId,
    fd: Arc<OwnedFd>,
    callback: Callback,
    status: Status,
) {
    {
        let mut sockets = sockets.lock().unwrap();
        if matches!(sockets.get(&socket), Some(Slot::Draining(_))) {
            sockets.remove(&socket);
        }
    }
    drop(fd);
    callback(Completion::new(status, 0, None));
}

/// Deliver the completion of `op`, whose CQE carried `result`, returning any follow-up
/// request to submit.
fn complete(sockets: &Sockets, op: Op, result: i32) -> Option<Request> {
    let Op {
        kind,
        socket,
        fd,
        buffer,
        callback,
        cancelled,
    } = op;
    match kind {
        Kind::Shutdown { deadline } => {
            if cancelled {
                finish(sockets, socket, fd, callback, Status::Cancelled);
            } else if result < 0 {
                finish(sockets, socket, fd, callback, Status::from_errno(-result));
            } else {
                return Some(Request::Drain {
                    fd,
                    socket,
                    callback,
                    deadline,
                });
            }
        }
        Kind::Drain { deadline, .. } => {
            // A timeout, an error, or EOF all end the drain
            if !cancelled && result > 0 && Instant::now() < deadline {
                return Some(Request::Drain {
                    fd,
                    socket,
                    callback,
                    deadline,
                });
            }
            let status = if cancelled {
                Status::Cancelled
            } else {
                Status::Success
            };
            finish(sockets, socket, fd, callback, status);
        }
        _ if result < 0 => {
            let status = if cancelled {
                Status::Cancelled
            } else {
                Status::from_errno(-result)
            };
            callback(Completion::failed(status, buffer));
        }
        Kind::Accept { address, length } => {
            // SAFETY: the kernel returned a new descriptor that nothing else owns
            let accepted = unsafe { OwnedFd::from_raw_fd(result) };
            let installed = !cancelled && {
                let mut sockets = sockets.lock().unwrap();
                match sockets.get_mut(&socket) {
                    Some(slot @ Slot::Reserved) => {
                        *slot = Slot::Connected(Arc::new(accepted));
                        true
                    }
                    _ => false,
                }
            };
            if !installed {
                callback(Completion::failed(Status::Cancelled, buffer));
                return None;
            }
            let mut completion = Completion::new(Status::Success, 0, buffer);
            if let Some(peer) = (*length > 0).then(|| peer_address(&address)).flatten() {
                completion = completion.with_peer(peer);
            }
            callback(completion);
        }
        Kind::Receive | Kind::Send => {
            let status = if cancelled {
                Status::Cancelled
            } else {
                Status::Success
            };
            callback(Completion::new(status, result as usize, buffer));
        }
    }
    None
}

/// Ask the kernel to cancel the operation tagged `work_id`.
fn cancel(ring: &mut IoUring, work_id: u64) {
    let entry = opcode::AsyncCancel::new(work_id).build().user_data(POLL_WORK_ID);
    // SAFETY: the entry holds no pointers
    if unsafe { ring.submission().push(&entry) }.is_err() {
        warn!(work_id, "unable to cancel operation");
    }
}

/// Runs the ring until the [Driver] is dropped and every operation has completed.
async fn run(
    cfg: Config,
    mut ring: IoUring,
    sockets: Sockets,
    mut receiver: mpsc::UnboundedReceiver<Request>,
) {
    let mut next_work_id: u64 = 0;
    // Maps a work ID to the operation it belongs to.
    let mut waiters: HashMap<u64, Op> = HashMap::with_capacity(cfg.size as usize);
    let poll = Timespec::new()
        .sec(cfg.force_poll.as_secs())
        .nsec(cfg.force_poll.subsec_nanos());
    // Requests produced by completions (the steps of a disconnect).
    let mut follow_ups: VecDeque<Request> = VecDeque::new();
    let mut draining = false;

    loop {
        // Deliver completions
        while let Some(cqe) = ring.completion().next() {
            let work_id = cqe.user_data();
            if work_id == POLL_WORK_ID {
                continue;
            }
            match waiters.remove(&work_id) {
                Some(op) => follow_ups.extend(complete(&sockets, op, cqe.result())),
                None => debug_assert!(false, "unknown work id {work_id}"),
            }
        }
        if draining {
            for request in follow_ups.drain(..) {
                request.fail(Status::Cancelled);
            }
            if waiters.is_empty() {
                return;
            }
        }

        // Fill the submission queue with incoming work, leaving room for the poll timeout
        while !draining && waiters.len() + 1 < cfg.size as usize {
            let request = if let Some(request) = follow_ups.pop_front() {
                Some(request)
            } else if waiters.is_empty() {
                // Block until there is something to do
                receiver.next().await
            } else {
                match receiver.try_next() {
                    Ok(request) => request,
                    // No new work available, wait for a completion
                    Err(_) => break,
                }
            };
            let Some(request) = request else {
                // The driver was dropped: cancel everything still pending
                debug!(pending = waiters.len(), "draining ring");
                for op in waiters.values_mut() {
                    op.cancelled = true;
                    shutdown(&op.fd);
                }
                draining = true;
                break;
            };
            if let Request::Close { fd, socket } = request {
                let mut targets = Vec::new();
                for (work_id, op) in waiters.iter_mut() {
                    let listening = fd.as_ref().is_some_and(|fd| Arc::ptr_eq(fd, &op.fd));
                    if op.socket == socket || listening {
                        op.cancelled = true;
                        targets.push(*work_id);
                    }
                }
                match fd {
                    Some(fd) => shutdown(&fd),
                    None => {
                        // A pending accept has nothing to shut down, so cancel it instead
                        for work_id in targets {
                            cancel(&mut ring, work_id);
                        }
                    }
                }
                continue;
            }
            if let Request::Shutdown { socket, .. } = &request {
                // Nothing else may consume input once the socket starts draining
                for (work_id, op) in waiters.iter_mut() {
                    if op.socket == *socket {
                        op.cancelled = true;
                        cancel(&mut ring, *work_id);
                    }
                }
            }

            // Assign a unique id
            let work_id = next_work_id;
            next_work_id += 1;
            if next_work_id == POLL_WORK_ID {
                // Wrap back to 0
                next_work_id = 0;
            }
            let (entry, op) = prepare(request, work_id);

            // SAFETY: every pointer in the entries refers to memory owned by `op`, which
            // stays in `waiters` until the kernel reports completion
            let pushed = match &op.kind {
                Kind::Drain { timeout, .. } => {
                    // Bound the receive by the time left to drain
                    let timeout = LinkTimeout::new(&**timeout).build().user_data(POLL_WORK_ID);
                    unsafe { ring.submission().push_multiple(&[entry, timeout]) }
                }
                _ => unsafe { ring.submission().push(&entry) },
            };
            if pushed.is_err() {
                warn!(work_id, "submission queue full");
                follow_ups.extend(complete(&sockets, op, -libc::EAGAIN));
                break;
            }
            waiters.insert(work_id, op);
        }
        if waiters.is_empty() {
            if draining {
                return;
            }
            continue;
        }

        // Submit a timeout operation to wake us up to check for new work
        let timeout = opcode::Timeout::new(&poll).build().user_data(POLL_WORK_ID);
        // SAFETY: `poll` outlives the ring
        if unsafe { ring.submission().push(&timeout) }.is_err() {
            warn!("unable to push poll timeout");
        }

        // Wait for at least 1 item to be in the completion queue
        if let Err(err) = ring.submit_and_wait(1) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!(?err, "unable to submit to ring");
            }
        }
    }
}

/// [crate::Driver] implementation backed by `io_uring`.
pub struct Driver {
    submitter: mpsc::UnboundedSender<Request>,
    drain_timeout: Duration,
    next: AtomicU64,
    sockets: Sockets,
}

impl Driver {
    /// Create the ring and start the thread that drives it.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        if cfg.size < 2 {
            return Err(Error::InvalidConfig("size must be at least 2".into()));
        }
        let sockets: Sockets = Arc::new(Mutex::new(HashMap::new()));
        let (submitter, receiver) = mpsc::unbounded();
        let shared = sockets.clone();
        let drain_timeout = cfg.drain_timeout;

        // In single issuer mode, the ring must be created by the thread that submits to it
        let (ready, created) = std::sync::mpsc::sync_channel(1);
        thread::Builder::new()
            .name("overlap-ring".into())
            .spawn(move || {
                let ring = match new_ring(&cfg) {
                    Ok(ring) => ring,
                    Err(err) => {
                        let _ = ready.send(Err(err));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));
                block_on(run(cfg, ring, shared, receiver));
            })?;
        created
            .recv()
            .map_err(|_| Error::Closed)??;
        Ok(Self {
            submitter,
            drain_timeout,
            next: AtomicU64::new(0),
            sockets,
        })
    }

    fn register(&self, slot: Slot) -> SocketId {
        let id = SocketId::new(self.next.fetch_add(1, Ordering::Relaxed));
        self.sockets.lock().unwrap().insert(id, slot);
        id
    }

    fn submit(&self, request: Request) {
        if let Err(err) = self.submitter.unbounded_send(request) {
            err.into_inner().fail(Status::Aborted);
        }
    }

    fn listener(&self, id: SocketId) -> Option<Arc<OwnedFd>> {
        match self.sockets.lock().unwrap().get(&id)? {
            Slot::Listener(fd) => Some(fd.clone()),
            _ => None,
        }
    }

    fn stream(&self, id: SocketId) -> Option<Arc<OwnedFd>> {
        match self.sockets.lock().unwrap().get(&id)? {
            Slot::Connected(fd) => Some(fd.clone()),
            _ => None,
        }
    }
}

impl super::Driver for Driver {
    fn listen(&self, address: SocketAddr) -> Result<(SocketId, SocketAddr), Error> {
        let listener = std::net::TcpListener::bind(address).map_err(|err| {
            warn!(?err, %address, "failed to bind");
            Error::BindFailed
        })?;
        let local = listener.local_addr()?;
        let id = self.register(Slot::Listener(Arc::new(OwnedFd::from(listener))));
        debug!(socket = %id, address = %local, "listening");
        Ok((id, local))
    }

    fn open(&self) -> Result<SocketId, Error> {
        Ok(self.register(Slot::Reserved))
    }

    fn accept(&self, listener: SocketId, socket: SocketId, buffer: Buffer, callback: Callback) {
        let Some(listener) = self.listener(listener) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        self.submit(Request::Accept {
            listener,
            socket,
            buffer,
            callback,
        });
    }

    fn receive(&self, socket: SocketId, buffer: Buffer, callback: Callback) {
        let Some(fd) = self.stream(socket) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        self.submit(Request::Receive {
            fd,
            socket,
            buffer,
            callback,
        });
    }

    fn send(&self, socket: SocketId, buffer: Buffer, range: Range<usize>, callback: Callback) {
        let Some(fd) = self.stream(socket) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        if range.is_empty() {
            return callback(Completion::new(Status::Success, 0, Some(buffer)));
        }
        self.submit(Request::Send {
            fd,
            socket,
            buffer,
            range,
            callback,
        });
    }

    fn disconnect(&self, socket: SocketId, callback: Callback) {
        let fd = {
            let mut sockets = self.sockets.lock().unwrap();
            match sockets.get(&socket) {
                Some(Slot::Connected(fd)) => {
                    let fd = fd.clone();
                    sockets.insert(socket, Slot::Draining(fd.clone()));
                    Some(fd)
                }
                _ => None,
            }
        };
        let Some(fd) = fd else {
            return callback(Completion::failed(Status::NotSocket, None));
        };

        // The descriptor is closed once the peer closes or the drain times out
        self.submit(Request::Shutdown {
            fd,
            socket,
            callback,
            deadline: Instant::now() + self.drain_timeout,
        });
    }

    fn close(&self, socket: SocketId) {
        let slot = self.sockets.lock().unwrap().remove(&socket);
        let fd = match slot {
            Some(Slot::Listener(fd)) | Some(Slot::Connected(fd)) | Some(Slot::Draining(fd)) => {
                Some(fd)
            }
            Some(Slot::Reserved) => None,
            None => return,
        };
        self.submit(Request::Close { fd, socket });
    }
}
