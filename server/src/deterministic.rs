//! A scripted driver and a single-threaded executor for reproducible tests.
//!
//! [Driver] keeps every socket in memory. Tests play the peer: they connect clients
//! ([Driver::connect]), deliver bytes ([Driver::push]), close or reset the connection,
//! and inspect what the engine sent ([Driver::output]) and in which order it submitted
//! operations ([Driver::operations]). Sends complete inline in full by default, but can
//! be limited ([Driver::set_send_limit]), randomly split ([Driver::seeded]), or held
//! until released ([Driver::hold_sends]).
//!
//! [Executor] queues jobs until [Executor::run_until_idle] is called, so the test decides
//! exactly when completion work runs.
//!
//! # Example
//!
//! ```rust
//! use overlap_server::{deterministic, echo::Echo, Config, Listener};
//! use prometheus_client::registry::Registry;
//! use std::sync::{Arc, Mutex};
//!
//! let registry = Arc::new(Mutex::new(Registry::default()));
//! let mut cfg = Config::recommended(registry, "127.0.0.1:4000".parse().unwrap());
//! cfg.capacity = 2;
//! let driver = Arc::new(deterministic::Driver::new());
//! let executor = Arc::new(deterministic::Executor::new());
//! let listener = Listener::new(cfg, driver.clone(), executor.clone(), Echo::default).unwrap();
//! listener.start().unwrap();
//! assert_eq!(driver.pending_accepts(), 2);
//!
//! // A client connects and sends one frame
//! let socket = driver.connect("10.0.0.1:5000".parse().unwrap(), &[0, 0, 0, 2, b'h', b'i']).unwrap();
//! executor.run_until_idle();
//! assert_eq!(driver.output(socket), vec![0, 0, 0, 2, b'h', b'i']);
//! ```

use crate::{
    driver::{Callback, Completion, SocketId, Status},
    executor::Job,
    Buffer, Error,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    ops::Range,
    sync::Mutex,
};
use tracing::trace;

/// Executor that runs queued jobs, in order, on the calling thread.
#[derive(Default)]
pub struct Executor {
    jobs: Mutex<VecDeque<Job>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Run jobs (including any they schedule) until none remain, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            let Some(job) = job else {
                return ran;
            };
            job();
            ran += 1;
        }
    }
}

impl crate::Executor for Executor {
    fn execute(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

/// An operation submitted to the [Driver].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Listen(SocketId),
    Accept {
        listener: SocketId,
        socket: SocketId,
    },
    Receive(SocketId),
    Send {
        socket: SocketId,
        slot: usize,
        range: Range<usize>,
    },
    Disconnect(SocketId),
    Close(SocketId),
}

#[derive(Default)]
struct Socket {
    listener: bool,
    connected: bool,
    peer: Option<SocketAddr>,
    inbound: VecDeque<u8>,
    eof: bool,
    reset: bool,
    output: Vec<u8>,
    receive: Option<(Buffer, Callback)>,
    disconnected: bool,
    closed: bool,
}

impl Socket {
    fn usable(&self) -> bool {
        self.connected && !self.closed && !self.disconnected
    }
}

struct Accept {
    listener: SocketId,
    socket: SocketId,
    buffer: Buffer,
    callback: Callback,
}

struct Held {
    socket: SocketId,
    buffer: Buffer,
    range: Range<usize>,
    callback: Callback,
}

#[derive(Default)]
struct State {
    next: u64,
    sockets: HashMap<SocketId, Socket>,
    accepts: VecDeque<Accept>,
    held: VecDeque<Held>,
    hold: bool,
    send_limit: Option<usize>,
    rng: Option<StdRng>,
    operations: Vec<Operation>,
}

impl State {
    fn register(&mut self, socket: Socket) -> SocketId {
        let id = SocketId::new(self.next);
        self.next += 1;
        self.sockets.insert(id, socket);
        id
    }

    /// Send the bytes a single send would transfer right now.
    fn transfer(&mut self, socket: SocketId, buffer: Buffer, range: Range<usize>) -> Completion {
        let mut count = range.len();
        if let Some(limit) = self.send_limit {
            count = count.min(limit);
        }
        if let Some(rng) = self.rng.as_mut() {
            if count > 1 {
                count = rng.gen_range(1..=count);
            }
        }
        let Some(entry) = self.sockets.get_mut(&socket).filter(|entry| entry.usable()) else {
            return Completion::failed(Status::NotSocket, Some(buffer));
        };
        if entry.reset {
            return Completion::failed(Status::RemoteDisconnect, Some(buffer));
        }
        entry
            .output
            .extend_from_slice(&buffer.as_slice()[range.start..range.start + count]);
        Completion::new(Status::Success, count, Some(buffer))
    }
}

/// Copy as much of `inbound` as fits into the receive region of `buffer`.
fn fill(inbound: &mut VecDeque<u8>, buffer: &mut Buffer) -> usize {
    let region = buffer.receive_region();
    let count = region.len().min(inbound.len());
    for (dst, src) in region.iter_mut().zip(inbound.drain(..count)) {
        *dst = src;
    }
    count
}

/// Invoke callbacks once the driver lock has been released.
fn fire(calls: Vec<(Callback, Completion)>) {
    for (callback, completion) in calls {
        callback(completion);
    }
}

/// In-memory [crate::Driver] whose peers are scripted by the test.
#[derive(Default)]
pub struct Driver {
    state: Mutex<State>,
}

impl Driver {
    /// Create a driver whose sends complete in full.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver whose sends transfer a random (non-empty) prefix of their range.
    pub fn seeded(seed: u64) -> Self {
        let driver = Self::default();
        driver.state.lock().unwrap().rng = Some(StdRng::seed_from_u64(seed));
        driver
    }

    /// Limit the number of bytes any single send transfers.
    pub fn set_send_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().send_limit = limit;
    }

    /// While set, sends stay pending until [Driver::release_sends].
    pub fn hold_sends(&self, hold: bool) {
        self.state.lock().unwrap().hold = hold;
    }

    /// Complete every send currently held, returning how many were completed.
    pub fn release_sends(&self) -> usize {
        let calls = {
            let mut state = self.state.lock().unwrap();
            let held = state.held.drain(..).collect::<Vec<_>>();
            held.into_iter()
                .map(|held| {
                    let completion = state.transfer(held.socket, held.buffer, held.range);
                    (held.callback, completion)
                })
                .collect::<Vec<_>>()
        };
        let released = calls.len();
        fire(calls);
        released
    }

    /// Number of sends waiting for [Driver::release_sends].
    pub fn held_sends(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    /// Number of accepts waiting for a client.
    pub fn pending_accepts(&self) -> usize {
        self.state.lock().unwrap().accepts.len()
    }

    /// Returns true if a receive is waiting for data on `socket`.
    pub fn pending_receive(&self, socket: SocketId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .sockets
            .get(&socket)
            .is_some_and(|entry| entry.receive.is_some())
    }

    /// Connect a client from `peer` to the oldest pending accept, delivering `initial`
    /// with the connection. Returns the socket that accepted it.
    pub fn connect(&self, peer: SocketAddr, initial: &[u8]) -> Option<SocketId> {
        let (socket, call) = {
            let mut state = self.state.lock().unwrap();
            let Accept {
                socket,
                mut buffer,
                callback,
                ..
            } = state.accepts.pop_front()?;
            let entry = state.sockets.get_mut(&socket)?;
            entry.connected = true;
            entry.peer = Some(peer);
            entry.inbound.extend(initial);
            let transferred = fill(&mut entry.inbound, &mut buffer);
            let completion =
                Completion::new(Status::Success, transferred, Some(buffer)).with_peer(peer);
            (socket, (callback, completion))
        };
        trace!(%socket, %peer, "connected");
        fire(vec![call]);
        Some(socket)
    }

    /// Deliver `bytes` from the peer of `socket`.
    pub fn push(&self, socket: SocketId, bytes: &[u8]) {
        let call = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.sockets.get_mut(&socket) else {
                return;
            };
            entry.inbound.extend(bytes);
            entry.receive.take().map(|(mut buffer, callback)| {
                let transferred = fill(&mut entry.inbound, &mut buffer);
                (
                    callback,
                    Completion::new(Status::Success, transferred, Some(buffer)),
                )
            })
        };
        fire(call.into_iter().collect());
    }

    /// Close the peer's side of `socket` (further receives return zero bytes).
    pub fn shutdown(&self, socket: SocketId) {
        let call = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.sockets.get_mut(&socket) else {
                return;
            };
            entry.eof = true;
            if entry.inbound.is_empty() {
                entry.receive.take().map(|(buffer, callback)| {
                    (callback, Completion::new(Status::Success, 0, Some(buffer)))
                })
            } else {
                None
            }
        };
        fire(call.into_iter().collect());
    }

    /// Reset the connection from the peer's side.
    pub fn reset(&self, socket: SocketId) {
        let call = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.sockets.get_mut(&socket) else {
                return;
            };
            entry.reset = true;
            entry.receive.take().map(|(buffer, callback)| {
                (
                    callback,
                    Completion::failed(Status::RemoteDisconnect, Some(buffer)),
                )
            })
        };
        fire(call.into_iter().collect());
    }

    /// Everything sent to the peer of `socket`.
    pub fn output(&self, socket: SocketId) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .sockets
            .get(&socket)
            .map(|entry| entry.output.clone())
            .unwrap_or_default()
    }

    /// Every operation submitted so far, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn is_disconnected(&self, socket: SocketId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .sockets
            .get(&socket)
            .is_some_and(|entry| entry.disconnected)
    }

    pub fn is_closed(&self, socket: SocketId) -> bool {
        let state = self.state.lock().unwrap();
        state.sockets.get(&socket).is_some_and(|entry| entry.closed)
    }
}

impl crate::Driver for Driver {
    fn listen(&self, address: SocketAddr) -> Result<(SocketId, SocketAddr), Error> {
        let mut state = self.state.lock().unwrap();
        let id = state.register(Socket {
            listener: true,
            ..Default::default()
        });
        state.operations.push(Operation::Listen(id));
        Ok((id, address))
    }

    fn open(&self) -> Result<SocketId, Error> {
        Ok(self.state.lock().unwrap().register(Socket::default()))
    }

    fn accept(&self, listener: SocketId, socket: SocketId, buffer: Buffer, callback: Callback) {
        let mut state = self.state.lock().unwrap();
        state
            .operations
            .push(Operation::Accept { listener, socket });
        let listening = state
            .sockets
            .get(&listener)
            .is_some_and(|entry| entry.listener && !entry.closed);
        let reserved = state
            .sockets
            .get(&socket)
            .is_some_and(|entry| !entry.listener && !entry.connected && !entry.closed);
        if !listening || !reserved {
            drop(state);
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        }
        state.accepts.push_back(Accept {
            listener,
            socket,
            buffer,
            callback,
        });
    }

    fn receive(&self, socket: SocketId, mut buffer: Buffer, callback: Callback) {
        let completion = {
            let mut state = self.state.lock().unwrap();
            state.operations.push(Operation::Receive(socket));
            match state.sockets.get_mut(&socket) {
                Some(entry) if entry.usable() => {
                    if entry.reset {
                        Completion::failed(Status::RemoteDisconnect, Some(buffer))
                    } else if !entry.inbound.is_empty() {
                        let transferred = fill(&mut entry.inbound, &mut buffer);
                        Completion::new(Status::Success, transferred, Some(buffer))
                    } else if entry.eof {
                        Completion::new(Status::Success, 0, Some(buffer))
                    } else {
                        debug_assert!(entry.receive.is_none(), "overlapping receives");
                        entry.receive = Some((buffer, callback));
                        return;
                    }
                }
                _ => Completion::failed(Status::NotSocket, Some(buffer)),
            }
        };
        callback(completion);
    }

    fn send(&self, socket: SocketId, buffer: Buffer, range: Range<usize>, callback: Callback) {
        let completion = {
            let mut state = self.state.lock().unwrap();
            state.operations.push(Operation::Send {
                socket,
                slot: buffer.slot(),
                range: range.clone(),
            });
            if state.hold {
                state.held.push_back(Held {
                    socket,
                    buffer,
                    range,
                    callback,
                });
                return;
            }
            state.transfer(socket, buffer, range)
        };
        callback(completion);
    }

    fn disconnect(&self, socket: SocketId, callback: Callback) {
        let calls = {
            let mut state = self.state.lock().unwrap();
            state.operations.push(Operation::Disconnect(socket));
            match state.sockets.get_mut(&socket) {
                Some(entry) if entry.usable() => {
                    entry.disconnected = true;
                    let mut calls = Vec::new();
                    if let Some((buffer, pending)) = entry.receive.take() {
                        calls.push((
                            pending,
                            Completion::failed(Status::Cancelled, Some(buffer)),
                        ));
                    }
                    calls.push((callback, Completion::new(Status::Success, 0, None)));
                    calls
                }
                _ => vec![(callback, Completion::failed(Status::NotSocket, None))],
            }
        };
        fire(calls);
    }

    fn close(&self, socket: SocketId) {
        let calls = {
            let mut state = self.state.lock().unwrap();
            state.operations.push(Operation::Close(socket));
            let Some(entry) = state.sockets.get_mut(&socket) else {
                return;
            };
            if entry.closed {
                return;
            }
            entry.closed = true;
            let mut calls = Vec::new();
            if let Some((buffer, callback)) = entry.receive.take() {
                calls.push((callback, Completion::failed(Status::Cancelled, Some(buffer))));
            }

            // Cancel held sends and accepts that involve the socket
            let (cancelled, kept): (Vec<_>, Vec<_>) =
                state.held.drain(..).partition(|held| held.socket == socket);
            state.held.extend(kept);
            for held in cancelled {
                calls.push((
                    held.callback,
                    Completion::failed(Status::Cancelled, Some(held.buffer)),
                ));
            }
            let (cancelled, kept): (Vec<_>, Vec<_>) = state
                .accepts
                .drain(..)
                .partition(|accept| accept.socket == socket || accept.listener == socket);
            state.accepts.extend(kept);
            for accept in cancelled {
                calls.push((
                    accept.callback,
                    Completion::failed(Status::Cancelled, Some(accept.buffer)),
                ));
            }
            calls
        };
        fire(calls);
    }
}
