//! Per-connection state machine.
//!
//! A [Handler] owns one socket identity for its whole life: it arms an accept, serves the
//! accepted connection, and retires once the connection is gone (after which the
//! [Listener] replaces it with a fresh handler).
//!
//! # Completions
//!
//! Accept and receive completions run protocol code, so they are handed to the
//! [crate::Executor]. Send and disconnect completions only update bookkeeping and submit
//! the next operation, so they are applied directly in the driver callback (a worker
//! blocked waiting for a send buffer is released without needing another worker).
//!
//! # Locking
//!
//! The bookkeeping in [Inner] is guarded by its own mutex, which is never held across a
//! driver submission. The [Protocol] instance has a separate mutex held for the duration
//! of a round. Rounds for one connection never overlap: a new receive is only armed once
//! the previous round has flushed.

use crate::{
    driver::{Completion, Driver, SocketId, Status},
    executor::Executor,
    metrics::{Fault, Metrics},
    queue::BufferQueue,
    state::{Machine, State},
    stream::{BufferedStream, Conduit},
    sync::Latch,
    Buffer, BufferPool, Config, Listener, Protocol, Verdict,
};
use std::{
    io,
    net::SocketAddr,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
};
use tracing::{debug, error, warn};

/// Resources shared by every handler of a [Listener].
pub(crate) struct Context<D: Driver> {
    pub(crate) driver: Arc<D>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) cfg: Config,
    pub(crate) metrics: Metrics,
}

/// The buffer currently being transmitted.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    slot: usize,
    offset: usize,
    end: usize,
}

/// What to submit once the bookkeeping lock is released.
enum Action {
    None,
    Send(Buffer, Range<usize>),
    Receive,
    Disconnect,
}

#[derive(Default)]
struct Inner {
    machine: Machine,
    queue: BufferQueue,
    sending: Option<InFlight>,
    /// Driver operations submitted but not yet completed.
    outstanding: usize,
    /// A protocol round is in progress.
    busy: bool,
    /// The accept succeeded.
    connected: bool,
    retired: bool,
    peer: Option<SocketAddr>,
}

impl Inner {
    fn transition(&mut self, next: State) -> bool {
        match self.machine.transition(next) {
            Ok(_) => true,
            Err(err) => {
                debug!(?err, "ignoring transition");
                false
            }
        }
    }

    /// Start transmitting the next queued buffer if nothing is in flight.
    fn next_send(&mut self) -> Option<(Buffer, Range<usize>)> {
        if self.machine.is_stopped() || self.sending.is_some() {
            return None;
        }
        let buffer = self.queue.pop()?;
        let end = buffer.size();
        self.sending = Some(InFlight {
            slot: buffer.slot(),
            offset: 0,
            end,
        });
        self.outstanding += 1;
        Some((buffer, 0..end))
    }

    /// Decide what to do once a round or a send has finished.
    fn advance(&mut self) -> Action {
        if let Some((buffer, range)) = self.next_send() {
            return Action::Send(buffer, range);
        }
        if self.busy || self.sending.is_some() {
            return Action::None;
        }
        match self.machine.state() {
            State::FlushingWriteQueue => {
                self.transition(State::Connected);
                Action::Receive
            }
            State::FlushingWriteQueueBeforeDisconnect => {
                self.transition(State::Disconnecting);
                self.outstanding += 1;
                Action::Disconnect
            }
            _ => Action::None,
        }
    }
}

fn status_error(status: Status) -> io::Error {
    let kind = match status {
        Status::RemoteDisconnect => io::ErrorKind::ConnectionReset,
        Status::LocalDisconnect | Status::NotSocket => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::ConnectionAborted,
    };
    io::Error::new(kind, format!("receive failed: {status:?}"))
}

/// Serves one connection at a time on behalf of a [Listener].
pub struct Handler<D: Driver, P: Protocol> {
    id: SocketId,
    context: Arc<Context<D>>,
    listener: Weak<Listener<D, P>>,
    protocol: Mutex<P>,
    receive_pool: BufferPool,
    send_pool: BufferPool,
    inner: Mutex<Inner>,
}

impl<D: Driver, P: Protocol> Handler<D, P> {
    pub(crate) fn new(
        id: SocketId,
        context: Arc<Context<D>>,
        listener: Weak<Listener<D, P>>,
        protocol: P,
    ) -> Arc<Self> {
        let receive_pool = BufferPool::new(context.cfg.receive_buffers, context.cfg.buffer_size);
        let send_pool = BufferPool::new(context.cfg.send_buffers, context.cfg.buffer_size);
        Arc::new(Self {
            id,
            context,
            listener,
            protocol: Mutex::new(protocol),
            receive_pool,
            send_pool,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Identity of the socket this handler serves.
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().machine.state()
    }

    /// Address of the connected peer (once accepted).
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().peer
    }

    /// The listener that owns this handler, if it still exists.
    pub fn listener(&self) -> Option<Arc<Listener<D, P>>> {
        self.listener.upgrade()
    }

    /// Close the connection immediately.
    ///
    /// Queued output is discarded and pending operations complete as cancelled. Takes
    /// precedence over any flush or disconnect in progress.
    pub fn stop(self: &Arc<Self>) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.machine.stop() {
                drop(inner);
                return self.maybe_retire();
            }
            inner.queue.drain().collect::<Vec<_>>()
        };
        for buffer in drained {
            self.send_pool.release(buffer);
        }
        debug!(socket = %self.id, "stopped connection handler");
        self.context.driver.close(self.id);
        self.maybe_retire();
    }

    fn dispatch(self: &Arc<Self>, job: impl FnOnce(&Arc<Self>) + Send + 'static) {
        let handler = self.clone();
        self.context.executor.execute(Box::new(move || job(&handler)));
    }

    /// Record that an operation completed.
    fn complete(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.outstanding > 0, "completion without operation");
        inner.outstanding -= 1;
        inner
    }

    fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().machine.is_stopped()
    }

    fn acquire(&self, pool: &BufferPool) -> io::Result<Buffer> {
        pool.acquire(self.context.cfg.acquire_timeout).map_err(|err| {
            self.context.metrics.buffer_timeouts.inc();
            warn!(socket = %self.id, ?err, "unable to acquire buffer");
            io::Error::new(io::ErrorKind::TimedOut, err)
        })
    }

    /// Wait for a connection on `listener`.
    pub(crate) fn arm_accept(self: &Arc<Self>, listener: SocketId) {
        let Ok(mut buffer) = self.acquire(&self.receive_pool) else {
            return self.stop();
        };
        buffer.prepare_for_accept();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.machine.is_stopped() {
                drop(inner);
                self.receive_pool.release(buffer);
                return self.maybe_retire();
            }
            inner.outstanding += 1;
        }
        let handler = self.clone();
        self.context.driver.accept(
            listener,
            self.id,
            buffer,
            Box::new(move |completion| {
                handler.dispatch(move |handler| handler.handle_accept(completion))
            }),
        );
    }

    fn handle_accept(self: &Arc<Self>, completion: Completion) {
        let Completion {
            status,
            transferred,
            buffer,
            peer,
        } = completion;
        let mut inner = self.complete();
        let buffer = match buffer {
            Some(buffer) if status.is_success() && !inner.machine.is_stopped() => buffer,
            buffer => {
                drop(inner);
                if let Some(buffer) = buffer {
                    self.receive_pool.release(buffer);
                }
                debug!(socket = %self.id, ?status, "accept did not complete");
                return self.stop();
            }
        };
        inner.transition(State::Connected);
        inner.connected = true;
        inner.peer = peer;
        drop(inner);

        self.context.metrics.connections_accepted.inc();
        self.context.metrics.connections_active.inc();
        debug!(socket = %self.id, ?peer, "accepted connection");

        // Data delivered with the accept is processed right away
        if transferred == 0 {
            self.receive_pool.release(buffer);
            return self.begin_receive();
        }
        let mut buffer = buffer;
        self.context
            .metrics
            .bytes_received
            .inc_by(transferred as u64);
        buffer.prepare_for_read(transferred);
        self.round(buffer);
    }

    fn begin_receive(self: &Arc<Self>) {
        let Ok(mut buffer) = self.acquire(&self.receive_pool) else {
            return self.stop();
        };
        buffer.prepare_for_receive();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.machine.is_stopped() {
                drop(inner);
                self.receive_pool.release(buffer);
                return self.maybe_retire();
            }
            inner.outstanding += 1;
        }
        let handler = self.clone();
        self.context.driver.receive(
            self.id,
            buffer,
            Box::new(move |completion| {
                handler.dispatch(move |handler| handler.handle_receive(completion))
            }),
        );
    }

    fn handle_receive(self: &Arc<Self>, completion: Completion) {
        let Completion {
            status,
            transferred,
            buffer,
            ..
        } = completion;
        let stopped = self.complete().machine.is_stopped();
        let Some(mut buffer) = buffer else {
            return self.stop();
        };
        if stopped {
            self.receive_pool.release(buffer);
            return self.maybe_retire();
        }
        if !status.is_success() || transferred == 0 {
            self.receive_pool.release(buffer);
            debug!(socket = %self.id, ?status, "connection closed");
            return self.stop();
        }
        self.context
            .metrics
            .bytes_received
            .inc_by(transferred as u64);
        buffer.prepare_for_read(transferred);
        self.round(buffer);
    }

    /// Run the protocol over `input` (and anything else it waits for), then flush.
    fn round(self: &Arc<Self>, input: Buffer) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.machine.is_stopped() {
                drop(inner);
                self.receive_pool.release(input);
                return self.maybe_retire();
            }
            inner.busy = true;
        }
        let (verdict, pending) = {
            let mut protocol = self.protocol.lock().unwrap();
            let mut stream = BufferedStream::new(self, input);
            let verdict = self.drive(&mut protocol, &mut stream);
            (verdict, stream.finish())
        };
        self.flush(pending, verdict);
    }

    /// Invoke the protocol until it has consumed the input, asks to close, or fails.
    fn drive(&self, protocol: &mut P, stream: &mut BufferedStream<'_>) -> Verdict {
        loop {
            if self.is_stopped() {
                return Verdict::Close;
            }
            let consumed = stream.consumed();
            let result = panic::catch_unwind(AssertUnwindSafe(|| protocol.process(stream)));
            let fault = match result {
                // A fault reads as EOF to the protocol, whatever it returns
                Ok(Ok(_)) if stream.is_faulted() => {
                    warn!(socket = %self.id, "stream faulted");
                    Fault::STREAM
                }
                Ok(Ok(Verdict::Close)) => return Verdict::Close,
                Ok(Ok(Verdict::Continue)) => {
                    if !stream.has_input() {
                        // The peer closing its side ends the conversation
                        return if stream.at_eof() {
                            Verdict::Close
                        } else {
                            Verdict::Continue
                        };
                    } else if stream.consumed() == consumed {
                        warn!(socket = %self.id, "protocol made no progress");
                        Fault::STALL
                    } else {
                        continue;
                    }
                }
                Ok(Err(err)) => {
                    warn!(socket = %self.id, ?err, "protocol fault");
                    if stream.is_faulted() {
                        Fault::STREAM
                    } else {
                        Fault::ERROR
                    }
                }
                Err(_) => {
                    error!(socket = %self.id, "protocol panicked");
                    Fault::PANIC
                }
            };
            self.context
                .metrics
                .protocol_faults
                .get_or_create(&fault)
                .inc();
            return Verdict::Close;
        }
    }

    /// Queue whatever the round left in its send buffer and start draining the queue.
    fn flush(self: &Arc<Self>, pending: Option<Buffer>, verdict: Verdict) {
        let mut inner = self.inner.lock().unwrap();
        inner.busy = false;
        if inner.machine.is_stopped() {
            drop(inner);
            if let Some(buffer) = pending {
                self.send_pool.release(buffer);
            }
            return self.maybe_retire();
        }
        let mut unused = None;
        if let Some(mut buffer) = pending {
            if buffer.position() > 0 {
                buffer.prepare_for_send();
                inner.queue.push(buffer);
            } else {
                unused = Some(buffer);
            }
        }
        inner.transition(match verdict {
            Verdict::Continue => State::FlushingWriteQueue,
            Verdict::Close => State::FlushingWriteQueueBeforeDisconnect,
        });
        let action = inner.advance();
        drop(inner);

        if let Some(buffer) = unused {
            self.send_pool.release(buffer);
        }
        self.perform(action);
    }

    fn perform(self: &Arc<Self>, action: Action) {
        match action {
            Action::None => {}
            Action::Send(buffer, range) => self.transmit(buffer, range),
            Action::Receive => self.begin_receive(),
            Action::Disconnect => {
                debug!(socket = %self.id, "disconnecting");
                let handler = self.clone();
                self.context.driver.disconnect(
                    self.id,
                    Box::new(move |completion| handler.handle_disconnect(completion)),
                );
            }
        }
    }

    fn transmit(self: &Arc<Self>, buffer: Buffer, range: Range<usize>) {
        let handler = self.clone();
        self.context.driver.send(
            self.id,
            buffer,
            range,
            Box::new(move |completion| handler.handle_send(completion)),
        );
    }

    fn handle_send(self: &Arc<Self>, completion: Completion) {
        let Completion {
            status,
            transferred,
            buffer,
            ..
        } = completion;
        let mut inner = self.complete();
        let sending = inner.sending.take();
        let Some(buffer) = buffer else {
            drop(inner);
            return self.stop();
        };
        let Some(mut sending) = sending else {
            debug_assert!(false, "send completed with nothing in flight");
            drop(inner);
            return self.send_pool.release(buffer);
        };
        debug_assert_eq!(buffer.slot(), sending.slot, "send buffer mismatch");
        if inner.machine.is_stopped() {
            drop(inner);
            self.send_pool.release(buffer);
            return self.maybe_retire();
        }
        if !status.is_success() || transferred == 0 {
            drop(inner);
            self.send_pool.release(buffer);
            debug!(socket = %self.id, ?status, "send failed");
            return self.stop();
        }
        self.context.metrics.bytes_sent.inc_by(transferred as u64);

        // Resume a partial send from where it stopped, in the same buffer
        sending.offset += transferred;
        if sending.offset < sending.end {
            self.context.metrics.partial_sends.inc();
            let range = sending.offset..sending.end;
            inner.sending = Some(sending);
            inner.outstanding += 1;
            drop(inner);
            return self.transmit(buffer, range);
        }

        let action = inner.advance();
        drop(inner);
        self.send_pool.release(buffer);
        match action {
            // Arming a receive may wait for a buffer, which a callback must not do
            Action::Receive => self.dispatch(|handler| handler.begin_receive()),
            action => self.perform(action),
        }
    }

    fn handle_disconnect(self: &Arc<Self>, completion: Completion) {
        self.complete().transition(State::Stopped);
        debug!(socket = %self.id, status = ?completion.status, "disconnected");
        self.maybe_retire();
    }

    /// Absorb a receive whose waiter gave up.
    fn handle_abandoned(self: &Arc<Self>, completion: Completion) {
        drop(self.complete());
        if let Some(buffer) = completion.buffer {
            self.receive_pool.release(buffer);
        }
        self.maybe_retire();
    }

    /// Schedule retirement once stopped and idle. Happens at most once.
    fn maybe_retire(self: &Arc<Self>) {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            let ready = inner.machine.is_stopped()
                && inner.outstanding == 0
                && !inner.busy
                && !inner.retired;
            if ready {
                inner.retired = true;
            }
            ready
        };
        if ready {
            self.dispatch(|handler| handler.retire());
        }
    }

    fn retire(self: &Arc<Self>) {
        self.context.driver.close(self.id);
        if self.inner.lock().unwrap().connected {
            self.context.metrics.connections_closed.inc();
            self.context.metrics.connections_active.dec();
        }
        debug_assert_eq!(self.receive_pool.outstanding(), 0, "receive buffer leaked");
        debug_assert_eq!(self.send_pool.outstanding(), 0, "send buffer leaked");
        debug!(socket = %self.id, "retiring connection handler");
        if let Some(listener) = self.listener.upgrade() {
            listener.destroy(self);
        }
    }
}

impl<D: Driver, P: Protocol> Conduit for Arc<Handler<D, P>> {
    fn acquire_receive(&self) -> io::Result<Buffer> {
        self.acquire(&self.receive_pool)
    }

    fn release_receive(&self, buffer: Buffer) {
        self.receive_pool.release(buffer);
    }

    fn acquire_send(&self) -> io::Result<Buffer> {
        self.acquire(&self.send_pool)
    }

    fn release_send(&self, buffer: Buffer) {
        self.send_pool.release(buffer);
    }

    fn enqueue(&self, mut buffer: Buffer) -> io::Result<()> {
        buffer.prepare_for_send();
        if buffer.size() == 0 {
            self.send_pool.release(buffer);
            return Ok(());
        }
        let send = {
            let mut inner = self.inner.lock().unwrap();
            if inner.machine.is_stopped() {
                drop(inner);
                self.send_pool.release(buffer);
                return Err(io::ErrorKind::NotConnected.into());
            }
            inner.queue.push(buffer);
            inner.next_send()
        };
        if let Some((buffer, range)) = send {
            self.transmit(buffer, range);
        }
        Ok(())
    }

    fn refill(&self, mut buffer: Buffer) -> io::Result<(Buffer, usize)> {
        buffer.prepare_for_receive();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.machine.is_stopped() {
                drop(inner);
                self.receive_pool.release(buffer);
                return Err(io::ErrorKind::NotConnected.into());
            }
            inner.outstanding += 1;
        }

        // The completion is handed over inline; if the wait has already given up, it is
        // absorbed on a worker instead
        let latch = Arc::new(Latch::new());
        let waiter = latch.clone();
        let handler = self.clone();
        self.context.driver.receive(
            self.id,
            buffer,
            Box::new(move |completion| {
                if let Err(completion) = latch.set(completion) {
                    handler.dispatch(move |handler| handler.handle_abandoned(completion));
                }
            }),
        );
        let Some(completion) = waiter.wait(self.context.cfg.receive_timeout) else {
            self.context.metrics.buffer_timeouts.inc();
            warn!(socket = %self.id, "timed out waiting for data");
            return Err(io::ErrorKind::TimedOut.into());
        };

        drop(self.complete());
        let Completion {
            status,
            transferred,
            buffer,
            ..
        } = completion;
        let Some(mut buffer) = buffer else {
            return Err(status_error(status));
        };
        if !status.is_success() {
            self.receive_pool.release(buffer);
            return Err(status_error(status));
        }
        self.context
            .metrics
            .bytes_received
            .inc_by(transferred as u64);
        buffer.prepare_for_read(transferred);
        Ok((buffer, transferred))
    }
}
