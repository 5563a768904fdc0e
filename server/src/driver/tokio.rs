//! Portable [crate::Driver] that emulates completions on a [tokio] runtime.
//!
//! Every operation becomes a task that waits for readiness and then performs a single
//! non-blocking `try_read`/`try_write`, so sends may complete partially just as they do
//! on a real completion port. Each socket carries a `watch` channel that is flipped on
//! [crate::Driver::close], which cancels any task still pending on it.
//!
//! [crate::Driver::disconnect] shuts down the write side and then discards input until
//! the peer closes (or [Config::drain_timeout] elapses) before releasing the socket.
//! Closing a socket with unread input makes the kernel reset the connection, which
//! would throw away output still waiting in its send queue.

use super::{Callback, Completion, SocketId, Status};
use crate::{Buffer, Error};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Handle, Runtime},
    sync::watch,
};
use tracing::{debug, warn};

/// Configuration for the tokio [Driver].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of runtime threads that wait on socket readiness.
    threads: usize,
    /// Whether or not to disable Nagle's algorithm on accepted connections.
    ///
    /// If `None`, the operating system default is left in place.
    tcp_nodelay: Option<bool>,
    /// Maximum time a disconnect waits for the peer to close its side.
    drain_timeout: Duration,
}

impl Config {
    /// See [Config]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    /// See [Config]
    pub const fn with_tcp_nodelay(mut self, tcp_nodelay: Option<bool>) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// See [Config]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// See [Config]
    pub const fn threads(&self) -> usize {
        self.threads
    }
    /// See [Config]
    pub const fn tcp_nodelay(&self) -> Option<bool> {
        self.tcp_nodelay
    }
    /// See [Config]
    pub const fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 2,
            tcp_nodelay: Some(true),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

enum Kind {
    Listener(Arc<TcpListener>),
    /// Opened but not yet populated by an accept.
    Reserved,
    Connected(Arc<TcpStream>),
    /// Write side shut down, discarding input until the peer closes.
    Draining,
}

struct Entry {
    kind: Kind,
    closed: watch::Sender<bool>,
}

/// Size of the scratch buffer input is discarded into while disconnecting.
const DRAIN_CHUNK: usize = 4 * 1024;

type Sockets = Arc<Mutex<HashMap<SocketId, Entry>>>;

/// [crate::Driver] implementation backed by a dedicated [tokio] runtime.
pub struct Driver {
    cfg: Config,
    runtime: Option<Runtime>,
    handle: Handle,
    next: AtomicU64,
    sockets: Sockets,
}

impl Driver {
    /// Start the runtime that services this driver.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        if cfg.threads == 0 {
            return Err(Error::InvalidConfig("threads must be non-zero".into()));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(cfg.threads)
            .thread_name("overlap-driver")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            cfg,
            runtime: Some(runtime),
            handle,
            next: AtomicU64::new(0),
            sockets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn register(&self, kind: Kind) -> SocketId {
        let id = SocketId::new(self.next.fetch_add(1, Ordering::Relaxed));
        let (closed, _) = watch::channel(false);
        self.sockets
            .lock()
            .unwrap()
            .insert(id, Entry { kind, closed });
        id
    }

    fn listener(&self, id: SocketId) -> Option<(Arc<TcpListener>, watch::Receiver<bool>)> {
        let sockets = self.sockets.lock().unwrap();
        match sockets.get(&id)? {
            Entry {
                kind: Kind::Listener(listener),
                closed,
            } => Some((listener.clone(), closed.subscribe())),
            _ => None,
        }
    }

    fn reserved(&self, id: SocketId) -> Option<watch::Receiver<bool>> {
        let sockets = self.sockets.lock().unwrap();
        match sockets.get(&id)? {
            Entry {
                kind: Kind::Reserved,
                closed,
            } => Some(closed.subscribe()),
            _ => None,
        }
    }

    fn stream(&self, id: SocketId) -> Option<(Arc<TcpStream>, watch::Receiver<bool>)> {
        let sockets = self.sockets.lock().unwrap();
        match sockets.get(&id)? {
            Entry {
                kind: Kind::Connected(stream),
                closed,
            } => Some((stream.clone(), closed.subscribe())),
            _ => None,
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // The last reference may be released on one of the runtime's own threads
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Resolves once `closed` is set (or its sender is gone).
async fn cancelled(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn read(stream: &TcpStream, buffer: &mut Buffer) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buffer.receive_region()) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

/// Read and drop input until the peer closes its side or the connection fails.
async fn discard(stream: &TcpStream) {
    let mut scratch = [0u8; DRAIN_CHUNK];
    loop {
        if stream.readable().await.is_err() {
            return;
        }
        match stream.try_read(&mut scratch) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
}

/// Send FIN to the peer while keeping the read side open.
#[cfg(unix)]
fn shutdown_write(stream: &TcpStream) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is owned by `stream`, which is borrowed for the call
    if unsafe { libc::shutdown(stream.as_raw_fd(), libc::SHUT_WR) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The stream is shut down when it is dropped.
#[cfg(not(unix))]
fn shutdown_write(_: &TcpStream) -> io::Result<()> {
    Ok(())
}

async fn write(stream: &TcpStream, bytes: &[u8]) -> io::Result<usize> {
    loop {
        stream.writable().await?;
        match stream.try_write(bytes) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

fn complete(result: Option<io::Result<usize>>, buffer: Buffer, callback: Callback) {
    let completion = match result {
        None => Completion::failed(Status::Cancelled, Some(buffer)),
        Some(Ok(transferred)) => Completion::new(Status::Success, transferred, Some(buffer)),
        Some(Err(err)) => Completion::failed(Status::from(&err), Some(buffer)),
    };
    callback(completion);
}

impl super::Driver for Driver {
    fn listen(&self, address: SocketAddr) -> Result<(SocketId, SocketAddr), Error> {
        let listener = std::net::TcpListener::bind(address).map_err(|err| {
            warn!(?err, %address, "failed to bind");
            Error::BindFailed
        })?;
        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.handle.enter();
            TcpListener::from_std(listener)?
        };
        let local = listener.local_addr()?;
        let id = self.register(Kind::Listener(Arc::new(listener)));
        debug!(socket = %id, address = %local, "listening");
        Ok((id, local))
    }

    fn open(&self) -> Result<SocketId, Error> {
        Ok(self.register(Kind::Reserved))
    }

    fn accept(&self, listener: SocketId, socket: SocketId, buffer: Buffer, callback: Callback) {
        let Some((acceptor, mut listener_closed)) = self.listener(listener) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        let Some(mut socket_closed) = self.reserved(socket) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        let sockets = self.sockets.clone();
        let tcp_nodelay = self.cfg.tcp_nodelay;
        self.handle.spawn(async move {
            let result = tokio::select! {
                _ = cancelled(&mut listener_closed) => None,
                _ = cancelled(&mut socket_closed) => None,
                result = acceptor.accept() => Some(result),
            };
            let (stream, peer) = match result {
                None => return callback(Completion::failed(Status::Cancelled, Some(buffer))),
                Some(Err(err)) => {
                    return callback(Completion::failed(Status::from(&err), Some(buffer)))
                }
                Some(Ok(accepted)) => accepted,
            };

            // Set TCP_NODELAY if configured
            if let Some(tcp_nodelay) = tcp_nodelay {
                if let Err(err) = stream.set_nodelay(tcp_nodelay) {
                    warn!(?err, "failed to set TCP_NODELAY");
                }
            }

            // The socket may have been closed while we were accepting
            let installed = {
                let mut sockets = sockets.lock().unwrap();
                match sockets.get_mut(&socket) {
                    Some(entry) if matches!(entry.kind, Kind::Reserved) => {
                        entry.kind = Kind::Connected(Arc::new(stream));
                        true
                    }
                    _ => false,
                }
            };
            if !installed {
                return callback(Completion::failed(Status::Cancelled, Some(buffer)));
            }
            callback(Completion::new(Status::Success, 0, Some(buffer)).with_peer(peer));
        });
    }

    fn receive(&self, socket: SocketId, mut buffer: Buffer, callback: Callback) {
        let Some((stream, mut closed)) = self.stream(socket) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        self.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut closed) => None,
                result = read(&stream, &mut buffer) => Some(result),
            };
            complete(result, buffer, callback);
        });
    }

    fn send(&self, socket: SocketId, buffer: Buffer, range: Range<usize>, callback: Callback) {
        let Some((stream, mut closed)) = self.stream(socket) else {
            return callback(Completion::failed(Status::NotSocket, Some(buffer)));
        };
        if range.is_empty() {
            return callback(Completion::new(Status::Success, 0, Some(buffer)));
        }
        self.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut closed) => None,
                result = write(&stream, &buffer.as_slice()[range]) => Some(result),
            };
            complete(result, buffer, callback);
        });
    }

    fn disconnect(&self, socket: SocketId, callback: Callback) {
        let draining = {
            let mut sockets = self.sockets.lock().unwrap();
            match sockets.get_mut(&socket) {
                Some(entry) => match std::mem::replace(&mut entry.kind, Kind::Draining) {
                    Kind::Connected(stream) => {
                        // Cancel pending operations, then watch for a close while draining
                        let (closed, receiver) = watch::channel(false);
                        let _ = std::mem::replace(&mut entry.closed, closed).send(true);
                        Some((stream, receiver))
                    }
                    kind => {
                        entry.kind = kind;
                        None
                    }
                },
                None => None,
            }
        };
        let Some((stream, mut closed)) = draining else {
            return callback(Completion::failed(Status::NotSocket, None));
        };
        let sockets = self.sockets.clone();
        let drain_timeout = self.cfg.drain_timeout;
        self.handle.spawn(async move {
            let status = match shutdown_write(&stream) {
                Err(err) => Status::from(&err),
                Ok(()) => tokio::select! {
                    biased;
                    _ = cancelled(&mut closed) => Status::Cancelled,
                    result = tokio::time::timeout(drain_timeout, discard(&stream)) => {
                        if result.is_err() {
                            debug!(socket = %socket, "peer did not close in time");
                        }
                        Status::Success
                    }
                },
            };
            {
                let mut sockets = sockets.lock().unwrap();
                let draining = matches!(
                    sockets.get(&socket),
                    Some(Entry {
                        kind: Kind::Draining,
                        ..
                    })
                );
                if draining {
                    sockets.remove(&socket);
                }
            }
            drop(stream);
            callback(Completion::new(status, 0, None));
        });
    }

    fn close(&self, socket: SocketId) {
        let entry = self.sockets.lock().unwrap().remove(&socket);
        if let Some(entry) = entry {
            let _ = entry.closed.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{driver::Driver as _, BufferPool};
    use std::{
        io::{Read, Write},
        net::TcpStream as StdStream,
        sync::mpsc,
        thread,
        time::Duration,
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn recorder() -> (Callback, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let callback: Callback = Box::new(move |completion| {
            let _ = tx.send(completion);
        });
        (callback, rx)
    }

    #[test]
    fn test_accept_receive_send() {
        let driver = Driver::new(Config::default()).unwrap();
        let pool = BufferPool::new(3, 64);
        let (listener, address) = driver.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let socket = driver.open().unwrap();

        // Accept a client
        let mut buffer = pool.try_acquire().unwrap();
        buffer.prepare_for_accept();
        let (callback, accepted) = recorder();
        driver.accept(listener, socket, buffer, callback);
        let mut client = StdStream::connect(address).unwrap();
        let completion = accepted.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);
        assert_eq!(completion.peer, Some(client.local_addr().unwrap()));
        pool.release(completion.buffer.unwrap());

        // Receive from the client
        let mut buffer = pool.try_acquire().unwrap();
        buffer.prepare_for_receive();
        let (callback, received) = recorder();
        driver.receive(socket, buffer, callback);
        client.write_all(b"hello").unwrap();
        let completion = received.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);
        assert_eq!(completion.transferred, 5);
        let mut buffer = completion.buffer.unwrap();
        buffer.prepare_for_read(completion.transferred);
        assert_eq!(buffer.as_slice(), b"hello");

        // Send part of the buffer back
        let (callback, sent) = recorder();
        driver.send(socket, buffer, 1..4, callback);
        let completion = sent.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);
        assert_eq!(completion.transferred, 3);
        pool.release(completion.buffer.unwrap());
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ell");

        // Disconnecting delivers EOF to the client and completes once the client closes
        let (callback, disconnected) = recorder();
        driver.disconnect(socket, callback);
        client.set_read_timeout(Some(WAIT)).unwrap();
        assert_eq!(client.read(&mut reply).unwrap(), 0);
        drop(client);
        let completion = disconnected.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);

        driver.close(listener);
    }

    #[test]
    fn test_disconnect_with_unread_input() {
        let driver = Driver::new(Config::default()).unwrap();
        let pool = BufferPool::new(2, 64 * 1024);
        let (listener, address) = driver.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let socket = driver.open().unwrap();

        let (callback, accepted) = recorder();
        driver.accept(listener, socket, pool.try_acquire().unwrap(), callback);
        let mut client = StdStream::connect(address).unwrap();
        let completion = accepted.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);
        pool.release(completion.buffer.unwrap());

        // The client pipelines a byte the server never reads
        client.write_all(b"Z").unwrap();

        // Send a reply, resuming partial sends
        let payload = (0..64 * 1024).map(|i| i as u8).collect::<Vec<_>>();
        let mut buffer = pool.try_acquire().unwrap();
        buffer.prepare_for_write();
        assert_eq!(buffer.write(&payload), payload.len());
        buffer.prepare_for_send();
        let mut offset = 0;
        while offset < payload.len() {
            let (callback, sent) = recorder();
            driver.send(socket, buffer, offset..payload.len(), callback);
            let completion = sent.recv_timeout(WAIT).unwrap();
            assert_eq!(completion.status, Status::Success);
            offset += completion.transferred;
            buffer = completion.buffer.unwrap();
        }
        pool.release(buffer);

        // Everything sent reaches the client, followed by a clean EOF
        let (callback, disconnected) = recorder();
        driver.disconnect(socket, callback);
        thread::sleep(Duration::from_millis(200));
        let mut received = Vec::new();
        client.set_read_timeout(Some(WAIT)).unwrap();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
        drop(client);
        let completion = disconnected.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);

        // The socket is gone
        let (callback, received) = recorder();
        driver.receive(socket, pool.try_acquire().unwrap(), callback);
        let completion = received.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::NotSocket);
    }

    #[test]
    fn test_close_cancels_drain() {
        let driver =
            Driver::new(Config::default().with_drain_timeout(Duration::from_secs(60))).unwrap();
        let pool = BufferPool::new(1, 64);
        let (listener, address) = driver.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let socket = driver.open().unwrap();

        let (callback, accepted) = recorder();
        driver.accept(listener, socket, pool.try_acquire().unwrap(), callback);
        let mut client = StdStream::connect(address).unwrap();
        let completion = accepted.recv_timeout(WAIT).unwrap();
        pool.release(completion.buffer.unwrap());

        // The client never closes, so the disconnect waits until the socket is closed
        let (callback, disconnected) = recorder();
        driver.disconnect(socket, callback);
        let mut eof = [0u8; 1];
        client.set_read_timeout(Some(WAIT)).unwrap();
        assert_eq!(client.read(&mut eof).unwrap(), 0);
        assert!(disconnected.recv_timeout(Duration::from_millis(50)).is_err());
        driver.close(socket);
        let completion = disconnected.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Cancelled);
    }

    #[test]
    fn test_close_cancels_pending_operations() {
        let driver = Driver::new(Config::default()).unwrap();
        let pool = BufferPool::new(2, 64);
        let (listener, address) = driver.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let socket = driver.open().unwrap();

        let (callback, accepted) = recorder();
        driver.accept(listener, socket, pool.try_acquire().unwrap(), callback);
        let _client = StdStream::connect(address).unwrap();
        let completion = accepted.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Success);
        pool.release(completion.buffer.unwrap());

        // Nothing is ever sent, so the receive stays pending until the close
        let mut buffer = pool.try_acquire().unwrap();
        buffer.prepare_for_receive();
        let (callback, received) = recorder();
        driver.receive(socket, buffer, callback);
        assert!(received.recv_timeout(Duration::from_millis(50)).is_err());
        driver.close(socket);
        let completion = received.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Cancelled);
        pool.release(completion.buffer.unwrap());

        // The socket is gone
        let (callback, received) = recorder();
        driver.receive(socket, pool.try_acquire().unwrap(), callback);
        let completion = received.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::NotSocket);
        assert_eq!(pool.available(), 1);
        pool.release(completion.buffer.unwrap());

        // Closing the listener cancels a pending accept
        let socket = driver.open().unwrap();
        let (callback, accepted) = recorder();
        driver.accept(listener, socket, pool.try_acquire().unwrap(), callback);
        driver.close(listener);
        let completion = accepted.recv_timeout(WAIT).unwrap();
        assert_eq!(completion.status, Status::Cancelled);
        assert!(completion.buffer.is_some());
    }

    #[test]
    fn test_invalid_config() {
        let cfg = Config::default().with_threads(0);
        assert!(matches!(Driver::new(cfg), Err(Error::InvalidConfig(_))));
    }
}
