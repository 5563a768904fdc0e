//! Serve request/reply protocols over a completion-driven TCP engine.
//!
//! This crate accepts inbound connections, drives receive and send operations through
//! a shared pool of worker threads, and multiplexes a pluggable [Protocol] over the
//! resulting byte stream. All buffer memory is pre-allocated in bounded per-connection
//! pools and recycled, so no worker ever blocks on I/O (only, with a timeout, on buffer
//! exhaustion).
//!
//! # Terminology
//!
//! The engine is split between a [driver::Driver], which submits operations to the
//! operating system and reports their completion, and an [executor::Executor], which
//! runs the work each completion triggers. A [listener::Listener] owns a fixed number of
//! [handler::Handler]s, each of which pairs one accepted socket with one [Protocol]
//! instance and advances a small state machine ([state::State]) as completions arrive.
//!
//! # Drivers
//!
//! For production use, the `tokio` driver emulates completions on top of a tokio
//! runtime. On Linux, the `iouring` feature enables a driver backed by a completion ring.
//! For testing, the `deterministic` module provides a scripted driver and a
//! single-threaded executor that allow every interleaving to be reproduced exactly.
//!
//! # Status
//!
//! `overlap-server` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use std::io::{Read, Write};
use thiserror::Error;

pub mod buffer;
pub mod config;
pub mod deterministic;
pub mod driver;
pub mod echo;
pub mod executor;
pub mod handler;
pub mod listener;
mod metrics;
pub mod pool;
pub mod queue;
pub mod state;
pub mod stream;
mod sync;

pub use buffer::Buffer;
pub use config::Config;
pub use driver::{Completion, Driver, SocketId, Status};
pub use executor::Executor;
pub use handler::Handler;
pub use listener::Listener;
pub use pool::BufferPool;
pub use state::State;
pub use stream::BufferedStream;

/// Errors that can occur when interacting with the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timeout")]
    Timeout,
    #[error("closed")]
    Closed,
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error("bind failed")]
    BindFailed,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown socket: {0}")]
    UnknownSocket(SocketId),
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome of a single [Protocol::process] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep reading from the connection.
    Continue,
    /// Close the connection once all queued output has been transmitted.
    Close,
}

/// Interface that any request/reply interpreter must implement to be served
/// by a [Listener].
///
/// Each connection owns its own instance (created by the listener's factory), so
/// implementations may keep per-connection state between calls.
pub trait Protocol: Send + 'static {
    /// Error surfaced when the input cannot be interpreted.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Consume zero or more records from `stream` and append zero or more replies to it.
    ///
    /// Reads past the end of the currently received data transparently wait for more
    /// data from the peer. A short read means the peer has closed the connection.
    ///
    /// Returning an error (or panicking) is treated as a protocol fault: the connection
    /// stops reading, flushes any queued output, and disconnects.
    fn process<S: Read + Write>(&mut self, stream: &mut S) -> Result<Verdict, Self::Error>;
}
