use crate::Error;
use prometheus_client::registry::Registry;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for a [crate::Listener].
#[derive(Clone)]
pub struct Config {
    /// Registry for prometheus metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Address to listen on.
    pub address: SocketAddr,

    /// Number of worker threads that process completions.
    ///
    /// Only consulted when the worker pool is created from this configuration
    /// (see [crate::executor::create_pool]).
    pub workers: usize,

    /// Number of connection handlers (and so the maximum number of concurrent connections).
    ///
    /// Every handler that is not serving a connection has an accept pending, so this is
    /// also the depth of the accept backlog.
    pub capacity: usize,

    /// Number of receive buffers owned by each connection.
    pub receive_buffers: usize,

    /// Number of send buffers owned by each connection.
    ///
    /// A reply larger than `send_buffers * buffer_size` can only be produced as fast as
    /// the peer drains it.
    pub send_buffers: usize,

    /// Size of every buffer.
    pub buffer_size: usize,

    /// Maximum time to wait for a free buffer before treating the connection as faulted.
    pub acquire_timeout: Duration,

    /// Maximum time a protocol read may wait for more data from the peer.
    pub receive_timeout: Duration,
}

impl Config {
    /// Generates a configuration with reasonable defaults for usage in production.
    pub fn recommended(registry: Arc<Mutex<Registry>>, address: SocketAddr) -> Self {
        Self {
            registry,
            address,

            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2),
            capacity: 1_024,
            receive_buffers: 2,
            send_buffers: 2,
            buffer_size: 64 * 1024, // 64 KB
            acquire_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    pub fn test(registry: Arc<Mutex<Registry>>) -> Self {
        Self {
            registry,
            address: SocketAddr::from(([127, 0, 0, 1], 0)),

            workers: 2,
            capacity: 3,
            receive_buffers: 2,
            send_buffers: 2,
            buffer_size: 16,
            acquire_timeout: Duration::from_millis(200),
            receive_timeout: Duration::from_millis(200),
        }
    }

    /// Ensure every parameter is usable.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: &str| Err(Error::InvalidConfig(reason.into()));
        if self.workers < 2 {
            return invalid("workers must be at least 2");
        }
        if self.capacity == 0 {
            return invalid("capacity must be non-zero");
        }
        if self.receive_buffers == 0 || self.send_buffers == 0 {
            return invalid("buffer pools must be non-empty");
        }
        if self.buffer_size == 0 {
            return invalid("buffer_size must be non-zero");
        }
        if self.acquire_timeout.is_zero() || self.receive_timeout.is_zero() {
            return invalid("timeouts must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_is_valid() {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let cfg = Config::recommended(registry, "0.0.0.0:4000".parse().unwrap());
        cfg.validate().unwrap();
        assert!(cfg.workers >= 2);
    }

    #[test]
    fn test_rejects_zero_values() {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let base = Config::test(registry);
        base.validate().unwrap();

        let mut cfg = base.clone();
        cfg.capacity = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = base.clone();
        cfg.send_buffers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.buffer_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.receive_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
