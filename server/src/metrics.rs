use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Reason a protocol round was abandoned.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Fault {
    pub reason: &'static str,
}

impl Fault {
    pub const ERROR: Self = Self { reason: "error" };
    pub const PANIC: Self = Self { reason: "panic" };
    pub const STALL: Self = Self { reason: "stall" };
    pub const STREAM: Self = Self { reason: "stream" };
}

#[derive(Clone, Default)]
pub struct Metrics {
    pub connections_accepted: Counter,
    pub connections_closed: Counter,
    pub connections_active: Gauge,
    pub protocol_faults: Family<Fault, Counter>,
    pub buffer_timeouts: Counter,
    pub bytes_received: Counter,
    pub bytes_sent: Counter,
    pub partial_sends: Counter,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "connections_accepted",
            "Number of connections accepted",
            metrics.connections_accepted.clone(),
        );
        registry.register(
            "connections_closed",
            "Number of accepted connections that have been closed",
            metrics.connections_closed.clone(),
        );
        registry.register(
            "connections_active",
            "Number of connections currently open",
            metrics.connections_active.clone(),
        );
        registry.register(
            "protocol_faults",
            "Number of protocol rounds abandoned because of a fault",
            metrics.protocol_faults.clone(),
        );
        registry.register(
            "buffer_timeouts",
            "Number of waits for a buffer or for peer data that timed out",
            metrics.buffer_timeouts.clone(),
        );
        registry.register(
            "bytes_received",
            "Number of bytes received from peers",
            metrics.bytes_received.clone(),
        );
        registry.register(
            "bytes_sent",
            "Number of bytes sent to peers",
            metrics.bytes_sent.clone(),
        );
        registry.register(
            "partial_sends",
            "Number of sends that transferred only part of their buffer",
            metrics.partial_sends.clone(),
        );
        metrics
    }
}
