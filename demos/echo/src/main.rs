//! Serve the length-prefixed echo protocol.
//!
//! Every frame (a 4-byte big-endian length followed by its payload) sent to the server is
//! returned unchanged. A zero-length frame closes the connection. On Ctrl-C, the server
//! stops accepting connections, waits for every handler to retire, and prints its metrics.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin overlap-echo -- --address 127.0.0.1:4000 --capacity 128
//! ```
//!
//! On Linux, the io_uring driver can be used instead of the tokio driver:
//!
//! ```sh
//! cargo run --release --bin overlap-echo --features iouring -- --address 127.0.0.1:4000
//! ```

use clap::{value_parser, Arg, ArgMatches, Command};
use overlap_server::{
    echo::Echo,
    executor::create_pool,
    Config, Driver, Executor, Listener,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use tracing::{info, warn, Level};

/// Maximum time to wait for handlers to retire after stopping.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    // Parse arguments
    let matches = Command::new("overlap-echo")
        .about("serve the length-prefixed echo protocol")
        .arg(
            Arg::new("address")
                .long("address")
                .default_value("127.0.0.1:4000")
                .value_parser(value_parser!(SocketAddr))
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(usize))
                .help("Number of worker threads (at least 2)"),
        )
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .value_parser(value_parser!(usize))
                .help("Maximum number of concurrent connections"),
        )
        .arg(
            Arg::new("receive-buffers")
                .long("receive-buffers")
                .value_parser(value_parser!(usize))
                .help("Receive buffers per connection"),
        )
        .arg(
            Arg::new("send-buffers")
                .long("send-buffers")
                .value_parser(value_parser!(usize))
                .help("Send buffers per connection"),
        )
        .arg(
            Arg::new("buffer-size")
                .long("buffer-size")
                .value_parser(value_parser!(usize))
                .help("Size of every buffer (in bytes)"),
        )
        .arg(
            Arg::new("acquire-timeout")
                .long("acquire-timeout")
                .value_parser(value_parser!(u64))
                .help("Maximum wait for a free buffer (in milliseconds)"),
        )
        .arg(
            Arg::new("receive-timeout")
                .long("receive-timeout")
                .value_parser(value_parser!(u64))
                .help("Maximum wait for more data mid-request (in milliseconds)"),
        )
        .arg(
            Arg::new("max-frame")
                .long("max-frame")
                .default_value("1048576")
                .value_parser(value_parser!(usize))
                .help("Largest frame payload accepted (in bytes)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level)),
        )
        .get_matches();

    // Create logger
    let level = *matches.get_one::<Level>("log-level").unwrap();
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure server
    let registry = Arc::new(Mutex::new(Registry::default()));
    let address = *matches.get_one::<SocketAddr>("address").unwrap();
    let cfg = configure(&matches, Config::recommended(registry, address));
    let max_frame = *matches.get_one::<usize>("max-frame").unwrap();
    info!(
        %address,
        workers = cfg.workers,
        capacity = cfg.capacity,
        buffer_size = cfg.buffer_size,
        max_frame,
        "loaded config"
    );

    // Create workers
    let executor = Arc::new(create_pool(cfg.workers).expect("Could not create worker pool"));

    // Serve until interrupted
    run(cfg, executor, max_frame);
}

/// Apply every config flag that was provided.
fn configure(matches: &ArgMatches, mut cfg: Config) -> Config {
    if let Some(workers) = matches.get_one::<usize>("workers") {
        cfg.workers = *workers;
    }
    if let Some(capacity) = matches.get_one::<usize>("capacity") {
        cfg.capacity = *capacity;
    }
    if let Some(receive_buffers) = matches.get_one::<usize>("receive-buffers") {
        cfg.receive_buffers = *receive_buffers;
    }
    if let Some(send_buffers) = matches.get_one::<usize>("send-buffers") {
        cfg.send_buffers = *send_buffers;
    }
    if let Some(buffer_size) = matches.get_one::<usize>("buffer-size") {
        cfg.buffer_size = *buffer_size;
    }
    if let Some(timeout) = matches.get_one::<u64>("acquire-timeout") {
        cfg.acquire_timeout = Duration::from_millis(*timeout);
    }
    if let Some(timeout) = matches.get_one::<u64>("receive-timeout") {
        cfg.receive_timeout = Duration::from_millis(*timeout);
    }
    cfg
}

#[cfg(not(all(feature = "iouring", target_os = "linux")))]
fn run(cfg: Config, executor: Arc<dyn Executor>, max_frame: usize) {
    use overlap_server::driver::tokio;
    let driver = tokio::Driver::new(tokio::Config::default()).expect("Could not create driver");
    serve(cfg, Arc::new(driver), executor, max_frame);
}

#[cfg(all(feature = "iouring", target_os = "linux"))]
fn run(cfg: Config, executor: Arc<dyn Executor>, max_frame: usize) {
    use overlap_server::driver::iouring;
    let driver = iouring::Driver::new(iouring::Config::default()).expect("Could not create driver");
    serve(cfg, Arc::new(driver), executor, max_frame);
}

fn serve<D: Driver>(cfg: Config, driver: Arc<D>, executor: Arc<dyn Executor>, max_frame: usize) {
    // Start listener
    let registry = cfg.registry.clone();
    let listener = Listener::new(cfg, driver, executor, move || Echo::new(max_frame))
        .expect("Could not create listener");
    let address = listener.start().expect("Could not start listener");
    info!(%address, "serving echo");

    // Wait for Ctrl-C
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Could not create signal runtime");
    runtime
        .block_on(tokio::signal::ctrl_c())
        .expect("Could not wait for Ctrl-C");

    // Stop and wait for handlers to retire
    info!("shutting down");
    listener.stop();
    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    while listener.handlers() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let remaining = listener.handlers();
    if remaining > 0 {
        warn!(remaining, "handlers did not retire in time");
    }

    // Print metrics
    let mut buffer = String::new();
    encode(&mut buffer, &registry.lock().unwrap()).expect("Could not encode metrics");
    println!("{buffer}");
}
