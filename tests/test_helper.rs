#![allow(dead_code)]

use proxycore::prelude::*;
use proxycore::WatermarkBuffer;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

const RUN_UNTIL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test --test connection -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("proxycore={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Dispatcher Helpers
// ============================================================================

pub fn empty_config() -> config::Config {
    config::Config::builder().build().unwrap()
}

pub fn new_dispatcher() -> Dispatcher {
    init_tracing();
    Dispatcher::new(&empty_config()).expect("Failed to create dispatcher")
}

/// Runs single loop iterations until `done` returns true. Panics after a few
/// seconds.
pub fn run_until(dispatcher: &Dispatcher, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + RUN_UNTIL_TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "Timed out waiting for condition");
        dispatcher.run(RunType::NonBlock).unwrap();
    }
}

/// Runs `iterations` single loop iterations.
pub fn run_iterations(dispatcher: &Dispatcher, iterations: usize) {
    for _ in 0..iterations {
        dispatcher.run(RunType::NonBlock).unwrap();
    }
}

// ============================================================================
// Connection Callbacks
// ============================================================================

#[derive(Debug, Default)]
pub struct Recorded {
    pub events: Vec<ConnectionEvent>,
    pub states: Vec<State>,
    pub above_high_watermark: usize,
    pub below_low_watermark: usize,
}

impl Recorded {
    pub fn closed(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose))
    }

    pub fn connected(&self) -> bool {
        self.events.contains(&ConnectionEvent::Connected)
    }
}

/// Records every callback into a shared [`Recorded`].
pub struct RecordingCallbacks(pub Rc<RefCell<Recorded>>);

impl RecordingCallbacks {
    pub fn new() -> (Box<Self>, Rc<RefCell<Recorded>>) {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        (Box::new(Self(recorded.clone())), recorded)
    }
}

impl ConnectionCallbacks for RecordingCallbacks {
    fn on_event(&mut self, connection: &mut dyn Connection, event: ConnectionEvent) {
        let mut recorded = self.0.borrow_mut();
        recorded.events.push(event);
        recorded.states.push(connection.state());
    }

    fn on_above_write_buffer_high_watermark(&mut self, _connection: &mut dyn Connection) {
        self.0.borrow_mut().above_high_watermark += 1;
    }

    fn on_below_write_buffer_low_watermark(&mut self, _connection: &mut dyn Connection) {
        self.0.borrow_mut().below_low_watermark += 1;
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Writes everything it reads back to the peer.
pub struct EchoFilter;

impl ReadFilter for EchoFilter {
    fn on_data(
        &mut self,
        connection: &mut dyn Connection,
        data: &mut dyn Buffer,
        end_stream: bool,
    ) -> FilterStatus {
        let half_close = connection.is_half_close_enabled();
        connection.write(data, end_stream && half_close);
        FilterStatus::StopIteration
    }
}

#[derive(Debug, Default)]
pub struct Received {
    pub data: Vec<u8>,
    pub end_stream: bool,
    pub calls: usize,
}

/// Drains and keeps everything it reads.
pub struct CollectFilter(pub Rc<RefCell<Received>>);

impl CollectFilter {
    pub fn new() -> (Box<Self>, Rc<RefCell<Received>>) {
        let received = Rc::new(RefCell::new(Received::default()));
        (Box::new(Self(received.clone())), received)
    }
}

impl ReadFilter for CollectFilter {
    fn on_data(
        &mut self,
        _connection: &mut dyn Connection,
        data: &mut dyn Buffer,
        end_stream: bool,
    ) -> FilterStatus {
        let mut received = self.0.borrow_mut();
        received.data.extend_from_slice(data.as_slice());
        received.end_stream |= end_stream;
        received.calls += 1;
        let len = data.len();
        data.drain(len);
        FilterStatus::Continue
    }
}

/// Installs an [`EchoFilter`] on every connection.
pub struct EchoFilterChainFactory;

impl FilterChainFactory for EchoFilterChainFactory {
    fn create_network_filter_chain(&self, connection: &mut dyn Connection) -> bool {
        connection.add_read_filter(Box::new(EchoFilter));
        true
    }
}

/// Installs no filters, so connections are refused.
pub struct EmptyFilterChainFactory;

impl FilterChainFactory for EmptyFilterChainFactory {
    fn create_network_filter_chain(&self, _connection: &mut dyn Connection) -> bool {
        true
    }
}

pub fn buffer_of(data: &[u8]) -> OwnedBuffer {
    OwnedBuffer::from(data)
}

pub fn watermark_buffer(low: usize, high: usize) -> WatermarkBuffer {
    WatermarkBuffer::with_watermarks(low, high)
}
