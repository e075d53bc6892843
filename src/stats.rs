//! Minimal counters and gauges used for per-connection buffer accounting.
//!
//! Stats are cheap to clone and share an atomic cell, so a connection can
//! update them on its dispatcher thread while another thread reads them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that can move up and down.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn sub(&self, amount: u64) {
        let previous = self.0.fetch_sub(amount, Ordering::Relaxed);
        debug_assert!(previous >= amount, "gauge underflow");
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stats a connection keeps about its read and write buffers.
///
/// Set once per connection with
/// [`Connection::set_connection_stats`](crate::Connection::set_connection_stats).
/// The gauges are returned to zero when the connection closes.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub read_total: Counter,
    pub read_current: Gauge,
    pub write_total: Counter,
    pub write_current: Gauge,
    /// Bind errors are only tracked when this is present.
    pub bind_errors: Option<Counter>,
}

/// Applies a buffer change to a total counter and a current-size gauge.
///
/// `delta` is the number of bytes moved by the I/O call and is added to
/// `stat_total`. `new_total` is the buffer length after the call; the gauge is
/// moved by the difference from `previous_total`, which is then updated.
/// Neither stat is touched when its input did not change.
pub fn update_buffer_stats(
    delta: u64,
    new_total: u64,
    previous_total: &mut u64,
    stat_total: &Counter,
    stat_current: &Gauge,
) {
    if delta != 0 {
        stat_total.add(delta);
    }

    if new_total != *previous_total {
        if new_total > *previous_total {
            stat_current.add(new_total - *previous_total);
        } else {
            stat_current.sub(*previous_total - new_total);
        }
        *previous_total = new_total;
    }
}
