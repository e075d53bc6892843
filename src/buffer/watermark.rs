use super::{Buffer, OwnedBuffer};
use bytes::BytesMut;

/// A watermark crossing recorded by a [`WatermarkBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    /// The buffer grew to its high watermark from below it.
    AboveHigh,
    /// The buffer shrank to its low watermark after being above the high
    /// watermark.
    BelowLow,
}

/// A [`Buffer`] that records high and low watermark crossings.
///
/// The buffer is above its high watermark once its length reaches the high
/// watermark, and stays there until its length falls to the low watermark or
/// below. Each crossing is recorded exactly once; the owner collects them with
/// [`WatermarkBuffer::take_watermark_events`] after mutating the buffer and
/// reacts outside of the buffer. A high watermark of zero disables tracking.
#[derive(Debug, Default)]
pub struct WatermarkBuffer {
    buffer: OwnedBuffer,
    low_watermark: usize,
    high_watermark: usize,
    above_high_watermark: bool,
    events: Vec<WatermarkEvent>,
}

// ============================================================================
// Constructors
// ============================================================================

impl WatermarkBuffer {
    /// Creates an empty buffer with watermarks disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with the given watermarks.
    pub fn with_watermarks(low_watermark: usize, high_watermark: usize) -> Self {
        let mut buffer = Self::new();
        buffer.set_low_and_high_watermarks(low_watermark, high_watermark);
        buffer
    }
}

// ============================================================================
// Watermark Management
// ============================================================================

impl WatermarkBuffer {
    /// Sets the high watermark, with the low watermark at half of it.
    pub fn set_watermarks(&mut self, high_watermark: usize) {
        self.set_low_and_high_watermarks(high_watermark / 2, high_watermark);
    }

    /// Sets both watermarks and re-evaluates the current length against them.
    ///
    /// # Panics
    ///
    /// Panics unless `low_watermark < high_watermark`, or both are zero.
    pub fn set_low_and_high_watermarks(&mut self, low_watermark: usize, high_watermark: usize) {
        assert!(
            low_watermark < high_watermark || (low_watermark == 0 && high_watermark == 0),
            "low watermark {low_watermark} must be below high watermark {high_watermark}"
        );
        self.low_watermark = low_watermark;
        self.high_watermark = high_watermark;
        self.check_high_watermark();
        self.check_low_watermark();
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn above_high_watermark(&self) -> bool {
        self.above_high_watermark
    }

    /// Returns the crossings recorded since the last call, oldest first.
    pub fn take_watermark_events(&mut self) -> Vec<WatermarkEvent> {
        std::mem::take(&mut self.events)
    }

    fn check_high_watermark(&mut self) {
        if self.above_high_watermark
            || self.high_watermark == 0
            || self.buffer.len() < self.high_watermark
        {
            return;
        }
        self.above_high_watermark = true;
        self.events.push(WatermarkEvent::AboveHigh);
    }

    fn check_low_watermark(&mut self) {
        if !self.above_high_watermark || self.buffer.len() > self.low_watermark {
            return;
        }
        self.above_high_watermark = false;
        self.events.push(WatermarkEvent::BelowLow);
    }
}

// ============================================================================
// Buffer Trait Implementation
// ============================================================================

impl Buffer for WatermarkBuffer {
    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    fn add(&mut self, data: &[u8]) {
        self.buffer.add(data);
        self.check_high_watermark();
    }

    fn drain(&mut self, size: usize) {
        self.buffer.drain(size);
        self.check_low_watermark();
    }

    fn take(&mut self) -> BytesMut {
        let data = self.buffer.take();
        self.check_low_watermark();
        data
    }

    fn append(&mut self, data: BytesMut) {
        self.buffer.append(data);
        self.check_high_watermark();
    }

    fn reserve(&mut self, len: usize) -> &mut [u8] {
        self.buffer.reserve(len)
    }

    fn commit(&mut self, used: usize) {
        self.buffer.commit(used);
        self.check_high_watermark();
    }
}
