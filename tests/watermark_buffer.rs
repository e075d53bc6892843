//! WatermarkBuffer Tests

use proptest::prelude::*;
use proxycore::{Buffer, OwnedBuffer, WatermarkBuffer, WatermarkEvent};

#[test]
fn high_watermark_fires_at_threshold() {
    let mut buffer = WatermarkBuffer::with_watermarks(5, 10);

    buffer.add(&[0; 9]);
    assert!(buffer.take_watermark_events().is_empty());
    assert!(!buffer.above_high_watermark());

    buffer.add(&[0; 1]);
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::AboveHigh]);
    assert!(buffer.above_high_watermark());

    // Growing further does not fire again.
    buffer.add(&[0; 100]);
    assert!(buffer.take_watermark_events().is_empty());
}

#[test]
fn low_watermark_fires_only_after_high() {
    let mut buffer = WatermarkBuffer::with_watermarks(5, 10);

    buffer.add(&[0; 8]);
    buffer.drain(8);
    assert!(buffer.take_watermark_events().is_empty());

    buffer.add(&[0; 12]);
    buffer.drain(6);
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::AboveHigh]);
    buffer.drain(1);
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::BelowLow]);
    assert!(!buffer.above_high_watermark());

    buffer.drain(5);
    assert!(buffer.take_watermark_events().is_empty());
}

#[test]
fn move_and_take_check_watermarks() {
    let mut buffer = WatermarkBuffer::with_watermarks(2, 4);
    let mut source = OwnedBuffer::from("hello");

    buffer.move_from(&mut source);
    assert!(source.is_empty());
    assert_eq!(buffer.as_slice(), b"hello");
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::AboveHigh]);

    let data = buffer.take();
    assert_eq!(&data[..], b"hello");
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::BelowLow]);
}

#[test]
fn set_watermarks_reevaluates_current_length() {
    let mut buffer = WatermarkBuffer::new();
    buffer.add(&[0; 20]);
    assert!(buffer.take_watermark_events().is_empty());

    buffer.set_watermarks(10);
    assert_eq!(buffer.low_watermark(), 5);
    assert_eq!(buffer.high_watermark(), 10);
    assert_eq!(buffer.take_watermark_events(), vec![WatermarkEvent::AboveHigh]);
}

#[test]
fn zero_high_watermark_disables_tracking() {
    let mut buffer = WatermarkBuffer::new();
    buffer.add(&[0; 1 << 16]);
    buffer.drain(1 << 16);
    assert!(buffer.take_watermark_events().is_empty());
}

#[test]
fn reserve_commit_counts_only_committed_bytes() {
    let mut buffer = WatermarkBuffer::with_watermarks(2, 4);
    let slice = buffer.reserve(16);
    slice[..3].copy_from_slice(b"abc");
    buffer.commit(3);

    assert_eq!(buffer.as_slice(), b"abc");
    assert!(buffer.take_watermark_events().is_empty());
}

#[test]
#[should_panic]
fn low_watermark_must_be_below_high() {
    WatermarkBuffer::with_watermarks(10, 10);
}

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Drain(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(1usize..64).prop_map(Op::Add), (1usize..64).prop_map(Op::Drain)]
}

proptest! {
    #[test]
    fn crossings_alternate_and_balance(
        ops in prop::collection::vec(op(), 0..200),
        high in 2usize..128,
    ) {
        let mut buffer = WatermarkBuffer::new();
        buffer.set_watermarks(high);
        let mut events = Vec::new();

        for op in ops {
            match op {
                Op::Add(n) => buffer.add(&vec![0; n]),
                Op::Drain(n) => {
                    let n = n.min(buffer.len());
                    buffer.drain(n);
                }
            }
            events.extend(buffer.take_watermark_events());
        }
        let remaining = buffer.len();
        buffer.drain(remaining);
        events.extend(buffer.take_watermark_events());

        for pair in events.windows(2) {
            prop_assert_ne!(pair[0], pair[1]);
        }
        let above = events.iter().filter(|e| **e == WatermarkEvent::AboveHigh).count();
        let below = events.len() - above;
        prop_assert_eq!(above, below);
        prop_assert!(!buffer.above_high_watermark());
    }
}
