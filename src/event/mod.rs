//! Single-threaded event loop: readiness notifications, timers, deferred
//! deletion and cross-thread posting.

mod dispatcher;
mod file_event;
mod timer;
mod user_space_file_event;

pub use dispatcher::{ConnectionIds, Dispatcher, PipeFactory, PostCb, PostHandle, RunType};
pub use file_event::{FileEvent, FileReadyCb};
pub use timer::Timer;
pub use user_space_file_event::UserSpaceFileEvent;

pub(crate) use user_space_file_event::UserSpaceFileEventRef;

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// A set of readiness bits delivered to file event callbacks.
///
/// `CLOSED` signals that the remote end closed. It is only delivered when
/// `READ` is not enabled; a reader learns about the close by reading end of
/// stream instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READ: Ready = Ready(0b001);
    pub const WRITE: Ready = Ready(0b010);
    pub const CLOSED: Ready = Ready(0b100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit in `other` is set.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    /// Returns true if any bit in `other` is set.
    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl BitAndAssign for Ready {
    fn bitand_assign(&mut self, rhs: Ready) {
        self.0 &= rhs.0;
    }
}

impl Not for Ready {
    type Output = Ready;

    fn not(self) -> Ready {
        Ready(!self.0 & 0b111)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("EMPTY");
        }
        let mut first = true;
        for (bit, name) in [
            (Ready::READ, "READ"),
            (Ready::WRITE, "WRITE"),
            (Ready::CLOSED, "CLOSED"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
