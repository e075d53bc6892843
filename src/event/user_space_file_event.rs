use super::{Dispatcher, FileEvent, FileReadyCb, Ready, Timer};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::trace;

struct UserSpaceEventState {
    enabled: Cell<Ready>,
    pending: Cell<Ready>,
    io_timer: Timer,
    cb: RefCell<FileReadyCb>,
    readiness: Box<dyn Fn() -> Ready>,
}

/// A file event for an I/O source that has no kernel descriptor.
///
/// Readiness is pushed in by the source through [`FileEvent::activate`] and
/// delivered from a zero-delay timer on the next loop iteration, so the
/// callback sees the same edge-triggered contract as a socket. When the
/// enabled set changes, `readiness` is consulted and whatever the source can
/// already do is reported again.
pub struct UserSpaceFileEvent {
    state: Rc<UserSpaceEventState>,
}

/// A non-owning handle a user space source keeps to wake its file event.
#[derive(Clone)]
pub(crate) struct UserSpaceFileEventRef(Weak<UserSpaceEventState>);

impl UserSpaceFileEvent {
    pub fn new(
        dispatcher: &Dispatcher,
        cb: FileReadyCb,
        events: Ready,
        readiness: Box<dyn Fn() -> Ready>,
    ) -> Self {
        let state = Rc::new_cyclic(|weak: &Weak<UserSpaceEventState>| {
            let weak = weak.clone();
            let io_timer = dispatcher.create_timer(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.on_io_timer();
                }
            }));
            UserSpaceEventState {
                enabled: Cell::new(Ready::EMPTY),
                pending: Cell::new(Ready::EMPTY),
                io_timer,
                cb: RefCell::new(cb),
                readiness,
            }
        });
        state.set_enabled(events);
        Self { state }
    }

    pub(crate) fn downgrade(&self) -> UserSpaceFileEventRef {
        UserSpaceFileEventRef(Rc::downgrade(&self.state))
    }
}

impl UserSpaceFileEventRef {
    pub(crate) fn activate(&self, events: Ready) {
        if let Some(state) = self.0.upgrade() {
            state.activate(events);
        }
    }
}

impl UserSpaceEventState {
    fn activate(&self, events: Ready) {
        self.pending.set(self.pending.get() | events);
        self.schedule_next_event();
    }

    fn set_enabled(&self, events: Ready) {
        self.enabled.set(events);
        let current = (self.readiness)() & events;
        if !current.is_empty() {
            self.activate(current);
        }
    }

    fn schedule_next_event(&self) {
        if !self.io_timer.enabled() {
            self.io_timer.enable(Duration::ZERO);
        }
    }

    fn on_io_timer(&self) {
        let pending = self.pending.replace(Ready::EMPTY);
        let enabled = self.enabled.get();
        let mut events = pending & enabled & (Ready::READ | Ready::WRITE);
        if enabled.contains(Ready::CLOSED)
            && !enabled.contains(Ready::READ)
            && pending.contains(Ready::CLOSED)
        {
            events |= Ready::CLOSED;
        }
        if events.is_empty() {
            return;
        }
        trace!(?events, "User space file event ready");
        (self.cb.borrow_mut())(events);
    }
}

impl FileEvent for UserSpaceFileEvent {
    fn activate(&self, events: Ready) {
        self.state.activate(events)
    }

    fn set_enabled(&self, events: Ready) {
        self.state.set_enabled(events)
    }
}
