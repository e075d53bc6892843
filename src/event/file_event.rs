use super::dispatcher::DispatcherInner;
use super::Ready;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Callback invoked with the readiness bits of a file event.
pub type FileReadyCb = Box<dyn FnMut(Ready)>;

/// A registration for readiness notifications on an I/O source.
///
/// Notifications are edge triggered: a callback is invoked once per change in
/// readiness and the consumer must read or write until it would block before
/// another notification arrives. Dropping the event removes the registration.
pub trait FileEvent {
    /// Injects `events` so the callback sees them on the next loop iteration,
    /// whether or not the source is actually ready.
    fn activate(&self, events: Ready);

    /// Replaces the set of readiness bits the callback is interested in.
    fn set_enabled(&self, events: Ready);
}

// Shared between the public handle and the dispatcher's token map.
pub(super) struct SocketEventState {
    fd: RawFd,
    token: Token,
    enabled: Cell<Ready>,
    registered: Cell<bool>,
    injected: Cell<Ready>,
    cb: RefCell<FileReadyCb>,
    dispatcher: Weak<DispatcherInner>,
}

/// Readiness notifications for a kernel file descriptor, driven by `mio`.
pub(crate) struct SocketFileEvent {
    state: Rc<SocketEventState>,
}

// ============================================================================
// Constructors
// ============================================================================

impl SocketFileEvent {
    pub(super) fn new(
        dispatcher: &Rc<DispatcherInner>,
        fd: RawFd,
        token: Token,
        cb: FileReadyCb,
        events: Ready,
    ) -> Self {
        let state = Rc::new(SocketEventState {
            fd,
            token,
            enabled: Cell::new(Ready::EMPTY),
            registered: Cell::new(false),
            injected: Cell::new(Ready::EMPTY),
            cb: RefCell::new(cb),
            dispatcher: Rc::downgrade(dispatcher),
        });
        dispatcher
            .file_events
            .borrow_mut()
            .insert(token, Rc::downgrade(&state));
        state.set_enabled(events);
        trace!(fd, token = token.0, ?events, "Created file event");
        Self { state }
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl SocketEventState {
    pub(super) fn set_enabled(&self, events: Ready) {
        self.enabled.set(events);
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        let registry = &dispatcher.registry;
        let mut source = SourceFd(&self.fd);

        // A reregister reports the current readiness again, which is what a
        // caller re-enabling reads relies on.
        match (interest_for(events), self.registered.get()) {
            (Some(interest), false) => {
                registry
                    .register(&mut source, self.token, interest)
                    .expect("Failed to register file event");
                self.registered.set(true);
            }
            (Some(interest), true) => {
                registry
                    .reregister(&mut source, self.token, interest)
                    .expect("Failed to reregister file event");
            }
            (None, true) => {
                registry
                    .deregister(&mut source)
                    .expect("Failed to deregister file event");
                self.registered.set(false);
            }
            (None, false) => {}
        }
    }

    pub(super) fn activate(&self, events: Ready) {
        let previous = self.injected.replace(self.injected.get() | events);
        if !previous.is_empty() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.activated.borrow_mut().push(self.token);
        }
    }

    pub(super) fn take_injected(&self) -> Ready {
        self.injected.replace(Ready::EMPTY)
    }

    /// Translates a poll event into the readiness bits the callback asked for.
    pub(super) fn translate(&self, event: &Event) -> Ready {
        let enabled = self.enabled.get();
        let closed = event.is_read_closed() || event.is_error();
        let mut ready = Ready::EMPTY;

        if enabled.contains(Ready::READ) && (event.is_readable() || closed) {
            ready |= Ready::READ;
        }
        if enabled.contains(Ready::CLOSED) && !enabled.contains(Ready::READ) && closed {
            ready |= Ready::CLOSED;
        }
        if enabled.contains(Ready::WRITE)
            && (event.is_writable() || event.is_write_closed() || event.is_error())
        {
            ready |= Ready::WRITE;
        }
        ready
    }

    pub(super) fn fire(&self, events: Ready) {
        trace!(fd = self.fd, ?events, "File event ready");
        (self.cb.borrow_mut())(events);
    }
}

// ============================================================================
// FileEvent Trait Implementation
// ============================================================================

impl FileEvent for SocketFileEvent {
    fn activate(&self, events: Ready) {
        self.state.activate(events)
    }

    fn set_enabled(&self, events: Ready) {
        self.state.set_enabled(events)
    }
}

impl Drop for SocketFileEvent {
    fn drop(&mut self) {
        let Some(dispatcher) = self.state.dispatcher.upgrade() else {
            return;
        };
        dispatcher.file_events.borrow_mut().remove(&self.state.token);
        if self.state.registered.replace(false) {
            // The descriptor may already be gone if the owner closed it first.
            if let Err(err) = dispatcher
                .registry
                .deregister(&mut SourceFd(&self.state.fd))
            {
                debug!(fd = self.state.fd, ?err, "Failed to deregister file event");
            }
        }
    }
}

fn interest_for(events: Ready) -> Option<Interest> {
    let readable = events.intersects(Ready::READ | Ready::CLOSED);
    let writable = events.contains(Ready::WRITE);
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
