use super::dispatcher::DispatcherInner;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

pub(super) type TimerKey = (Instant, u64);

pub(super) struct TimerState {
    dispatcher: Weak<DispatcherInner>,
    callback: RefCell<Box<dyn FnMut()>>,
    armed: Cell<Option<TimerKey>>,
}

/// A one-shot timer owned by a [`Dispatcher`](super::Dispatcher).
///
/// The callback runs on the dispatcher thread once the delay has passed and
/// the loop gets to it. A timer enabled from inside its own callback with a
/// zero delay fires on the next loop iteration, not the current one. Dropping
/// the timer cancels it.
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    pub(super) fn new(dispatcher: &Rc<DispatcherInner>, callback: Box<dyn FnMut()>) -> Self {
        Self {
            state: Rc::new(TimerState {
                dispatcher: Rc::downgrade(dispatcher),
                callback: RefCell::new(callback),
                armed: Cell::new(None),
            }),
        }
    }

    /// Arms the timer to fire after `delay`, replacing any earlier deadline.
    pub fn enable(&self, delay: Duration) {
        self.disable();
        let Some(dispatcher) = self.state.dispatcher.upgrade() else {
            return;
        };
        let key = dispatcher.next_timer_key(Instant::now() + delay);
        dispatcher
            .timers
            .borrow_mut()
            .insert(key, Rc::downgrade(&self.state));
        self.state.armed.set(Some(key));
    }

    /// Cancels the timer if it is armed.
    pub fn disable(&self) {
        let Some(key) = self.state.armed.take() else {
            return;
        };
        if let Some(dispatcher) = self.state.dispatcher.upgrade() {
            dispatcher.timers.borrow_mut().remove(&key);
        }
    }

    /// Returns true while the timer is armed and has not fired.
    pub fn enabled(&self) -> bool {
        self.state.armed.get().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disable();
    }
}

impl TimerState {
    pub(super) fn fire(&self, key: TimerKey) {
        // Re-armed or disabled since the key was collected.
        if self.armed.get() != Some(key) {
            return;
        }
        self.armed.set(None);
        (self.callback.borrow_mut())();
    }
}
