//! The per-thread event loop.

use super::file_event::{SocketEventState, SocketFileEvent};
use super::timer::{TimerKey, TimerState};
use super::{FileEvent, FileReadyCb, Ready, Timer};
use crate::config::get_namespaced_usize;
use crate::error::Error;
use crate::network::{
    Address, BufferedIoSocketHandle, ConnectionImpl, ConnectionPtr, ConnectionSocket,
    IoSocketHandle, TransportSocket,
};
use ::config::Config;

use mio::{Events, Poll, Registry, Token, Waker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace};

const WAKE_TOKEN: Token = Token(0);
const FILE_EVENT_TOKEN_START: usize = 1;
const DEFAULT_POLL_CAPACITY: usize = 1024;

/// A callback posted to a dispatcher, possibly from another thread.
pub type PostCb = Box<dyn FnOnce(&Dispatcher) + Send>;

/// Accepts the server end of a userspace pipe created for an internal
/// address.
pub type PipeFactory = Rc<dyn Fn(&Dispatcher, ConnectionSocket)>;

/// How long [`Dispatcher::run`] keeps looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Loop until there are no file events, timers or pending work left.
    Block,
    /// Run a single iteration without waiting for I/O.
    NonBlock,
    /// Loop until [`Dispatcher::exit`] is called.
    RunUntilExit,
}

/// Allocates connection ids.
///
/// Clones share one counter, so dispatchers built with the same allocator
/// never hand out the same id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIds(Arc<AtomicU64>);

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A thread-safe handle for posting work to a dispatcher.
#[derive(Clone)]
pub struct PostHandle {
    queue: Arc<Mutex<Vec<PostCb>>>,
    waker: Arc<Waker>,
    exit_requested: Arc<AtomicBool>,
}

impl PostHandle {
    /// Queues `cb` to run on the dispatcher thread. Callbacks posted from one
    /// thread run in the order they were posted.
    pub fn post(&self, cb: PostCb) {
        post_to(&self.queue, &self.waker, cb);
    }

    /// Asks the dispatcher loop to return after its current iteration.
    pub fn exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.waker.wake().expect("Failed to wake dispatcher");
    }
}

pub(super) struct DispatcherInner {
    name: String,
    poll: RefCell<Poll>,
    pub(super) registry: Registry,
    waker: Arc<Waker>,
    post_queue: Arc<Mutex<Vec<PostCb>>>,
    exit_requested: Arc<AtomicBool>,
    poll_capacity: usize,
    pub(super) file_events: RefCell<HashMap<Token, Weak<SocketEventState>>>,
    next_token: Cell<usize>,
    pub(super) activated: RefCell<Vec<Token>>,
    pub(super) timers: RefCell<BTreeMap<TimerKey, Weak<TimerState>>>,
    next_timer_seq: Cell<u64>,
    deferred_delete_lists: [RefCell<Vec<Box<dyn Any>>>; 2],
    current_deferred_list: Cell<usize>,
    deferred_deleting: Cell<bool>,
    run_tid: Cell<Option<ThreadId>>,
    pipe_factories: RefCell<HashMap<String, PipeFactory>>,
    connection_ids: ConnectionIds,
    pipe_buffer_high_watermark: usize,
}

impl DispatcherInner {
    pub(super) fn next_timer_key(&self, deadline: Instant) -> TimerKey {
        let seq = self.next_timer_seq.get();
        self.next_timer_seq.set(seq + 1);
        (deadline, seq)
    }
}

/// A single-threaded event loop.
///
/// Owns the poller, timers, the deferred delete lists and the post queue, and
/// creates connections bound to itself. Every callback runs to completion on
/// the thread that calls [`Dispatcher::run`]; work that wants to continue
/// later schedules itself again. Clones share the same loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Dispatcher {
    /// Creates a dispatcher with its own connection id allocator.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "", ConnectionIds::new())
    }

    /// Creates a named dispatcher. `name` namespaces configuration lookups and
    /// `connection_ids` is shared with other dispatchers of the same process.
    pub fn new_named(
        config: &Config,
        name: &str,
        connection_ids: ConnectionIds,
    ) -> Result<Self, Error> {
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let pipe_buffer_high_watermark =
            get_namespaced_usize(config, name, "pipe_buffer_high_watermark").unwrap_or(0);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        debug!(name, poll_capacity, pipe_buffer_high_watermark, "Created dispatcher");

        Ok(Self {
            inner: Rc::new(DispatcherInner {
                name: name.to_string(),
                poll: RefCell::new(poll),
                registry,
                waker,
                post_queue: Arc::new(Mutex::new(Vec::new())),
                exit_requested: Arc::new(AtomicBool::new(false)),
                poll_capacity,
                file_events: RefCell::new(HashMap::new()),
                next_token: Cell::new(FILE_EVENT_TOKEN_START),
                activated: RefCell::new(Vec::new()),
                timers: RefCell::new(BTreeMap::new()),
                next_timer_seq: Cell::new(0),
                deferred_delete_lists: [RefCell::new(Vec::new()), RefCell::new(Vec::new())],
                current_deferred_list: Cell::new(0),
                deferred_deleting: Cell::new(false),
                run_tid: Cell::new(None),
                pipe_factories: RefCell::new(HashMap::new()),
                connection_ids,
                pipe_buffer_high_watermark,
            }),
        })
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl Dispatcher {
    /// Wraps an accepted socket in a server connection.
    pub fn create_server_connection(
        &self,
        socket: ConnectionSocket,
        transport_socket: Box<dyn TransportSocket>,
    ) -> ConnectionPtr {
        assert!(self.is_thread_safe());
        ConnectionImpl::new(self, socket, transport_socket, true)
    }

    /// Creates a client connection to `address`. Nothing is sent until
    /// [`ClientConnection::connect`](crate::ClientConnection::connect) is
    /// called.
    ///
    /// An internal address is served by the pipe listener registered for it;
    /// `source_address` only applies to IP connections.
    pub fn create_client_connection(
        &self,
        address: &Address,
        source_address: Option<&Address>,
        transport_socket: Box<dyn TransportSocket>,
    ) -> Result<ConnectionPtr, Error> {
        assert!(self.is_thread_safe());
        let connection = match address {
            Address::Ip(remote) => {
                let io_handle = IoSocketHandle::for_address(remote)?;
                ConnectionImpl::new_client(
                    self,
                    Box::new(io_handle),
                    address.clone(),
                    source_address,
                    transport_socket,
                )
            }
            Address::Internal(name) => {
                let io_handle = self.create_user_space_pipe(name)?;
                ConnectionImpl::new_client(
                    self,
                    Box::new(io_handle),
                    address.clone(),
                    None,
                    transport_socket,
                )
            }
        };
        Ok(connection)
    }

    /// Creates a connected pair of userspace pipe endpoints for the internal
    /// address `name`.
    ///
    /// The server end is handed to the registered pipe listener before this
    /// returns; the client end is returned to the caller.
    #[instrument(skip(self))]
    pub fn create_user_space_pipe(&self, name: &str) -> Result<BufferedIoSocketHandle, Error> {
        assert!(self.is_thread_safe());
        let factory = self
            .inner
            .pipe_factories
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoPipeListener {
                address: name.to_string(),
            })?;

        let (client, server) = BufferedIoSocketHandle::pair(self.inner.pipe_buffer_high_watermark);
        let address = Address::Internal(name.to_string());
        let socket = ConnectionSocket::new(Box::new(server), address.clone(), address);
        debug!(name, "Created userspace pipe");
        factory(self, socket);
        Ok(client)
    }

    /// Registers the listener for the internal address `name`.
    pub fn register_pipe_factory(&self, name: &str, factory: PipeFactory) -> Result<(), Error> {
        assert!(self.is_thread_safe());
        let mut factories = self.inner.pipe_factories.borrow_mut();
        if factories.contains_key(name) {
            return Err(Error::PipeListenerExists {
                address: name.to_string(),
            });
        }
        info!(name, "Registered pipe listener");
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Removes the listener for `name`. Returns false if none was registered.
    pub fn unregister_pipe_factory(&self, name: &str) -> bool {
        let removed = self.inner.pipe_factories.borrow_mut().remove(name).is_some();
        if removed {
            info!(name, "Unregistered pipe listener");
        }
        removed
    }

    pub fn next_connection_id(&self) -> u64 {
        self.inner.connection_ids.next()
    }

    pub fn connection_ids(&self) -> &ConnectionIds {
        &self.inner.connection_ids
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl Dispatcher {
    /// Registers `fd` for readiness notifications.
    pub fn create_file_event(
        &self,
        fd: RawFd,
        cb: FileReadyCb,
        events: Ready,
    ) -> Box<dyn FileEvent> {
        assert!(self.is_thread_safe());
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        Box::new(SocketFileEvent::new(&self.inner, fd, token, cb, events))
    }

    /// Creates a disarmed timer.
    pub fn create_timer(&self, cb: Box<dyn FnMut()>) -> Timer {
        assert!(self.is_thread_safe());
        Timer::new(&self.inner, cb)
    }

    /// Queues `cb` to run on this dispatcher's thread.
    pub fn post(&self, cb: PostCb) {
        post_to(&self.inner.post_queue, &self.inner.waker, cb);
    }

    pub fn post_handle(&self) -> PostHandle {
        PostHandle {
            queue: self.inner.post_queue.clone(),
            waker: self.inner.waker.clone(),
            exit_requested: self.inner.exit_requested.clone(),
        }
    }

    /// Keeps `item` alive until the end of the current loop iteration.
    ///
    /// Items are dropped in the order they were queued. Items queued while the
    /// list is being cleared are dropped on the next clear.
    pub fn deferred_delete<T: 'static>(&self, item: T) {
        assert!(self.is_thread_safe());
        let current = self.inner.current_deferred_list.get();
        self.inner.deferred_delete_lists[current]
            .borrow_mut()
            .push(Box::new(item));
    }

    /// Drops everything queued with [`Dispatcher::deferred_delete`].
    pub fn clear_deferred_delete_list(&self) {
        if self.inner.deferred_deleting.get() {
            return;
        }
        let current = self.inner.current_deferred_list.get();
        let items = std::mem::take(&mut *self.inner.deferred_delete_lists[current].borrow_mut());
        if items.is_empty() {
            return;
        }
        trace!(count = items.len(), "Clearing deferred delete list");

        // Anything deferred while dropping lands in the other list.
        self.inner.current_deferred_list.set(1 - current);
        self.inner.deferred_deleting.set(true);
        for item in items {
            drop(item);
        }
        self.inner.deferred_deleting.set(false);
    }

    /// Runs the loop on the calling thread.
    ///
    /// Callbacks posted before the call run before any I/O or timer
    /// callback.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub fn run(&self, run_type: RunType) -> Result<(), Error> {
        self.inner.run_tid.set(Some(thread::current().id()));
        self.run_post_callbacks();

        loop {
            if self.inner.exit_requested.swap(false, Ordering::AcqRel) {
                debug!("Dispatcher exit requested");
                break;
            }
            if run_type == RunType::Block && !self.has_pending_work() {
                break;
            }

            let timeout = self.next_timeout(run_type);
            self.poll_once(timeout)?;
            self.run_timers();
            self.clear_deferred_delete_list();

            if run_type == RunType::NonBlock {
                break;
            }
        }
        Ok(())
    }

    /// Stops the loop after the current iteration.
    pub fn exit(&self) {
        self.inner.exit_requested.store(true, Ordering::Release);
    }
}

// ============================================================================
// Utilities
// ============================================================================

impl Dispatcher {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true if the calling thread may touch objects owned by this
    /// dispatcher: the thread running it, or any thread before it first ran.
    pub fn is_thread_safe(&self) -> bool {
        self.inner
            .run_tid
            .get()
            .map_or(true, |tid| tid == thread::current().id())
    }

    pub fn pipe_buffer_high_watermark(&self) -> usize {
        self.inner.pipe_buffer_high_watermark
    }
}

// ============================================================================
// Internal Event Processing
// ============================================================================

impl Dispatcher {
    fn run_post_callbacks(&self) {
        // Objects left over from the previous posts go first so that post
        // callbacks start from a clean slate.
        self.clear_deferred_delete_list();

        let callbacks = std::mem::take(
            &mut *self
                .inner
                .post_queue
                .lock()
                .expect("Post queue mutex poisoned"),
        );
        if !callbacks.is_empty() {
            trace!(count = callbacks.len(), "Running post callbacks");
        }
        for cb in callbacks {
            cb(self);
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.inner.file_events.borrow().is_empty()
            || !self.inner.timers.borrow().is_empty()
            || !self.inner.activated.borrow().is_empty()
            || self.has_deferred_deletes()
            || !self
                .inner
                .post_queue
                .lock()
                .expect("Post queue mutex poisoned")
                .is_empty()
    }

    fn has_deferred_deletes(&self) -> bool {
        let current = self.inner.current_deferred_list.get();
        !self.inner.deferred_delete_lists[current].borrow().is_empty()
    }

    fn next_timeout(&self, run_type: RunType) -> Option<Duration> {
        if run_type == RunType::NonBlock
            || !self.inner.activated.borrow().is_empty()
            || self.has_deferred_deletes()
            || self.inner.exit_requested.load(Ordering::Acquire)
        {
            return Some(Duration::ZERO);
        }
        self.inner
            .timers
            .borrow()
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn poll_once(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut events = Events::with_capacity(self.inner.poll_capacity);
        match self.inner.poll.borrow_mut().poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }

        let mut woken = false;
        let mut ready: Vec<(Token, Ready)> = Vec::new();
        let mut index: HashMap<Token, usize> = HashMap::new();
        let mut merge = |token: Token, events: Ready| match index.get(&token) {
            Some(&i) => ready[i].1 |= events,
            None => {
                index.insert(token, ready.len());
                ready.push((token, events));
            }
        };

        {
            let file_events = self.inner.file_events.borrow();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    woken = true;
                    continue;
                }
                if let Some(state) = file_events.get(&event.token()).and_then(Weak::upgrade) {
                    let events = state.translate(event);
                    if !events.is_empty() {
                        merge(event.token(), events);
                    }
                }
            }

            for token in self.inner.activated.take() {
                if let Some(state) = file_events.get(&token).and_then(Weak::upgrade) {
                    let events = state.take_injected();
                    if !events.is_empty() {
                        merge(token, events);
                    }
                }
            }
        }

        if woken {
            self.run_post_callbacks();
        }

        for (token, events) in ready {
            // An earlier callback in this batch may have dropped the event.
            let state = self.inner.file_events.borrow().get(&token).and_then(Weak::upgrade);
            if let Some(state) = state {
                state.fire(events);
            }
        }
        Ok(())
    }

    fn run_timers(&self) {
        let now = Instant::now();
        let due = {
            let mut timers = self.inner.timers.borrow_mut();
            let later = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, later)
        };
        for (key, timer) in due {
            if let Some(timer) = timer.upgrade() {
                timer.fire(key);
            }
        }
    }
}

fn post_to(queue: &Mutex<Vec<PostCb>>, waker: &Waker, cb: PostCb) {
    let was_empty = {
        let mut queue = queue.lock().expect("Post queue mutex poisoned");
        let was_empty = queue.is_empty();
        queue.push(cb);
        was_empty
    };
    if was_empty {
        waker.wake().expect("Failed to wake dispatcher");
    }
}
