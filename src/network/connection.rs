//! The connection state machine shared by socket and userspace pipe
//! connections.

use super::filter::{FilterManager, ReadFilter, ReadFilterChain, WriteFilter};
use super::transport_socket::{ConnectionIo, TransportCallbacks};
use super::{Address, ConnectionSocket, IoErrorKind, IoHandle, PostIoAction, TransportSocket};
use crate::buffer::{Buffer, OwnedBuffer, WatermarkBuffer, WatermarkEvent};
use crate::event::{Dispatcher, Ready, Timer};
use crate::stats::{update_buffer_stats, ConnectionStats};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// A shared handle to a connection.
///
/// The connection is borrowed mutably while its own events run. Code called
/// from those events reaches the connection through the `&mut dyn
/// Connection` it is given, never through this handle.
pub type ConnectionPtr = Rc<RefCell<ConnectionImpl>>;

/// Callback invoked with the number of bytes each transport write moved.
pub type BytesSentCb = Box<dyn FnMut(u64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteClose,
    LocalClose,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    /// A flushing close is waiting for the write buffer to drain.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Write out buffered data before closing, if the transport allows it.
    FlushWrite,
    /// Close now, discarding what cannot be written immediately.
    NoFlush,
}

/// Receives connection events.
pub trait ConnectionCallbacks {
    fn on_event(&mut self, connection: &mut dyn Connection, event: ConnectionEvent);

    /// The write buffer went above its high watermark.
    fn on_above_write_buffer_high_watermark(&mut self, _connection: &mut dyn Connection) {}

    /// The write buffer drained back to its low watermark.
    fn on_below_write_buffer_low_watermark(&mut self, _connection: &mut dyn Connection) {}
}

/// A byte stream with read and write filter chains and watermark-based flow
/// control.
pub trait Connection {
    fn id(&self) -> u64;

    fn dispatcher(&self) -> &Dispatcher;

    fn state(&self) -> State;

    fn add_connection_callbacks(&mut self, callbacks: Box<dyn ConnectionCallbacks>);

    fn add_bytes_sent_callback(&mut self, cb: BytesSentCb);

    fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>);

    fn add_write_filter(&mut self, filter: Box<dyn WriteFilter>);

    /// Calls `on_new_connection` on the read filters. Returns false if there
    /// are none.
    fn initialize_read_filters(&mut self) -> bool;

    /// Closes the connection. Calls after the first have no effect.
    fn close(&mut self, close_type: CloseType);

    /// Passes `data` through the write filters and buffers it for writing.
    /// `data` is drained.
    fn write(&mut self, data: &mut dyn Buffer, end_stream: bool);

    /// Like [`Connection::write`] but skips the write filters.
    fn raw_write(&mut self, data: &mut dyn Buffer, end_stream: bool);

    /// Disables or re-enables reading. Calls nest: reading resumes after as
    /// many enables as there were disables.
    fn read_disable(&mut self, disable: bool);

    fn read_enabled(&self) -> bool;

    /// Whether a remote close is still detected while reads are disabled.
    fn detect_early_close_when_read_disabled(&mut self, should_detect: bool);

    /// With half close enabled, end of stream is passed to the read filters
    /// instead of closing the connection.
    fn enable_half_close(&mut self, enabled: bool);

    fn is_half_close_enabled(&self) -> bool;

    /// Limits the read size per loop iteration and sets the write buffer high
    /// watermark to `limit + 1`. Zero means no limit.
    fn set_buffer_limits(&mut self, limit: usize);

    fn buffer_limit(&self) -> usize;

    fn above_high_watermark(&self) -> bool;

    fn local_address(&self) -> &Address;

    fn remote_address(&self) -> &Address;

    fn local_address_restored(&self) -> bool;

    /// Sets the stats sink. May only be called once.
    fn set_connection_stats(&mut self, stats: ConnectionStats);

    fn no_delay(&mut self, enable: bool);

    fn next_protocol(&self) -> Option<String>;

    fn transport_failure_reason(&self) -> Option<String>;

    /// Bounds how long a flushing close may wait for the write buffer to
    /// drain. `None`, the default, waits indefinitely.
    fn set_delayed_close_timeout(&mut self, timeout: Option<Duration>);
}

/// A connection that is initiated locally.
pub trait ClientConnection: Connection {
    /// Starts connecting. Completion is reported as
    /// [`ConnectionEvent::Connected`], failure as a close event.
    fn connect(&mut self);
}

#[derive(Debug, Clone, Copy)]
enum Notification {
    Event(ConnectionEvent),
    AboveWriteBufferHighWatermark,
    BelowWriteBufferLowWatermark,
}

/// The connection implementation used for both kernel sockets and userspace
/// pipes.
pub struct ConnectionImpl {
    self_weak: Weak<RefCell<ConnectionImpl>>,
    dispatcher: Dispatcher,
    io: ConnectionIo,
    transport_socket: Box<dyn TransportSocket>,
    filter_manager: FilterManager,
    read_buffer: OwnedBuffer,
    write_buffer: WatermarkBuffer,
    read_buffer_lent: bool,
    dispatch_buffered_data: bool,
    buffer_limit: usize,
    above_high_watermark: bool,

    connecting: bool,
    close_with_flush: bool,
    bind_error: bool,
    immediate_connection_error: bool,
    read_enabled: bool,
    read_disable_count: u32,
    detect_early_close: bool,
    enable_half_close: bool,
    read_end_stream: bool,
    read_end_stream_raised: bool,
    write_end_stream: bool,

    callbacks: Vec<Box<dyn ConnectionCallbacks>>,
    bytes_sent_callbacks: Vec<BytesSentCb>,
    pending_notifications: VecDeque<Notification>,
    notifying: bool,

    stats: Option<ConnectionStats>,
    last_read_buffer_size: u64,
    last_write_buffer_size: u64,

    local_address: Address,
    remote_address: Address,
    local_address_restored: bool,

    delayed_close_timeout: Option<Duration>,
    delayed_close_timer: Option<Timer>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionImpl {
    /// Wraps `socket` in a connection bound to `dispatcher`. `connected` is
    /// false for client connections that still have to connect.
    pub(crate) fn new(
        dispatcher: &Dispatcher,
        socket: ConnectionSocket,
        transport_socket: Box<dyn TransportSocket>,
        connected: bool,
    ) -> ConnectionPtr {
        let (io_handle, local_address, remote_address, local_address_restored) =
            socket.into_parts();
        let id = dispatcher.next_connection_id();
        debug!(id, %local_address, %remote_address, connected, "New connection");

        Rc::new_cyclic(|weak: &Weak<RefCell<ConnectionImpl>>| {
            let cb_weak = weak.clone();
            let file_event = io_handle.create_file_event(
                dispatcher,
                Box::new(move |events| {
                    if let Some(connection) = cb_weak.upgrade() {
                        connection.borrow_mut().on_file_event(events);
                    }
                }),
                Ready::READ | Ready::WRITE,
            );

            RefCell::new(ConnectionImpl {
                self_weak: weak.clone(),
                dispatcher: dispatcher.clone(),
                io: ConnectionIo {
                    io_handle,
                    file_event: Some(file_event),
                    id,
                    read_buffer_limit: 0,
                },
                transport_socket,
                filter_manager: FilterManager::default(),
                read_buffer: OwnedBuffer::new(),
                write_buffer: WatermarkBuffer::new(),
                read_buffer_lent: false,
                dispatch_buffered_data: false,
                buffer_limit: 0,
                above_high_watermark: false,
                connecting: !connected,
                close_with_flush: false,
                bind_error: false,
                immediate_connection_error: false,
                read_enabled: true,
                read_disable_count: 0,
                detect_early_close: true,
                enable_half_close: false,
                read_end_stream: false,
                read_end_stream_raised: false,
                write_end_stream: false,
                callbacks: Vec::new(),
                bytes_sent_callbacks: Vec::new(),
                pending_notifications: VecDeque::new(),
                notifying: false,
                stats: None,
                last_read_buffer_size: 0,
                last_write_buffer_size: 0,
                local_address,
                remote_address,
                local_address_restored,
                delayed_close_timeout: None,
                delayed_close_timer: None,
            })
        })
    }

    /// Creates a client connection over an unconnected handle. A failed bind
    /// to `source_address` is reported as a local close once the loop runs.
    pub(crate) fn new_client(
        dispatcher: &Dispatcher,
        io_handle: Box<dyn IoHandle>,
        remote_address: Address,
        source_address: Option<&Address>,
        transport_socket: Box<dyn TransportSocket>,
    ) -> ConnectionPtr {
        let local_address = remote_address.unspecified_local();
        let socket = ConnectionSocket::new(io_handle, local_address, remote_address.clone());
        let connection = Self::new(dispatcher, socket, transport_socket, false);

        // Source addresses only mean something for IP connections.
        if let (Some(_), Some(source)) = (remote_address.ip(), source_address) {
            let mut conn = connection.borrow_mut();
            match conn.io.io_handle.bind(source) {
                Ok(()) => conn.local_address = source.clone(),
                Err(err) => {
                    debug!(id = conn.io.id, %source, ?err, "Bind failure");
                    conn.bind_error = true;
                    // Closed from the loop so the owner can add callbacks
                    // first.
                    conn.activate_file_events(Ready::WRITE);
                }
            }
        }
        connection
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl ConnectionImpl {
    pub fn id(&self) -> u64 {
        self.io.id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> State {
        if !self.io.io_handle.is_open() {
            State::Closed
        } else if self.close_with_flush {
            State::Closing
        } else {
            State::Open
        }
    }

    pub fn add_connection_callbacks(&mut self, callbacks: Box<dyn ConnectionCallbacks>) {
        self.callbacks.push(callbacks);
    }

    pub fn add_bytes_sent_callback(&mut self, cb: BytesSentCb) {
        self.bytes_sent_callbacks.push(cb);
    }

    pub fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>) {
        self.filter_manager.read_filters.add(filter);
    }

    pub fn add_write_filter(&mut self, filter: Box<dyn WriteFilter>) {
        self.filter_manager.add_write_filter(filter);
    }

    pub fn initialize_read_filters(&mut self) -> bool {
        if self.filter_manager.read_filters.is_empty() {
            return false;
        }
        let mut chain = std::mem::take(&mut self.filter_manager.read_filters);
        chain.initialize(self);
        self.restore_read_filters(chain);
        true
    }

    #[instrument(skip(self), fields(id = self.io.id))]
    pub fn close(&mut self, close_type: CloseType) {
        if !self.io.io_handle.is_open() {
            return;
        }

        let data_to_write = self.write_buffer.len();
        debug!(data_to_write, ?close_type, "Closing connection");

        if data_to_write == 0
            || close_type == CloseType::NoFlush
            || !self.transport_socket.can_flush_close()
        {
            if data_to_write > 0 {
                // Write what goes out without blocking; the rest is dropped.
                let mut callbacks = TransportCallbacks::new(&mut self.io);
                self.transport_socket
                    .do_write(&mut self.write_buffer, true, &mut callbacks);
            }
            self.close_socket(ConnectionEvent::LocalClose);
            return;
        }

        self.close_with_flush = true;
        self.read_enabled = false;
        let mut events = Ready::WRITE;
        if !self.enable_half_close {
            events |= Ready::CLOSED;
        }
        if let Some(file_event) = &self.io.file_event {
            file_event.set_enabled(events);
        }

        if let Some(timeout) = self.delayed_close_timeout {
            let weak = self.self_weak.clone();
            let timer = self.dispatcher.create_timer(Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.borrow_mut().on_delayed_close_timeout();
                }
            }));
            timer.enable(timeout);
            self.delayed_close_timer = Some(timer);
        }
    }

    pub fn read_disable(&mut self, disable: bool) {
        if self.state() != State::Open || self.io.file_event.is_none() {
            return;
        }
        let id = self.io.id;
        trace!(id, read_enabled = self.read_enabled, disable, "Read disable");

        if disable {
            if !self.read_enabled {
                self.read_disable_count += 1;
                return;
            }
            self.read_enabled = false;
            let events = if self.detect_early_close && !self.enable_half_close {
                Ready::WRITE | Ready::CLOSED
            } else {
                Ready::WRITE
            };
            self.set_file_events(events);
        } else {
            if self.read_disable_count > 0 {
                self.read_disable_count -= 1;
                return;
            }
            if self.read_enabled {
                return;
            }
            self.read_enabled = true;
            // Early close detection and reading are never enabled together;
            // a reader sees the close as end of stream.
            self.set_file_events(Ready::READ | Ready::WRITE);
            // Buffered data is not announced by the kernel again.
            if !self.read_buffer.is_empty() || self.read_buffer_lent {
                self.dispatch_buffered_data = true;
                self.activate_file_events(Ready::READ);
            }
        }
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled
    }

    pub fn detect_early_close_when_read_disabled(&mut self, should_detect: bool) {
        self.detect_early_close = should_detect;
    }

    pub fn enable_half_close(&mut self, enabled: bool) {
        self.enable_half_close = enabled;
    }

    pub fn is_half_close_enabled(&self) -> bool {
        self.enable_half_close
    }

    pub fn set_buffer_limits(&mut self, limit: usize) {
        self.buffer_limit = limit;
        self.io.read_buffer_limit = limit;
        // One byte of slack keeps a read of `limit` bytes that is written and
        // flushed in the same iteration from tripping the watermark.
        if limit > 0 {
            self.write_buffer.set_watermarks(limit + 1);
            self.dispatch_write_watermarks();
        }
    }

    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    pub fn above_high_watermark(&self) -> bool {
        self.above_high_watermark
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote_address
    }

    pub fn local_address_restored(&self) -> bool {
        self.local_address_restored
    }

    pub fn set_connection_stats(&mut self, stats: ConnectionStats) {
        assert!(self.stats.is_none(), "Connection stats may only be set once");
        self.stats = Some(stats);
    }

    pub fn no_delay(&mut self, enable: bool) {
        // Only meaningful for TCP sockets.
        if !self.io.io_handle.is_open() || self.remote_address.ip().is_none() {
            return;
        }
        if let Err(err) = self.io.io_handle.set_no_delay(enable) {
            debug!(id = self.io.id, ?err, "Failed to set TCP_NODELAY");
        }
    }

    pub fn next_protocol(&self) -> Option<String> {
        self.transport_socket.protocol()
    }

    pub fn transport_failure_reason(&self) -> Option<String> {
        self.transport_socket.failure_reason()
    }

    pub fn set_delayed_close_timeout(&mut self, timeout: Option<Duration>) {
        self.delayed_close_timeout = timeout;
    }

    #[instrument(skip(self), fields(id = self.io.id, remote = %self.remote_address))]
    pub fn connect(&mut self) {
        debug!("Connecting");
        match self.io.io_handle.connect(&self.remote_address) {
            Ok(()) => {
                debug_assert!(self.connecting);
                // Userspace pipes are connected at once; report it from the
                // loop like a socket would.
                self.activate_file_events(Ready::WRITE);
            }
            Err(err) if err.kind() == IoErrorKind::InProgress => {
                debug_assert!(self.connecting);
                debug!("Connection in progress");
            }
            Err(err) => {
                debug!(?err, "Immediate connection error");
                self.immediate_connection_error = true;
                self.connecting = false;
                self.activate_file_events(Ready::WRITE);
            }
        }

        if self.remote_address.ip().is_some() {
            if let Ok(local_address) = self.io.io_handle.local_address() {
                self.local_address = local_address;
            }
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl ConnectionImpl {
    pub fn write(&mut self, data: &mut dyn Buffer, end_stream: bool) {
        self.write_internal(data, end_stream, true);
    }

    pub fn raw_write(&mut self, data: &mut dyn Buffer, end_stream: bool) {
        self.write_internal(data, end_stream, false);
    }

    fn write_internal(&mut self, data: &mut dyn Buffer, end_stream: bool, through_filter_chain: bool) {
        assert!(
            !end_stream || self.enable_half_close,
            "end_stream write requires half close"
        );
        let id = self.io.id;

        if self.write_end_stream {
            // Only a repeated empty end of stream is tolerated.
            debug_assert!(data.is_empty() && end_stream, "write after end_stream");
            return;
        }
        if !self.io.io_handle.is_open() {
            debug!(id, len = data.len(), "Dropping write on closed connection");
            return;
        }

        if through_filter_chain
            && self.filter_manager.on_write(data, end_stream)
                == super::FilterStatus::StopIteration
        {
            return;
        }

        self.write_end_stream = end_stream;
        if !data.is_empty() || end_stream {
            trace!(id, len = data.len(), end_stream, "Writing");
            self.write_buffer.move_from(data);
            self.dispatch_write_watermarks();

            // An early write event would look like connect completion.
            if !self.connecting {
                self.activate_file_events(Ready::WRITE);
            }
        }
    }

    fn flush_write_buffer(&mut self) {
        if self.state() == State::Open && !self.write_buffer.is_empty() {
            self.on_write_ready();
        }
    }

    fn dispatch_read_filters(&mut self) {
        let end_stream = self.read_end_stream;
        let mut chain = std::mem::take(&mut self.filter_manager.read_filters);
        let mut data = std::mem::take(&mut self.read_buffer);
        self.read_buffer_lent = true;

        chain.on_read(self, &mut data, end_stream);

        self.read_buffer_lent = false;
        self.read_buffer = data;
        self.restore_read_filters(chain);
        let remaining = self.read_buffer.len() as u64;
        self.update_read_buffer_stats(0, remaining);
    }

    fn restore_read_filters(&mut self, chain: ReadFilterChain) {
        let added = std::mem::replace(&mut self.filter_manager.read_filters, chain);
        self.filter_manager.read_filters.append(added);
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl ConnectionImpl {
    fn on_file_event(&mut self, events: Ready) {
        let id = self.io.id;
        trace!(id, ?events, "Socket event");

        if self.bind_error {
            if let Some(counter) = self.stats.as_ref().and_then(|s| s.bind_errors.as_ref()) {
                counter.inc();
            }
            self.close_socket(ConnectionEvent::LocalClose);
            return;
        }
        if self.immediate_connection_error {
            self.close_socket(ConnectionEvent::RemoteClose);
            return;
        }

        if events.contains(Ready::CLOSED) {
            // Reading and early close detection are never enabled together.
            debug_assert!(!events.contains(Ready::READ));
            debug!(id, "Remote early close");
            self.close_socket(ConnectionEvent::RemoteClose);
            return;
        }

        if events.contains(Ready::WRITE) {
            self.on_write_ready();
        }

        // The write path may have closed the connection.
        if self.io.io_handle.is_open() && events.contains(Ready::READ) {
            self.on_read_ready();
        }
    }

    fn on_write_ready(&mut self) {
        let id = self.io.id;
        trace!(id, "Write ready");

        if self.connecting {
            match self.io.io_handle.take_error() {
                Ok(None) => {
                    debug!(id, "Connected");
                    self.connecting = false;
                    let mut callbacks = TransportCallbacks::new(&mut self.io);
                    self.transport_socket.on_connected(&mut callbacks);
                    let requests = callbacks.finish();
                    self.apply_transport_requests(requests);
                    // A callback may have closed the connection.
                    if !self.io.io_handle.is_open() {
                        return;
                    }
                }
                Ok(Some(err)) | Err(err) => {
                    debug!(id, ?err, "Delayed connection error");
                    self.close_socket(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        let end_stream = self.write_end_stream;
        let mut callbacks = TransportCallbacks::new(&mut self.io);
        let result =
            self.transport_socket
                .do_write(&mut self.write_buffer, end_stream, &mut callbacks);
        let requests = callbacks.finish();
        debug_assert!(!result.end_stream_read);

        let new_buffer_size = self.write_buffer.len() as u64;
        self.update_write_buffer_stats(result.bytes_processed, new_buffer_size);
        self.dispatch_write_watermarks();
        self.apply_transport_requests(requests);
        if !self.io.io_handle.is_open() {
            return;
        }

        if result.action == PostIoAction::Close {
            debug!(id, "Write error, closing");
            self.close_socket(ConnectionEvent::RemoteClose);
        } else if (self.close_with_flush && self.write_buffer.is_empty())
            || self.both_sides_half_closed()
        {
            debug!(id, "Write flush complete");
            self.close_socket(ConnectionEvent::LocalClose);
        } else {
            // The flush timeout counts from the last write.
            if !self.write_buffer.is_empty() {
                if let (Some(timer), Some(timeout)) =
                    (&self.delayed_close_timer, self.delayed_close_timeout)
                {
                    timer.enable(timeout);
                }
            }
            if result.bytes_processed > 0 {
                self.run_bytes_sent_callbacks(result.bytes_processed);
            }
        }
    }

    fn on_read_ready(&mut self) {
        let id = self.io.id;
        debug_assert!(!self.connecting);
        trace!(id, "Read ready");

        // Reads queued before a read disable resume when reads are enabled.
        if !self.read_enabled {
            return;
        }

        let mut callbacks = TransportCallbacks::new(&mut self.io);
        let mut result = self
            .transport_socket
            .do_read(&mut self.read_buffer, &mut callbacks);
        let requests = callbacks.finish();

        let new_buffer_size = self.read_buffer.len() as u64;
        self.update_read_buffer_stats(result.bytes_processed, new_buffer_size);
        self.apply_transport_requests(requests);
        if !self.io.io_handle.is_open() {
            return;
        }

        if !self.enable_half_close && result.end_stream_read {
            result.end_stream_read = false;
            result.action = PostIoAction::Close;
        }
        self.read_end_stream |= result.end_stream_read;

        let dispatch_buffered_data = std::mem::take(&mut self.dispatch_buffered_data);
        if result.bytes_processed != 0 || result.end_stream_read || dispatch_buffered_data {
            self.on_read(new_buffer_size);
        }

        // The filter chain may already have closed the connection.
        if !self.io.io_handle.is_open() {
            return;
        }
        if result.action == PostIoAction::Close || self.both_sides_half_closed() {
            debug!(id, "Remote close");
            self.close_socket(ConnectionEvent::RemoteClose);
        }
    }

    fn on_read(&mut self, read_buffer_size: u64) {
        if self.close_with_flush || !self.read_enabled {
            return;
        }
        if read_buffer_size == 0 && !self.read_end_stream {
            return;
        }
        if self.read_end_stream {
            // Filters see end of stream once.
            if self.read_end_stream_raised {
                return;
            }
            self.read_end_stream_raised = true;
        }
        self.dispatch_read_filters();
    }

    fn on_delayed_close_timeout(&mut self) {
        debug!(
            id = self.io.id,
            remaining = self.write_buffer.len(),
            "Flush timeout, closing"
        );
        self.close_socket(ConnectionEvent::LocalClose);
    }

    // The only way into the Closed state.
    fn close_socket(&mut self, event: ConnectionEvent) {
        if !self.io.io_handle.is_open() {
            return;
        }
        let id = self.io.id;
        debug!(id, ?event, "Closing socket");

        if let Some(timer) = self.delayed_close_timer.take() {
            timer.disable();
        }

        let mut callbacks = TransportCallbacks::new(&mut self.io);
        self.transport_socket.close_socket(event, &mut callbacks);

        self.update_read_buffer_stats(0, 0);
        self.update_write_buffer_stats(0, 0);
        self.stats = None;

        // Unwritten data goes away with the socket. The drain does not count
        // as a watermark crossing.
        let remaining = self.write_buffer.len();
        self.write_buffer.drain(remaining);
        self.write_buffer.take_watermark_events();
        self.above_high_watermark = false;

        self.io.file_event = None;
        if let Err(err) = self.io.io_handle.close() {
            debug!(id, ?err, "Error closing handle");
        }

        self.raise_event(event);
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl ConnectionImpl {
    fn raise_event(&mut self, event: ConnectionEvent) {
        self.notify(Notification::Event(event));
    }

    // Queues notifications raised while callbacks are running so each
    // callback sees them one at a time, in order.
    fn notify(&mut self, notification: Notification) {
        self.pending_notifications.push_back(notification);
        if self.notifying {
            return;
        }
        self.notifying = true;
        while let Some(notification) = self.pending_notifications.pop_front() {
            let mut callbacks = std::mem::take(&mut self.callbacks);
            for cb in callbacks.iter_mut() {
                match notification {
                    Notification::Event(event) => cb.on_event(self, event),
                    Notification::AboveWriteBufferHighWatermark => {
                        cb.on_above_write_buffer_high_watermark(self)
                    }
                    Notification::BelowWriteBufferLowWatermark => {
                        cb.on_below_write_buffer_low_watermark(self)
                    }
                }
            }
            let added = std::mem::replace(&mut self.callbacks, callbacks);
            self.callbacks.extend(added);
        }
        self.notifying = false;
    }

    fn dispatch_write_watermarks(&mut self) {
        for event in self.write_buffer.take_watermark_events() {
            match event {
                WatermarkEvent::AboveHigh => {
                    trace!(id = self.io.id, "Write buffer above high watermark");
                    self.above_high_watermark = true;
                    self.notify(Notification::AboveWriteBufferHighWatermark);
                }
                WatermarkEvent::BelowLow => {
                    trace!(id = self.io.id, "Write buffer below low watermark");
                    self.above_high_watermark = false;
                    self.notify(Notification::BelowWriteBufferLowWatermark);
                }
            }
        }
    }

    fn apply_transport_requests(&mut self, (raised, flush_requested): (Vec<ConnectionEvent>, bool)) {
        for event in raised {
            self.raise_event(event);
        }
        if flush_requested {
            self.flush_write_buffer();
        }
    }

    fn run_bytes_sent_callbacks(&mut self, bytes: u64) {
        let mut callbacks = std::mem::take(&mut self.bytes_sent_callbacks);
        for cb in callbacks.iter_mut() {
            cb(bytes);
        }
        let added = std::mem::replace(&mut self.bytes_sent_callbacks, callbacks);
        self.bytes_sent_callbacks.extend(added);
    }

    fn both_sides_half_closed(&self) -> bool {
        self.read_end_stream && self.write_end_stream && self.write_buffer.is_empty()
    }

    fn activate_file_events(&self, events: Ready) {
        if let Some(file_event) = &self.io.file_event {
            file_event.activate(events);
        }
    }

    fn set_file_events(&self, events: Ready) {
        if let Some(file_event) = &self.io.file_event {
            file_event.set_enabled(events);
        }
    }

    fn update_read_buffer_stats(&mut self, delta: u64, new_total: u64) {
        if let Some(stats) = &self.stats {
            update_buffer_stats(
                delta,
                new_total,
                &mut self.last_read_buffer_size,
                &stats.read_total,
                &stats.read_current,
            );
        }
    }

    fn update_write_buffer_stats(&mut self, delta: u64, new_total: u64) {
        if let Some(stats) = &self.stats {
            update_buffer_stats(
                delta,
                new_total,
                &mut self.last_write_buffer_size,
                &stats.write_total,
                &stats.write_current,
            );
        }
    }
}

impl Drop for ConnectionImpl {
    fn drop(&mut self) {
        self.close(CloseType::NoFlush);
    }
}

// ============================================================================
// Connection Trait Implementation
// ============================================================================
//
// Thin adapter over the inherent methods above.

impl Connection for ConnectionImpl {
    fn id(&self) -> u64 {
        self.id()
    }

    fn dispatcher(&self) -> &Dispatcher {
        self.dispatcher()
    }

    fn state(&self) -> State {
        self.state()
    }

    fn add_connection_callbacks(&mut self, callbacks: Box<dyn ConnectionCallbacks>) {
        self.add_connection_callbacks(callbacks)
    }

    fn add_bytes_sent_callback(&mut self, cb: BytesSentCb) {
        self.add_bytes_sent_callback(cb)
    }

    fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>) {
        self.add_read_filter(filter)
    }

    fn add_write_filter(&mut self, filter: Box<dyn WriteFilter>) {
        self.add_write_filter(filter)
    }

    fn initialize_read_filters(&mut self) -> bool {
        self.initialize_read_filters()
    }

    fn close(&mut self, close_type: CloseType) {
        self.close(close_type)
    }

    fn write(&mut self, data: &mut dyn Buffer, end_stream: bool) {
        self.write(data, end_stream)
    }

    fn raw_write(&mut self, data: &mut dyn Buffer, end_stream: bool) {
        self.raw_write(data, end_stream)
    }

    fn read_disable(&mut self, disable: bool) {
        self.read_disable(disable)
    }

    fn read_enabled(&self) -> bool {
        self.read_enabled()
    }

    fn detect_early_close_when_read_disabled(&mut self, should_detect: bool) {
        self.detect_early_close_when_read_disabled(should_detect)
    }

    fn enable_half_close(&mut self, enabled: bool) {
        self.enable_half_close(enabled)
    }

    fn is_half_close_enabled(&self) -> bool {
        self.is_half_close_enabled()
    }

    fn set_buffer_limits(&mut self, limit: usize) {
        self.set_buffer_limits(limit)
    }

    fn buffer_limit(&self) -> usize {
        self.buffer_limit()
    }

    fn above_high_watermark(&self) -> bool {
        self.above_high_watermark()
    }

    fn local_address(&self) -> &Address {
        self.local_address()
    }

    fn remote_address(&self) -> &Address {
        self.remote_address()
    }

    fn local_address_restored(&self) -> bool {
        self.local_address_restored()
    }

    fn set_connection_stats(&mut self, stats: ConnectionStats) {
        self.set_connection_stats(stats)
    }

    fn no_delay(&mut self, enable: bool) {
        self.no_delay(enable)
    }

    fn next_protocol(&self) -> Option<String> {
        self.next_protocol()
    }

    fn transport_failure_reason(&self) -> Option<String> {
        self.transport_failure_reason()
    }

    fn set_delayed_close_timeout(&mut self, timeout: Option<Duration>) {
        self.set_delayed_close_timeout(timeout)
    }
}

impl ClientConnection for ConnectionImpl {
    fn connect(&mut self) {
        self.connect()
    }
}
