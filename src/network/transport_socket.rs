use super::{ConnectionEvent, IoHandle};
use crate::buffer::Buffer;
use crate::event::{FileEvent, Ready};

/// What the connection should do after a transport socket I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostIoAction {
    KeepOpen,
    /// Tear the connection down. No further I/O calls are made.
    Close,
}

/// The outcome of [`TransportSocket::do_read`] or
/// [`TransportSocket::do_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    pub action: PostIoAction,
    /// Bytes read into or drained from the buffer.
    pub bytes_processed: u64,
    /// Set by reads that saw end of stream. Never set by writes.
    pub end_stream_read: bool,
}

impl IoResult {
    pub fn keep_open(bytes_processed: u64) -> Self {
        Self {
            action: PostIoAction::KeepOpen,
            bytes_processed,
            end_stream_read: false,
        }
    }

    pub fn close(bytes_processed: u64) -> Self {
        Self {
            action: PostIoAction::Close,
            bytes_processed,
            end_stream_read: false,
        }
    }
}

/// What a transport socket can reach on its connection while it runs.
pub trait TransportSocketCallbacks {
    fn io_handle(&mut self) -> &mut dyn IoHandle;

    fn connection_id(&self) -> u64;

    /// The connection's read buffer limit, zero for none.
    fn read_buffer_limit(&self) -> usize;

    /// Returns true once `buffered` bytes have reached the read limit and the
    /// socket should stop reading for this iteration.
    fn should_drain_read_buffer(&self, buffered: usize) -> bool {
        let limit = self.read_buffer_limit();
        limit > 0 && buffered >= limit
    }

    /// Asks for another read on the next loop iteration, for a socket that
    /// stopped early with data left to read.
    fn set_read_buffer_ready(&mut self);

    /// Raises `event` to the connection's callbacks once the current call
    /// returns.
    fn raise_event(&mut self, event: ConnectionEvent);

    /// Asks the connection to write out its buffer once the current call
    /// returns.
    fn flush_write_buffer(&mut self);
}

/// Moves bytes between a connection's buffers and its I/O handle, possibly
/// transforming them on the way.
pub trait TransportSocket {
    /// The negotiated application protocol, if any.
    fn protocol(&self) -> Option<String> {
        None
    }

    /// Why the transport failed, if it did.
    fn failure_reason(&self) -> Option<String> {
        None
    }

    /// Returns true if the connection may wait for its write buffer to drain
    /// before closing.
    fn can_flush_close(&self) -> bool;

    /// Called once when the connection closes, before the handle is closed.
    fn close_socket(&mut self, event: ConnectionEvent, callbacks: &mut dyn TransportSocketCallbacks);

    /// Reads as much as is available into `buffer`.
    fn do_read(
        &mut self,
        buffer: &mut dyn Buffer,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult;

    /// Writes and drains as much of `buffer` as possible. With `end_stream`
    /// and an empty buffer the write side is shut down.
    fn do_write(
        &mut self,
        buffer: &mut dyn Buffer,
        end_stream: bool,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult;

    /// Called when the underlying connect completed.
    fn on_connected(&mut self, callbacks: &mut dyn TransportSocketCallbacks);
}

/// Creates a transport socket for each new connection.
pub trait TransportSocketFactory {
    /// Returns true if the sockets it creates encrypt traffic.
    fn implements_secure_transport(&self) -> bool;

    fn create_transport_socket(&self) -> Box<dyn TransportSocket>;
}

// The part of a connection a transport socket may touch during a call. Kept
// apart from the buffers so both can be borrowed at once.
pub(crate) struct ConnectionIo {
    pub(crate) io_handle: Box<dyn IoHandle>,
    pub(crate) file_event: Option<Box<dyn FileEvent>>,
    pub(crate) id: u64,
    pub(crate) read_buffer_limit: usize,
}

// Records what the transport socket asked for so the connection can act on it
// after the call.
pub(crate) struct TransportCallbacks<'a> {
    io: &'a mut ConnectionIo,
    raised: Vec<ConnectionEvent>,
    flush_requested: bool,
}

impl<'a> TransportCallbacks<'a> {
    pub(crate) fn new(io: &'a mut ConnectionIo) -> Self {
        Self {
            io,
            raised: Vec::new(),
            flush_requested: false,
        }
    }

    pub(crate) fn finish(self) -> (Vec<ConnectionEvent>, bool) {
        (self.raised, self.flush_requested)
    }
}

impl TransportSocketCallbacks for TransportCallbacks<'_> {
    fn io_handle(&mut self) -> &mut dyn IoHandle {
        self.io.io_handle.as_mut()
    }

    fn connection_id(&self) -> u64 {
        self.io.id
    }

    fn read_buffer_limit(&self) -> usize {
        self.io.read_buffer_limit
    }

    fn set_read_buffer_ready(&mut self) {
        if let Some(file_event) = &self.io.file_event {
            file_event.activate(Ready::READ);
        }
    }

    fn raise_event(&mut self, event: ConnectionEvent) {
        self.raised.push(event);
    }

    fn flush_write_buffer(&mut self) {
        self.flush_requested = true;
    }
}
