use super::{
    ConnectionEvent, IoResult, PostIoAction, TransportSocket, TransportSocketCallbacks,
    TransportSocketFactory,
};
use crate::buffer::Buffer;

use std::net::Shutdown;
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 16384;

/// A pass-through transport socket: bytes go to and from the I/O handle
/// unchanged.
#[derive(Debug, Default)]
pub struct RawBufferSocket {
    shutdown: bool,
}

impl RawBufferSocket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportSocket for RawBufferSocket {
    fn can_flush_close(&self) -> bool {
        true
    }

    fn close_socket(&mut self, _event: ConnectionEvent, _callbacks: &mut dyn TransportSocketCallbacks) {}

    fn do_read(
        &mut self,
        buffer: &mut dyn Buffer,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult {
        let id = callbacks.connection_id();
        let mut action = PostIoAction::KeepOpen;
        let mut bytes_read = 0;
        let mut end_stream = false;

        loop {
            match callbacks.io_handle().read(buffer, READ_CHUNK_SIZE) {
                Ok(0) => {
                    trace!(id, "Read end of stream");
                    end_stream = true;
                    break;
                }
                Ok(sz) => {
                    trace!(id, len = sz, "Read from handle");
                    bytes_read += sz as u64;
                    if callbacks.should_drain_read_buffer(buffer.len()) {
                        callbacks.set_read_buffer_ready();
                        break;
                    }
                }
                Err(err) if err.is_again() => break,
                Err(err) => {
                    debug!(id, ?err, "Read error");
                    action = PostIoAction::Close;
                    break;
                }
            }
        }

        IoResult {
            action,
            bytes_processed: bytes_read,
            end_stream_read: end_stream,
        }
    }

    fn do_write(
        &mut self,
        buffer: &mut dyn Buffer,
        end_stream: bool,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult {
        let id = callbacks.connection_id();
        debug_assert!(!self.shutdown || buffer.is_empty());
        let mut bytes_written = 0;

        loop {
            if buffer.is_empty() {
                if end_stream && !self.shutdown {
                    // A failure here means the connection already failed,
                    // which the next read reports.
                    if let Err(err) = callbacks.io_handle().shutdown(Shutdown::Write) {
                        debug!(id, ?err, "Write shutdown failed");
                    }
                    self.shutdown = true;
                }
                return IoResult::keep_open(bytes_written);
            }

            match callbacks.io_handle().write(buffer) {
                Ok(0) => return IoResult::keep_open(bytes_written),
                Ok(sz) => {
                    trace!(id, len = sz, remaining = buffer.len(), "Wrote to handle");
                    bytes_written += sz as u64;
                }
                Err(err) if err.is_again() => return IoResult::keep_open(bytes_written),
                Err(err) => {
                    debug!(id, ?err, "Write error");
                    return IoResult::close(bytes_written);
                }
            }
        }
    }

    fn on_connected(&mut self, callbacks: &mut dyn TransportSocketCallbacks) {
        callbacks.raise_event(ConnectionEvent::Connected);
    }
}

/// Creates [`RawBufferSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBufferSocketFactory;

impl TransportSocketFactory for RawBufferSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        false
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(RawBufferSocket::new())
    }
}
