//! A TLS transport socket over rustls.
//!
//! Ciphertext moves between rustls and the connection's I/O handle; the
//! connection's buffers only ever hold plaintext. The handshake runs inside
//! `do_read` and `do_write` and the connection sees
//! [`ConnectionEvent::Connected`] once it completes.

use crate::buffer::Buffer;
use crate::network::{
    ConnectionEvent, IoHandleStream, IoResult, PostIoAction, TransportSocket,
    TransportSocketCallbacks, TransportSocketFactory,
};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const READ_CHUNK_SIZE: usize = 16384;

enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSession {
    fn read_tls(&mut self, callbacks: &mut dyn TransportSocketCallbacks) -> std::io::Result<usize> {
        let mut stream = IoHandleStream(callbacks.io_handle());
        match self {
            TlsSession::Server(conn) => conn.read_tls(&mut stream),
            TlsSession::Client(conn) => conn.read_tls(&mut stream),
        }
    }

    fn write_tls(&mut self, callbacks: &mut dyn TransportSocketCallbacks) -> std::io::Result<usize> {
        let mut stream = IoHandleStream(callbacks.io_handle());
        match self {
            TlsSession::Server(conn) => conn.write_tls(&mut stream),
            TlsSession::Client(conn) => conn.write_tls(&mut stream),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsSession::Server(conn) => conn.alpn_protocol(),
            TlsSession::Client(conn) => conn.alpn_protocol(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }
}

// What flushing ciphertext to the handle ended with.
enum Flush {
    Done,
    Blocked,
    Failed,
}

/// A transport socket that encrypts with TLS.
pub struct TlsSocket {
    session: TlsSession,
    handshake_complete: bool,
    shutdown_sent: bool,
    failure_reason: Option<String>,
}

impl TlsSocket {
    fn new(session: TlsSession) -> Self {
        Self {
            session,
            handshake_complete: false,
            shutdown_sent: false,
            failure_reason: None,
        }
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    fn flush_tls(&mut self, callbacks: &mut dyn TransportSocketCallbacks) -> Flush {
        let id = callbacks.connection_id();
        while self.session.wants_write() {
            match self.session.write_tls(callbacks) {
                Ok(0) => return Flush::Blocked,
                Ok(sz) => trace!(id, len = sz, "Wrote encrypted data"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Flush::Blocked,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(id, ?err, "Error writing encrypted data");
                    return Flush::Failed;
                }
            }
        }
        Flush::Done
    }

    fn check_handshake(&mut self, callbacks: &mut dyn TransportSocketCallbacks) {
        if self.handshake_complete || self.session.is_handshaking() {
            return;
        }
        self.handshake_complete = true;
        info!(
            id = callbacks.connection_id(),
            protocol = ?self.protocol(),
            "TLS handshake completed"
        );
        callbacks.raise_event(ConnectionEvent::Connected);
        // Plaintext written while handshaking is still buffered.
        callbacks.flush_write_buffer();
    }

    fn fail(&mut self, reason: String, callbacks: &mut dyn TransportSocketCallbacks) {
        warn!(id = callbacks.connection_id(), %reason, "TLS failure");
        self.failure_reason = Some(reason);
        // Let the peer see the alert, if it fits.
        let _ = self.flush_tls(callbacks);
    }

    // Moves decrypted data into `buffer`. Returns true at a clean end of the
    // TLS stream.
    fn drain_plaintext(&mut self, buffer: &mut dyn Buffer) -> std::io::Result<bool> {
        loop {
            let slice = buffer.reserve(READ_CHUNK_SIZE);
            match self.session.reader().read(slice) {
                Ok(0) => {
                    buffer.commit(0);
                    return Ok(true);
                }
                Ok(sz) => buffer.commit(sz),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    buffer.commit(0);
                    return Ok(false);
                }
                Err(err) => {
                    buffer.commit(0);
                    return Err(err);
                }
            }
        }
    }
}

impl TransportSocket for TlsSocket {
    fn protocol(&self) -> Option<String> {
        self.session
            .alpn_protocol()
            .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
    }

    fn failure_reason(&self) -> Option<String> {
        self.failure_reason.clone()
    }

    fn can_flush_close(&self) -> bool {
        self.handshake_complete
    }

    fn close_socket(&mut self, event: ConnectionEvent, callbacks: &mut dyn TransportSocketCallbacks) {
        if self.shutdown_sent || !self.handshake_complete {
            return;
        }
        debug!(id = callbacks.connection_id(), ?event, "Sending close_notify");
        self.session.send_close_notify();
        self.shutdown_sent = true;
        let _ = self.flush_tls(callbacks);
    }

    fn do_read(
        &mut self,
        buffer: &mut dyn Buffer,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult {
        let id = callbacks.connection_id();
        let start_len = buffer.len();
        let mut action = PostIoAction::KeepOpen;
        let mut end_stream = false;

        loop {
            let mut would_block = false;
            match self.session.read_tls(callbacks) {
                Ok(0) => {
                    trace!(id, "Read end of stream");
                    end_stream = true;
                }
                Ok(sz) => trace!(id, len = sz, "Read encrypted data"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => would_block = true,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(id, ?err, "Error reading encrypted data");
                    action = PostIoAction::Close;
                    break;
                }
            }

            if let Err(err) = self.session.process_new_packets() {
                self.fail(err.to_string(), callbacks);
                action = PostIoAction::Close;
                break;
            }

            match self.drain_plaintext(buffer) {
                Ok(true) => end_stream = true,
                Ok(false) => {}
                Err(err) => {
                    // The transport ended without close_notify.
                    debug!(id, ?err, "Unclean TLS end of stream");
                    end_stream = true;
                }
            }

            // Handshake records are answered as they arrive.
            if let Flush::Failed = self.flush_tls(callbacks) {
                action = PostIoAction::Close;
                break;
            }

            if end_stream || would_block {
                break;
            }
            if callbacks.should_drain_read_buffer(buffer.len()) {
                callbacks.set_read_buffer_ready();
                break;
            }
        }

        if action == PostIoAction::KeepOpen {
            self.check_handshake(callbacks);
        }

        IoResult {
            action,
            bytes_processed: (buffer.len() - start_len) as u64,
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

        if !self.handshake_complete {
            // Plaintext waits for the handshake.
            return match self.flush_tls(callbacks) {
                Flush::Failed => IoResult::close(0),
                _ => IoResult::keep_open(0),
            };
        }

        let mut bytes_written = 0;
        loop {
            if !buffer.is_empty() {
                match self.session.writer().write(buffer.as_slice()) {
                    Ok(sz) => {
                        trace!(id, len = sz, remaining = buffer.len() - sz, "Wrote plaintext");
                        buffer.drain(sz);
                        bytes_written += sz as u64;
                    }
                    Err(err) => {
                        debug!(id, ?err, "Error writing plaintext");
                        return IoResult::close(bytes_written);
                    }
                }
            }

            match self.flush_tls(callbacks) {
                Flush::Failed => return IoResult::close(bytes_written),
                Flush::Blocked => return IoResult::keep_open(bytes_written),
                Flush::Done => {}
            }

            if buffer.is_empty() {
                break;
            }
        }

        if end_stream && !self.shutdown_sent {
            debug!(id, "Sending close_notify at end of stream");
            self.session.send_close_notify();
            self.shutdown_sent = true;
            if let Flush::Failed = self.flush_tls(callbacks) {
                return IoResult::close(bytes_written);
            }
        }
        IoResult::keep_open(bytes_written)
    }

    fn on_connected(&mut self, callbacks: &mut dyn TransportSocketCallbacks) {
        // The client hello goes out now; Connected waits for the handshake.
        debug!(id = callbacks.connection_id(), "Starting TLS handshake");
        if let Flush::Failed = self.flush_tls(callbacks) {
            self.failure_reason = Some("failed to send client hello".to_string());
        }
    }
}

/// Creates server side [`TlsSocket`]s.
pub struct TlsServerSocketFactory {
    config: Arc<ServerConfig>,
}

impl TlsServerSocketFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl TransportSocketFactory for TlsServerSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        true
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        let session = rustls::ServerConnection::new(self.config.clone())
            .expect("Failed to create TLS server session");
        Box::new(TlsSocket::new(TlsSession::Server(session)))
    }
}

/// Creates client side [`TlsSocket`]s for one server name.
pub struct TlsClientSocketFactory {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClientSocketFactory {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            config,
            server_name,
        }
    }
}

impl TransportSocketFactory for TlsClientSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        true
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        let session = rustls::ClientConnection::new(self.config.clone(), self.server_name.clone())
            .expect("Failed to create TLS client session");
        Box::new(TlsSocket::new(TlsSession::Client(session)))
    }
}
