//! A transport socket decorator that records the plaintext passing through
//! it.
//!
//! The trace is kept in memory and written when the connection closes, to
//! `{path_prefix}_{connection_id}.txt` or `.bin` depending on the format.

use crate::buffer::Buffer;
use crate::error::Error;
use crate::network::{
    ConnectionEvent, IoResult, TransportSocket, TransportSocketCallbacks, TransportSocketFactory,
};

use bincode::{Decode, Encode};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// How a capture trace is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    /// One header line per event followed by the escaped bytes.
    Text,
    /// A bincode encoded [`Trace`].
    Binary,
}

impl CaptureFormat {
    fn extension(self) -> &'static str {
        match self {
            CaptureFormat::Text => "txt",
            CaptureFormat::Binary => "bin",
        }
    }
}

impl FromStr for CaptureFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(CaptureFormat::Text),
            "binary" => Ok(CaptureFormat::Binary),
            _ => Err(Error::InvalidCaptureFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Direction {
    Read,
    Write,
}

/// One read or write seen by a [`CaptureSocket`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TraceEvent {
    pub direction: Direction,
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub data: Vec<u8>,
    pub end_stream: bool,
}

/// Everything captured on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Trace {
    pub connection_id: u64,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Decodes a trace written in [`CaptureFormat::Binary`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (trace, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| Error::CaptureEncoding(e.to_string()))?;
        Ok(trace)
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            let direction = match event.direction {
                Direction::Read => "read",
                Direction::Write => "write",
            };
            let _ = writeln!(
                out,
                "{direction} ts={} len={} end_stream={}",
                event.timestamp_us,
                event.data.len(),
                event.end_stream
            );
            let _ = writeln!(out, "{}", event.data.escape_ascii());
        }
        out
    }
}

/// Wraps another transport socket and records its traffic.
pub struct CaptureSocket {
    inner: Box<dyn TransportSocket>,
    path_prefix: String,
    format: CaptureFormat,
    trace: Trace,
    end_stream_recorded: bool,
}

impl CaptureSocket {
    pub fn new(inner: Box<dyn TransportSocket>, path_prefix: String, format: CaptureFormat) -> Self {
        Self {
            inner,
            path_prefix,
            format,
            trace: Trace::default(),
            end_stream_recorded: false,
        }
    }

    fn record(&mut self, direction: Direction, data: &[u8], end_stream: bool) {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0);
        self.trace.events.push(TraceEvent {
            direction,
            timestamp_us,
            data: data.to_vec(),
            end_stream,
        });
    }

    fn path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}.{}",
            self.path_prefix,
            self.trace.connection_id,
            self.format.extension()
        ))
    }

    fn write_trace(&self) -> Result<PathBuf, Error> {
        let path = self.path();
        let contents = match self.format {
            CaptureFormat::Text => self.trace.to_text().into_bytes(),
            CaptureFormat::Binary => {
                bincode::encode_to_vec(&self.trace, bincode::config::standard())
                    .map_err(|e| Error::CaptureEncoding(e.to_string()))?
            }
        };
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl TransportSocket for CaptureSocket {
    fn protocol(&self) -> Option<String> {
        self.inner.protocol()
    }

    fn failure_reason(&self) -> Option<String> {
        self.inner.failure_reason()
    }

    fn can_flush_close(&self) -> bool {
        self.inner.can_flush_close()
    }

    fn close_socket(&mut self, event: ConnectionEvent, callbacks: &mut dyn TransportSocketCallbacks) {
        self.inner.close_socket(event, callbacks);
        self.trace.connection_id = callbacks.connection_id();
        match self.write_trace() {
            Ok(path) => debug!(
                id = self.trace.connection_id,
                path = %path.display(),
                events = self.trace.events.len(),
                "Wrote capture trace"
            ),
            Err(err) => warn!(id = self.trace.connection_id, ?err, "Failed to write capture trace"),
        }
    }

    fn do_read(
        &mut self,
        buffer: &mut dyn Buffer,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult {
        let start = buffer.len();
        let result = self.inner.do_read(buffer, callbacks);
        if buffer.len() > start || result.end_stream_read {
            let mut data = vec![0; buffer.len() - start];
            buffer.copy_out(start, &mut data);
            self.record(Direction::Read, &data, result.end_stream_read);
        }
        result
    }

    fn do_write(
        &mut self,
        buffer: &mut dyn Buffer,
        end_stream: bool,
        callbacks: &mut dyn TransportSocketCallbacks,
    ) -> IoResult {
        let pending = buffer.to_vec();
        let result = self.inner.do_write(buffer, end_stream, callbacks);
        let written = pending.len() - buffer.len();
        // End of stream is recorded once, with the write that empties the
        // buffer.
        let end_stream = end_stream && buffer.is_empty() && !self.end_stream_recorded;
        if written > 0 || end_stream {
            self.end_stream_recorded |= end_stream;
            self.record(Direction::Write, &pending[..written], end_stream);
        }
        result
    }

    fn on_connected(&mut self, callbacks: &mut dyn TransportSocketCallbacks) {
        self.inner.on_connected(callbacks);
    }
}

/// Creates [`CaptureSocket`]s around the sockets of another factory.
pub struct CaptureSocketFactory {
    inner: Rc<dyn TransportSocketFactory>,
    path_prefix: String,
    format: CaptureFormat,
}

impl CaptureSocketFactory {
    pub fn new(
        inner: Rc<dyn TransportSocketFactory>,
        path_prefix: impl Into<String>,
        format: CaptureFormat,
    ) -> Self {
        Self {
            inner,
            path_prefix: path_prefix.into(),
            format,
        }
    }
}

impl TransportSocketFactory for CaptureSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        self.inner.implements_secure_transport()
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(CaptureSocket::new(
            self.inner.create_transport_socket(),
            self.path_prefix.clone(),
            self.format,
        ))
    }
}
