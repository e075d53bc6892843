//! proxycore - the connection and transport socket core of an event-driven
//! L4 proxy.
//!
//! A [`Dispatcher`] runs a single-threaded event loop. Connections on it move
//! bytes between an [`IoHandle`] (a kernel socket or an in-memory userspace
//! pipe) and their read and write filter chains, with a [`TransportSocket`]
//! in between that may encrypt ([`TlsSocket`]) or record
//! ([`CaptureSocket`]) the traffic. Write buffers apply watermark based flow
//! control.
//!
//! All objects belonging to a dispatcher must be used from the thread that
//! runs it. Other threads reach it through a [`PostHandle`].

// Internal-only modules
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod event;
pub(crate) mod network;
pub(crate) mod server;
pub(crate) mod stats;
pub(crate) mod transport_sockets;

// These are the intended public API
pub use buffer::{Buffer, OwnedBuffer, WatermarkBuffer, WatermarkEvent};
pub use error::Error;
pub use event::{
    ConnectionIds, Dispatcher, FileEvent, FileReadyCb, PipeFactory, PostCb, PostHandle, Ready,
    RunType, Timer, UserSpaceFileEvent,
};
pub use network::{
    Address, BufferedIoSocketHandle, BytesSentCb, ClientConnection, CloseType, Connection,
    ConnectionCallbacks, ConnectionEvent, ConnectionImpl, ConnectionPtr, ConnectionSocket,
    FilterStatus, IoCallResult, IoError, IoErrorKind, IoHandle, IoHandleStream, IoResult,
    IoSocketHandle, ListenerCallbacks, PostIoAction, RawBufferSocket, RawBufferSocketFactory,
    ReadFilter, ReadableSource, State, TcpListenerImpl, TransportSocket, TransportSocketCallbacks,
    TransportSocketFactory, WritablePeer, WriteFilter,
};
pub use server::{ActiveListener, ConnectionHandler, FilterChainFactory, ListenerConfig};
pub use stats::{update_buffer_stats, ConnectionStats, Counter, Gauge};
pub use transport_sockets::{client_transport_socket_factory, server_transport_socket_factory};

// Capture support (optional feature, enabled by default)
#[cfg(feature = "capture")]
pub use transport_sockets::{
    CaptureFormat, CaptureSocket, CaptureSocketFactory, Direction, Trace, TraceEvent,
};

// TLS support (optional feature, enabled by default)
#[cfg(feature = "tls")]
pub use transport_sockets::{TlsClientSocketFactory, TlsServerSocketFactory, TlsSocket};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::buffer::{Buffer, OwnedBuffer};
    pub use crate::error::Error;
    pub use crate::event::{Dispatcher, Ready, RunType};
    pub use crate::network::{
        Address, ClientConnection, CloseType, Connection, ConnectionCallbacks, ConnectionEvent,
        ConnectionPtr, FilterStatus, ReadFilter, State, TransportSocket, TransportSocketFactory,
        WriteFilter,
    };
    pub use crate::server::{ConnectionHandler, FilterChainFactory, ListenerConfig};
}
