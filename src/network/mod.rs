//! Connections, their I/O handles and the transport sockets between them.

mod address;
mod buffered_io_socket_handle;
mod connection;
mod connection_socket;
mod filter;
mod io_handle;
mod io_socket_handle;
mod listener;
mod raw_buffer_socket;
mod transport_socket;

pub use address::Address;
pub use buffered_io_socket_handle::{BufferedIoSocketHandle, ReadableSource, WritablePeer};
pub use connection::{
    BytesSentCb, ClientConnection, CloseType, Connection, ConnectionCallbacks, ConnectionEvent,
    ConnectionImpl, ConnectionPtr, State,
};
pub use connection_socket::ConnectionSocket;
pub use filter::{FilterStatus, ReadFilter, WriteFilter};
pub use io_handle::{IoCallResult, IoError, IoErrorKind, IoHandle, IoHandleStream};
pub use io_socket_handle::IoSocketHandle;
pub use listener::{ListenerCallbacks, TcpListenerImpl};
pub use raw_buffer_socket::{RawBufferSocket, RawBufferSocketFactory};
pub use transport_socket::{
    IoResult, PostIoAction, TransportSocket, TransportSocketCallbacks, TransportSocketFactory,
};
