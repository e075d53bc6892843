use super::Address;
use crate::buffer::Buffer;
use crate::event::{Dispatcher, FileEvent, FileReadyCb, Ready};

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::Shutdown;
use thiserror::Error;

/// Result of a call on an [`IoHandle`].
pub type IoCallResult<T> = Result<T, IoError>;

/// The kind of a failed [`IoHandle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    /// The call would block. Retry after the next readiness notification.
    Again,
    /// A non-blocking connect has started.
    InProgress,
    InvalidArgument,
    NotSupported,
    AddressFamilyNotSupported,
    Permission,
    MessageTooBig,
    Interrupt,
    AddressNotAvailable,
    BadDescriptor,
    ConnectionReset,
    BrokenPipe,
    Unknown,
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoErrorKind::Again => "resource temporarily unavailable",
            IoErrorKind::InProgress => "operation in progress",
            IoErrorKind::InvalidArgument => "invalid argument",
            IoErrorKind::NotSupported => "operation not supported",
            IoErrorKind::AddressFamilyNotSupported => "address family not supported",
            IoErrorKind::Permission => "permission denied",
            IoErrorKind::MessageTooBig => "message too big",
            IoErrorKind::Interrupt => "interrupted",
            IoErrorKind::AddressNotAvailable => "address not available",
            IoErrorKind::BadDescriptor => "bad file descriptor",
            IoErrorKind::ConnectionReset => "connection reset",
            IoErrorKind::BrokenPipe => "broken pipe",
            IoErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// A failed [`IoHandle`] call, with the OS errno when there is one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind}")]
pub struct IoError {
    kind: IoErrorKind,
    errno: Option<i32>,
}

impl IoError {
    pub fn new(kind: IoErrorKind) -> Self {
        let errno = match kind {
            IoErrorKind::Again => Some(libc::EAGAIN),
            IoErrorKind::InProgress => Some(libc::EINPROGRESS),
            IoErrorKind::InvalidArgument => Some(libc::EINVAL),
            IoErrorKind::NotSupported => Some(libc::EOPNOTSUPP),
            IoErrorKind::AddressFamilyNotSupported => Some(libc::EAFNOSUPPORT),
            IoErrorKind::Permission => Some(libc::EACCES),
            IoErrorKind::MessageTooBig => Some(libc::EMSGSIZE),
            IoErrorKind::Interrupt => Some(libc::EINTR),
            IoErrorKind::AddressNotAvailable => Some(libc::EADDRNOTAVAIL),
            IoErrorKind::BadDescriptor => Some(libc::EBADF),
            IoErrorKind::ConnectionReset => Some(libc::ECONNRESET),
            IoErrorKind::BrokenPipe => Some(libc::EPIPE),
            IoErrorKind::Unknown => None,
        };
        Self { kind, errno }
    }

    pub fn kind(&self) -> IoErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn is_again(&self) -> bool {
        self.kind == IoErrorKind::Again
    }
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            let kind = match errno {
                libc::EAGAIN => IoErrorKind::Again,
                libc::EINPROGRESS => IoErrorKind::InProgress,
                libc::EINVAL => IoErrorKind::InvalidArgument,
                libc::EOPNOTSUPP => IoErrorKind::NotSupported,
                libc::EAFNOSUPPORT => IoErrorKind::AddressFamilyNotSupported,
                libc::EACCES | libc::EPERM => IoErrorKind::Permission,
                libc::EMSGSIZE => IoErrorKind::MessageTooBig,
                libc::EINTR => IoErrorKind::Interrupt,
                libc::EADDRNOTAVAIL => IoErrorKind::AddressNotAvailable,
                libc::EBADF => IoErrorKind::BadDescriptor,
                libc::ECONNRESET => IoErrorKind::ConnectionReset,
                libc::EPIPE => IoErrorKind::BrokenPipe,
                _ => IoErrorKind::Unknown,
            };
            return Self {
                kind,
                errno: Some(errno),
            };
        }

        let kind = match err.kind() {
            io::ErrorKind::WouldBlock => IoErrorKind::Again,
            io::ErrorKind::InvalidInput => IoErrorKind::InvalidArgument,
            io::ErrorKind::Unsupported => IoErrorKind::NotSupported,
            io::ErrorKind::PermissionDenied => IoErrorKind::Permission,
            io::ErrorKind::Interrupted => IoErrorKind::Interrupt,
            io::ErrorKind::AddrNotAvailable => IoErrorKind::AddressNotAvailable,
            io::ErrorKind::ConnectionReset => IoErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe => IoErrorKind::BrokenPipe,
            _ => IoErrorKind::Unknown,
        };
        Self::new(kind)
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        match (err.kind, err.errno) {
            (IoErrorKind::Again, _) => io::Error::from(io::ErrorKind::WouldBlock),
            (_, Some(errno)) => io::Error::from_raw_os_error(errno),
            (_, None) => io::Error::other(err),
        }
    }
}

/// Something bytes can be read from and written to: a kernel socket or an
/// in-memory endpoint.
///
/// All calls are non-blocking. [`IoErrorKind::Again`] means the call would
/// block and should be retried after the next readiness notification.
pub trait IoHandle {
    fn close(&mut self) -> IoCallResult<()>;

    fn is_open(&self) -> bool;

    /// Reads at most `max_length` bytes to the back of `buffer`. `Ok(0)` is
    /// end of stream.
    fn read(&mut self, buffer: &mut dyn Buffer, max_length: usize) -> IoCallResult<usize>;

    /// Reads at most `max_length` bytes into `slices`, in order.
    fn readv(&mut self, max_length: usize, slices: &mut [IoSliceMut<'_>]) -> IoCallResult<usize>;

    /// Reads into `buf`. With `peek` the data stays available for the next
    /// read.
    fn recv(&mut self, buf: &mut [u8], peek: bool) -> IoCallResult<usize>;

    /// Writes from the front of `buffer` and drains what was written.
    fn write(&mut self, buffer: &mut dyn Buffer) -> IoCallResult<usize>;

    fn writev(&mut self, slices: &[IoSlice<'_>]) -> IoCallResult<usize>;

    fn shutdown(&mut self, how: Shutdown) -> IoCallResult<()>;

    fn connect(&mut self, address: &Address) -> IoCallResult<()>;

    fn bind(&mut self, address: &Address) -> IoCallResult<()>;

    fn local_address(&self) -> IoCallResult<Address>;

    fn peer_address(&self) -> IoCallResult<Address>;

    /// Returns and clears the pending socket error, if any.
    fn take_error(&mut self) -> IoCallResult<Option<IoError>>;

    fn set_no_delay(&mut self, enable: bool) -> IoCallResult<()>;

    /// Registers for readiness notifications on this handle.
    fn create_file_event(
        &self,
        dispatcher: &Dispatcher,
        cb: FileReadyCb,
        events: Ready,
    ) -> Box<dyn FileEvent>;
}

/// Adapts an [`IoHandle`] to [`std::io::Read`] and [`std::io::Write`].
pub struct IoHandleStream<'a>(pub &'a mut dyn IoHandle);

impl io::Read for IoHandleStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf, false).map_err(io::Error::from)
    }
}

impl io::Write for IoHandleStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.writev(&[IoSlice::new(buf)]).map_err(io::Error::from)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.0.writev(bufs).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
