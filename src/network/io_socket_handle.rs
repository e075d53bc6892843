use super::{Address, IoCallResult, IoError, IoErrorKind, IoHandle};
use crate::buffer::Buffer;
use crate::error::Error;
use crate::event::{Dispatcher, FileEvent, FileReadyCb, Ready};

use mio::net::TcpStream;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use tracing::trace;

/// An [`IoHandle`] over a non-blocking kernel TCP socket.
#[derive(Debug)]
pub struct IoSocketHandle {
    stream: Option<TcpStream>,
}

// ============================================================================
// Constructors
// ============================================================================

impl IoSocketHandle {
    /// Wraps an accepted or already connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Creates an unconnected non-blocking socket of the right family for
    /// `address`.
    pub fn for_address(address: &SocketAddr) -> Result<Self, Error> {
        let socket = Socket::new(Domain::for_address(*address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        Ok(Self::new(stream))
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl IoSocketHandle {
    fn stream(&self) -> IoCallResult<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| IoError::new(IoErrorKind::BadDescriptor))
    }

    fn stream_mut(&mut self) -> IoCallResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| IoError::new(IoErrorKind::BadDescriptor))
    }
}

// ============================================================================
// IoHandle Trait Implementation
// ============================================================================

impl IoHandle for IoSocketHandle {
    fn close(&mut self) -> IoCallResult<()> {
        if let Some(stream) = self.stream.take() {
            trace!(fd = stream.as_raw_fd(), "Closing socket");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self, buffer: &mut dyn Buffer, max_length: usize) -> IoCallResult<usize> {
        let stream = self.stream_mut()?;
        let result = stream.read(buffer.reserve(max_length));
        match result {
            Ok(sz) => {
                buffer.commit(sz);
                Ok(sz)
            }
            Err(err) => {
                buffer.commit(0);
                Err(err.into())
            }
        }
    }

    fn readv(&mut self, max_length: usize, slices: &mut [IoSliceMut<'_>]) -> IoCallResult<usize> {
        let stream = self.stream_mut()?;
        let mut remaining = max_length;
        let mut limited = Vec::with_capacity(slices.len());
        for slice in slices.iter_mut() {
            if remaining == 0 {
                break;
            }
            let len = slice.len().min(remaining);
            remaining -= len;
            limited.push(IoSliceMut::new(&mut slice[..len]));
        }
        Ok(stream.read_vectored(&mut limited)?)
    }

    fn recv(&mut self, buf: &mut [u8], peek: bool) -> IoCallResult<usize> {
        let stream = self.stream_mut()?;
        if peek {
            Ok(stream.peek(buf)?)
        } else {
            Ok(stream.read(buf)?)
        }
    }

    fn write(&mut self, buffer: &mut dyn Buffer) -> IoCallResult<usize> {
        let stream = self.stream_mut()?;
        let sz = stream.write(buffer.as_slice())?;
        buffer.drain(sz);
        Ok(sz)
    }

    fn writev(&mut self, slices: &[IoSlice<'_>]) -> IoCallResult<usize> {
        let stream = self.stream_mut()?;
        Ok(stream.write_vectored(slices)?)
    }

    fn shutdown(&mut self, how: Shutdown) -> IoCallResult<()> {
        Ok(self.stream()?.shutdown(how)?)
    }

    fn connect(&mut self, address: &Address) -> IoCallResult<()> {
        let Some(addr) = address.ip() else {
            return Err(IoError::new(IoErrorKind::AddressFamilyNotSupported));
        };
        let stream = self.stream()?;
        match SockRef::from(stream).connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                Err(IoError::new(IoErrorKind::InProgress))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn bind(&mut self, address: &Address) -> IoCallResult<()> {
        let Some(addr) = address.ip() else {
            return Err(IoError::new(IoErrorKind::AddressFamilyNotSupported));
        };
        let stream = self.stream()?;
        Ok(SockRef::from(stream).bind(&addr.into())?)
    }

    fn local_address(&self) -> IoCallResult<Address> {
        Ok(Address::Ip(self.stream()?.local_addr()?))
    }

    fn peer_address(&self) -> IoCallResult<Address> {
        Ok(Address::Ip(self.stream()?.peer_addr()?))
    }

    fn take_error(&mut self) -> IoCallResult<Option<IoError>> {
        Ok(self.stream()?.take_error()?.map(IoError::from))
    }

    fn set_no_delay(&mut self, enable: bool) -> IoCallResult<()> {
        Ok(self.stream()?.set_nodelay(enable)?)
    }

    fn create_file_event(
        &self,
        dispatcher: &Dispatcher,
        cb: FileReadyCb,
        events: Ready,
    ) -> Box<dyn FileEvent> {
        let fd = self
            .stream
            .as_ref()
            .expect("File event requested on a closed socket")
            .as_raw_fd();
        dispatcher.create_file_event(fd, cb, events)
    }
}
