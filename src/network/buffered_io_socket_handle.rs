//! An in-memory socket endpoint for userspace pipes.
//!
//! Two endpoints are created together with [`BufferedIoSocketHandle::pair`].
//! Writing to one appends to the other's pending data, and readiness is
//! reported through a [`UserSpaceFileEvent`] instead of the kernel.

use super::{Address, IoCallResult, IoError, IoErrorKind, IoHandle};
use crate::buffer::{Buffer, WatermarkBuffer, WatermarkEvent};
use crate::event::{
    Dispatcher, FileEvent, FileReadyCb, Ready, UserSpaceFileEvent, UserSpaceFileEventRef,
};

use std::cell::RefCell;
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::rc::{Rc, Weak};
use tracing::trace;

/// The side of an endpoint its peer writes into.
pub trait WritablePeer {
    /// Marks that the peer will not write any more data.
    fn set_write_end(&mut self);

    fn is_write_end_set(&self) -> bool;

    /// Wakes the reader if data or end of stream is available.
    fn maybe_set_new_data(&mut self);

    /// Notifies that the peer is gone. The endpoint drops its reference to the
    /// peer and stops accepting writes of its own.
    fn on_peer_destroy(&mut self);

    /// Notifies that the peer's pending data fell below its low watermark.
    fn on_peer_buffer_writable(&mut self);

    /// Returns false while the pending data is above its high watermark.
    fn is_writable(&self) -> bool;

    /// The buffer the peer's writes land in.
    fn pending_data_for_write(&mut self) -> &mut WatermarkBuffer;
}

/// The side of an endpoint its owner reads from.
pub trait ReadableSource {
    /// Returns true once the peer shut down its write side.
    fn is_peer_shut_down_write(&self) -> bool;

    /// Returns true if a read would not return [`IoErrorKind::Again`].
    fn is_readable(&self) -> bool;
}

struct Endpoint {
    pending_received_data: WatermarkBuffer,
    writable_peer: Option<Weak<RefCell<Endpoint>>>,
    read_end_stream: bool,
    write_shutdown: bool,
    closed: bool,
    over_high_watermark: bool,
    file_event: Option<UserSpaceFileEventRef>,
}

/// One end of a userspace pipe.
pub struct BufferedIoSocketHandle {
    endpoint: Rc<RefCell<Endpoint>>,
}

impl fmt::Debug for BufferedIoSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = self.endpoint.borrow();
        f.debug_struct("BufferedIoSocketHandle")
            .field("pending", &endpoint.pending_received_data.len())
            .field("read_end_stream", &endpoint.read_end_stream)
            .field("write_shutdown", &endpoint.write_shutdown)
            .field("closed", &endpoint.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for BufferedIoSocketHandle {
    fn drop(&mut self) {
        // The peer sees end of stream as if this side closed.
        let _ = self.close();
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl BufferedIoSocketHandle {
    fn new(high_watermark: usize) -> Self {
        let mut pending_received_data = WatermarkBuffer::new();
        if high_watermark > 0 {
            pending_received_data.set_watermarks(high_watermark);
        }
        Self {
            endpoint: Rc::new(RefCell::new(Endpoint {
                pending_received_data,
                writable_peer: None,
                read_end_stream: false,
                write_shutdown: false,
                closed: false,
                over_high_watermark: false,
                file_event: None,
            })),
        }
    }

    /// Creates two endpoints that write into each other. A non-zero
    /// `high_watermark` bounds how much unread data each endpoint accepts
    /// before its peer sees [`IoErrorKind::Again`].
    pub fn pair(high_watermark: usize) -> (Self, Self) {
        let first = Self::new(high_watermark);
        let second = Self::new(high_watermark);
        first.endpoint.borrow_mut().writable_peer = Some(Rc::downgrade(&second.endpoint));
        second.endpoint.borrow_mut().writable_peer = Some(Rc::downgrade(&first.endpoint));
        (first, second)
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl BufferedIoSocketHandle {
    /// Marks end of stream for reads on this endpoint, as if the peer shut
    /// down its write side.
    pub fn set_write_end(&self) {
        self.endpoint.borrow_mut().set_write_end();
    }

    pub fn is_peer_shut_down_write(&self) -> bool {
        self.endpoint.borrow().is_peer_shut_down_write()
    }

    pub fn is_readable(&self) -> bool {
        self.endpoint.borrow().is_readable()
    }

    pub fn is_peer_writable(&self) -> bool {
        self.endpoint.borrow().is_peer_writable()
    }

    fn peer(&self) -> Option<Rc<RefCell<Endpoint>>> {
        self.endpoint
            .borrow()
            .writable_peer
            .as_ref()
            .and_then(Weak::upgrade)
    }

    // Checks whether a read left the pending data at or below the low
    // watermark, and if so tells the peer it may write again.
    fn after_read(&self) {
        let events = self
            .endpoint
            .borrow_mut()
            .pending_received_data
            .take_watermark_events();
        let mut resumed = false;
        for event in events {
            match event {
                WatermarkEvent::AboveHigh => self.endpoint.borrow_mut().over_high_watermark = true,
                WatermarkEvent::BelowLow => {
                    self.endpoint.borrow_mut().over_high_watermark = false;
                    resumed = true;
                }
            }
        }
        if resumed {
            if let Some(peer) = self.peer() {
                peer.borrow_mut().on_peer_buffer_writable();
            }
        }
    }

    fn check_readable(&self) -> IoCallResult<()> {
        let endpoint = self.endpoint.borrow();
        if endpoint.closed {
            return Err(IoError::new(IoErrorKind::InvalidArgument));
        }
        Ok(())
    }

    // Returns the peer if a write may proceed now.
    fn writable_peer(&self) -> IoCallResult<Rc<RefCell<Endpoint>>> {
        if self.endpoint.borrow().closed {
            return Err(IoError::new(IoErrorKind::InvalidArgument));
        }
        let Some(peer) = self.peer() else {
            return Err(IoError::new(IoErrorKind::InvalidArgument));
        };
        {
            let peer_ref = peer.borrow();
            if peer_ref.is_write_end_set() {
                return Err(IoError::new(IoErrorKind::InvalidArgument));
            }
            if !peer_ref.is_writable() {
                return Err(IoError::new(IoErrorKind::Again));
            }
        }
        Ok(peer)
    }

    fn deliver_to_peer(peer: &Rc<RefCell<Endpoint>>, write: impl FnOnce(&mut WatermarkBuffer)) {
        let mut peer = peer.borrow_mut();
        write(peer.pending_data_for_write());
        for event in peer.pending_received_data.take_watermark_events() {
            peer.over_high_watermark = event == WatermarkEvent::AboveHigh;
        }
        peer.maybe_set_new_data();
    }
}

// ============================================================================
// Endpoint Trait Implementations
// ============================================================================

impl Endpoint {
    fn is_peer_writable(&self) -> bool {
        self.writable_peer
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|peer| {
                let peer = peer.borrow();
                !peer.is_write_end_set() && peer.is_writable()
            })
    }

    fn readiness(&self) -> Ready {
        let mut ready = Ready::EMPTY;
        if self.is_readable() {
            ready |= Ready::READ;
        }
        if self.read_end_stream {
            ready |= Ready::CLOSED;
        }
        if self.is_peer_writable() {
            ready |= Ready::WRITE;
        }
        ready
    }
}

impl WritablePeer for Endpoint {
    fn set_write_end(&mut self) {
        self.read_end_stream = true;
    }

    fn is_write_end_set(&self) -> bool {
        self.read_end_stream
    }

    fn maybe_set_new_data(&mut self) {
        let mut events = Ready::READ;
        if self.read_end_stream {
            events |= Ready::CLOSED;
        }
        if let Some(file_event) = &self.file_event {
            file_event.activate(events);
        }
    }

    fn on_peer_destroy(&mut self) {
        self.writable_peer = None;
        self.write_shutdown = true;
    }

    fn on_peer_buffer_writable(&mut self) {
        if let Some(file_event) = &self.file_event {
            file_event.activate(Ready::WRITE);
        }
    }

    fn is_writable(&self) -> bool {
        !self.over_high_watermark
    }

    fn pending_data_for_write(&mut self) -> &mut WatermarkBuffer {
        &mut self.pending_received_data
    }
}

impl ReadableSource for Endpoint {
    fn is_peer_shut_down_write(&self) -> bool {
        self.read_end_stream
    }

    fn is_readable(&self) -> bool {
        self.read_end_stream || !self.pending_received_data.is_empty()
    }
}

// ============================================================================
// IoHandle Trait Implementation
// ============================================================================

impl IoHandle for BufferedIoSocketHandle {
    fn close(&mut self) -> IoCallResult<()> {
        if self.endpoint.borrow().closed {
            return Ok(());
        }
        if let Some(peer) = self.peer() {
            let mut peer = peer.borrow_mut();
            peer.set_write_end();
            peer.maybe_set_new_data();
            peer.on_peer_destroy();
        }
        let mut endpoint = self.endpoint.borrow_mut();
        endpoint.writable_peer = None;
        endpoint.closed = true;
        trace!("Closed userspace pipe endpoint");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.endpoint.borrow().closed
    }

    fn read(&mut self, buffer: &mut dyn Buffer, max_length: usize) -> IoCallResult<usize> {
        self.check_readable()?;
        let sz = {
            let mut endpoint = self.endpoint.borrow_mut();
            if endpoint.pending_received_data.is_empty() {
                return if endpoint.read_end_stream {
                    Ok(0)
                } else {
                    Err(IoError::new(IoErrorKind::Again))
                };
            }
            let sz = max_length.min(endpoint.pending_received_data.len());
            buffer.move_from_n(&mut endpoint.pending_received_data, sz);
            sz
        };
        self.after_read();
        Ok(sz)
    }

    fn readv(&mut self, max_length: usize, slices: &mut [IoSliceMut<'_>]) -> IoCallResult<usize> {
        self.check_readable()?;
        let sz = {
            let mut endpoint = self.endpoint.borrow_mut();
            if endpoint.pending_received_data.is_empty() {
                return if endpoint.read_end_stream {
                    Ok(0)
                } else {
                    Err(IoError::new(IoErrorKind::Again))
                };
            }
            let mut remaining = max_length.min(endpoint.pending_received_data.len());
            let mut copied = 0;
            for slice in slices.iter_mut() {
                if remaining == 0 {
                    break;
                }
                let len = slice.len().min(remaining);
                endpoint
                    .pending_received_data
                    .copy_out(copied, &mut slice[..len]);
                copied += len;
                remaining -= len;
            }
            endpoint.pending_received_data.drain(copied);
            copied
        };
        self.after_read();
        Ok(sz)
    }

    fn recv(&mut self, buf: &mut [u8], peek: bool) -> IoCallResult<usize> {
        self.check_readable()?;
        let sz = {
            let mut endpoint = self.endpoint.borrow_mut();
            if endpoint.pending_received_data.is_empty() {
                return if endpoint.read_end_stream {
                    Ok(0)
                } else {
                    Err(IoError::new(IoErrorKind::Again))
                };
            }
            let sz = buf.len().min(endpoint.pending_received_data.len());
            endpoint.pending_received_data.copy_out(0, &mut buf[..sz]);
            if !peek {
                endpoint.pending_received_data.drain(sz);
            }
            sz
        };
        if !peek {
            self.after_read();
        }
        Ok(sz)
    }

    fn write(&mut self, buffer: &mut dyn Buffer) -> IoCallResult<usize> {
        let peer = self.writable_peer()?;
        let sz = buffer.len();
        if sz == 0 {
            return Ok(0);
        }
        Self::deliver_to_peer(&peer, |pending| pending.move_from(buffer));
        trace!(len = sz, "Wrote to userspace pipe peer");
        Ok(sz)
    }

    fn writev(&mut self, slices: &[IoSlice<'_>]) -> IoCallResult<usize> {
        let peer = self.writable_peer()?;
        let sz: usize = slices.iter().map(|slice| slice.len()).sum();
        if sz == 0 {
            return Ok(0);
        }
        Self::deliver_to_peer(&peer, |pending| {
            for slice in slices {
                pending.add(slice);
            }
        });
        trace!(len = sz, "Wrote to userspace pipe peer");
        Ok(sz)
    }

    fn shutdown(&mut self, how: Shutdown) -> IoCallResult<()> {
        if how == Shutdown::Read {
            return Err(IoError::new(IoErrorKind::NotSupported));
        }
        if self.endpoint.borrow().write_shutdown {
            return Ok(());
        }
        if let Some(peer) = self.peer() {
            let mut peer = peer.borrow_mut();
            peer.set_write_end();
            peer.maybe_set_new_data();
        }
        self.endpoint.borrow_mut().write_shutdown = true;
        Ok(())
    }

    fn connect(&mut self, _address: &Address) -> IoCallResult<()> {
        // The pair is connected from the start.
        Ok(())
    }

    fn bind(&mut self, _address: &Address) -> IoCallResult<()> {
        Err(IoError::new(IoErrorKind::NotSupported))
    }

    fn local_address(&self) -> IoCallResult<Address> {
        Err(IoError::new(IoErrorKind::NotSupported))
    }

    fn peer_address(&self) -> IoCallResult<Address> {
        Err(IoError::new(IoErrorKind::NotSupported))
    }

    fn take_error(&mut self) -> IoCallResult<Option<IoError>> {
        Ok(None)
    }

    fn set_no_delay(&mut self, _enable: bool) -> IoCallResult<()> {
        Err(IoError::new(IoErrorKind::NotSupported))
    }

    fn create_file_event(
        &self,
        dispatcher: &Dispatcher,
        cb: FileReadyCb,
        events: Ready,
    ) -> Box<dyn FileEvent> {
        let weak = Rc::downgrade(&self.endpoint);
        let readiness = Box::new(move || {
            weak.upgrade()
                .map_or(Ready::EMPTY, |endpoint| endpoint.borrow().readiness())
        });
        let file_event = UserSpaceFileEvent::new(dispatcher, cb, events, readiness);
        self.endpoint.borrow_mut().file_event = Some(file_event.downgrade());
        Box::new(file_event)
    }
}
