//! Byte buffers moved between I/O handles, transport sockets and filters.
//!
//! [`Buffer`] is the interface every layer works against. [`OwnedBuffer`] is
//! the plain implementation and [`WatermarkBuffer`] adds flow-control
//! notifications on top of it.

mod watermark;

pub use watermark::{WatermarkBuffer, WatermarkEvent};

use bytes::{Buf, BytesMut};
use std::fmt;

/// A contiguous byte buffer that data is appended to at the back and drained
/// from the front.
///
/// Moving data between buffers with [`Buffer::move_from`] hands over the
/// underlying storage when the destination is empty, so the common
/// read-then-forward path does not copy.
pub trait Buffer {
    /// Number of bytes currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All buffered bytes, front first.
    fn as_slice(&self) -> &[u8];

    /// Appends a copy of `data`.
    fn add(&mut self, data: &[u8]);

    /// Removes `size` bytes from the front. `size` must not exceed `len()`.
    fn drain(&mut self, size: usize);

    /// Removes and returns all buffered bytes.
    fn take(&mut self) -> BytesMut;

    /// Appends `data`, taking over its storage if this buffer is empty.
    fn append(&mut self, data: BytesMut);

    /// Reserves `len` writable bytes at the back and returns them.
    ///
    /// The reserved region is not part of the buffer until [`Buffer::commit`]
    /// is called with the number of bytes that were actually filled.
    fn reserve(&mut self, len: usize) -> &mut [u8];

    /// Keeps the first `used` bytes of the last reservation and releases the
    /// rest.
    fn commit(&mut self, used: usize);

    /// Moves all of `other` to the back of this buffer.
    fn move_from(&mut self, other: &mut dyn Buffer) {
        let data = other.take();
        self.append(data);
    }

    /// Moves up to `len` bytes from the front of `other` to the back of this
    /// buffer.
    fn move_from_n(&mut self, other: &mut dyn Buffer, len: usize) {
        let len = len.min(other.len());
        if len == other.len() {
            self.move_from(other);
        } else {
            self.add(&other.as_slice()[..len]);
            other.drain(len);
        }
    }

    /// Copies `dst.len()` bytes starting at `start` without draining them.
    fn copy_out(&self, start: usize, dst: &mut [u8]) {
        let end = start + dst.len();
        dst.copy_from_slice(&self.as_slice()[start..end]);
    }

    fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

/// A plain [`Buffer`] backed by [`BytesMut`].
#[derive(Default, Clone, PartialEq, Eq)]
pub struct OwnedBuffer {
    data: BytesMut,
    reserved: usize,
}

impl OwnedBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Buffer for OwnedBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn add(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn drain(&mut self, size: usize) {
        assert!(size <= self.data.len(), "drain past end of buffer");
        self.data.advance(size);
    }

    fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.data)
    }

    fn append(&mut self, data: BytesMut) {
        // Most appends land in an empty buffer, so take over the storage
        // instead of copying.
        if self.data.is_empty() {
            self.data = data;
        } else {
            self.data.extend_from_slice(&data);
        }
    }

    fn reserve(&mut self, len: usize) -> &mut [u8] {
        assert_eq!(self.reserved, 0, "previous reservation was not committed");
        let start = self.data.len();
        self.data.resize(start + len, 0);
        self.reserved = len;
        &mut self.data[start..]
    }

    fn commit(&mut self, used: usize) {
        assert!(used <= self.reserved, "committed more than reserved");
        let len = self.data.len() - (self.reserved - used);
        self.data.truncate(len);
        self.reserved = 0;
    }
}

impl From<&[u8]> for OwnedBuffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            reserved: 0,
        }
    }
}

impl From<&str> for OwnedBuffer {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes())
    }
}

impl From<Vec<u8>> for OwnedBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from(data.as_slice())
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
