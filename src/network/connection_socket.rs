use super::{Address, IoHandle};

/// An I/O handle together with the addresses of both ends, ready to be
/// wrapped in a connection.
pub struct ConnectionSocket {
    io_handle: Box<dyn IoHandle>,
    local_address: Address,
    remote_address: Address,
    local_address_restored: bool,
}

impl ConnectionSocket {
    pub fn new(io_handle: Box<dyn IoHandle>, local_address: Address, remote_address: Address) -> Self {
        Self {
            io_handle,
            local_address,
            remote_address,
            local_address_restored: false,
        }
    }

    /// Replaces the local address with the original destination of a
    /// redirected connection.
    pub fn restore_local_address(&mut self, local_address: Address) {
        self.local_address = local_address;
        self.local_address_restored = true;
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote_address
    }

    pub fn local_address_restored(&self) -> bool {
        self.local_address_restored
    }

    pub fn io_handle(&self) -> &dyn IoHandle {
        self.io_handle.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Box<dyn IoHandle>, Address, Address, bool) {
        (
            self.io_handle,
            self.local_address,
            self.remote_address,
            self.local_address_restored,
        )
    }
}
