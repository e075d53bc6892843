//! Hooks for the protocol filters layered on top of a connection.

use super::Connection;
use crate::buffer::Buffer;

/// Whether the filter chain continues to the next filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// A filter on the read path of a connection.
pub trait ReadFilter {
    /// Called once, before the first data reaches this filter.
    fn on_new_connection(&mut self, _connection: &mut dyn Connection) -> FilterStatus {
        FilterStatus::Continue
    }

    /// Called with everything read so far. A filter that consumes data drains
    /// it from `data`; whatever is left stays buffered on the connection.
    fn on_data(
        &mut self,
        connection: &mut dyn Connection,
        data: &mut dyn Buffer,
        end_stream: bool,
    ) -> FilterStatus;
}

/// A filter on the write path of a connection.
pub trait WriteFilter {
    /// Called with data passed to
    /// [`Connection::write`](super::Connection::write) before it is buffered.
    fn on_write(&mut self, data: &mut dyn Buffer, end_stream: bool) -> FilterStatus;
}

struct ActiveReadFilter {
    filter: Box<dyn ReadFilter>,
    initialized: bool,
}

#[derive(Default)]
pub(crate) struct ReadFilterChain {
    filters: Vec<ActiveReadFilter>,
}

impl ReadFilterChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub(crate) fn add(&mut self, filter: Box<dyn ReadFilter>) {
        self.filters.push(ActiveReadFilter {
            filter,
            initialized: false,
        });
    }

    // Keeps the filters of `self` in front of those in `later`.
    pub(crate) fn append(&mut self, later: ReadFilterChain) {
        self.filters.extend(later.filters);
    }

    pub(crate) fn initialize(&mut self, connection: &mut dyn Connection) {
        for active in &mut self.filters {
            if active.initialized {
                continue;
            }
            active.initialized = true;
            if active.filter.on_new_connection(connection) == FilterStatus::StopIteration {
                return;
            }
        }
    }

    pub(crate) fn on_read(
        &mut self,
        connection: &mut dyn Connection,
        data: &mut dyn Buffer,
        end_stream: bool,
    ) {
        for active in &mut self.filters {
            if !active.initialized {
                active.initialized = true;
                if active.filter.on_new_connection(connection) == FilterStatus::StopIteration {
                    return;
                }
            }
            if active.filter.on_data(connection, data, end_stream) == FilterStatus::StopIteration {
                return;
            }
            if connection.state() == super::State::Closed {
                return;
            }
        }
    }
}

/// The read and write filter chains of one connection.
#[derive(Default)]
pub(crate) struct FilterManager {
    pub(crate) read_filters: ReadFilterChain,
    write_filters: Vec<Box<dyn WriteFilter>>,
}

impl FilterManager {
    pub(crate) fn add_write_filter(&mut self, filter: Box<dyn WriteFilter>) {
        self.write_filters.push(filter);
    }

    pub(crate) fn on_write(&mut self, data: &mut dyn Buffer, end_stream: bool) -> FilterStatus {
        for filter in &mut self.write_filters {
            if filter.on_write(data, end_stream) == FilterStatus::StopIteration {
                return FilterStatus::StopIteration;
            }
        }
        FilterStatus::Continue
    }
}
