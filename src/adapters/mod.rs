//! Transport adapter implementations
//!
//! This module contains implementations of the [`Transport`] trait,
//! providing low-level byte-stream I/O beneath the rack protocol. The
//! protocol layer owns no knowledge of the physical link; everything it
//! needs is a full-duplex stream with blocking read-with-timeout semantics.

#[cfg(feature = "instrument_serial")]
pub mod serial;

pub mod mock;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

use std::time::Duration;

use crate::error::RackResult;

/// Low-level byte stream beneath the rack protocol.
///
/// One transport instance corresponds to one physical link and is owned
/// exclusively by one [`crate::session::LinkSession`]. Concurrent opens of
/// the same physical port are refused at open time by the implementation,
/// not by the protocol layer.
///
/// `read` must return once `buf` is full **or** the configured timeout
/// elapses, whichever comes first; a short read signals a timeout to the
/// caller. It must never block past the timeout.
pub trait Transport: Send {
    /// Write the whole buffer to the link.
    fn write(&mut self, bytes: &[u8]) -> RackResult<()>;

    /// Read up to `buf.len()` bytes, returning how many arrived before the
    /// timeout elapsed.
    fn read(&mut self, buf: &mut [u8]) -> RackResult<usize>;

    /// The receive timeout this transport was configured with.
    fn timeout(&self) -> Duration;
}
