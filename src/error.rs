//! Error types for the rack control library.
//!
//! All fallible operations in this crate return [`RackResult`], built on the
//! [`RackError`] enum. The variants mirror the distinct failure classes of
//! the shared-link protocol so callers can attach different retry policies
//! to each:
//!
//! - **`LinkLocked`**: the controller write protection has not been lifted
//!   yet. Recoverable: call [`crate::session::LinkSession::unlock`] first.
//! - **`LinkTimeout`**: no complete response within the transport timeout.
//!   Recoverable: the link stays usable and the caller may retry. A timeout
//!   never implies the hardware aborted whatever it was doing.
//! - **`LinkClosed`**: the session was explicitly closed; fatal to that
//!   session.
//! - **`MalformedFrame`**: a response failed to decode against the schema of
//!   the command that was sent. The link state is ambiguous afterwards, so
//!   this is surfaced and never silently retried.
//! - **`OutOfRange`**: a channel, address or value failed validation. Raised
//!   before any frame is written, so there is never a hardware side effect.
//! - **`NotReady`**: an asynchronous module operation has not completed yet.
//!   Not a failure the caller should abandon on; keep polling.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type RackResult<T> = std::result::Result<T, RackError>;

/// Errors raised by the rack link and its module drivers.
#[derive(Error, Debug)]
pub enum RackError {
    /// Module traffic was attempted before the controller was unlocked.
    #[error("link is locked; call unlock() after controller power-up")]
    LinkLocked,

    /// The transport produced no complete response within its timeout.
    #[error("no response from controller within {waited:?}")]
    LinkTimeout {
        /// How long the session waited before giving up.
        waited: Duration,
    },

    /// The session was closed; no further traffic is possible on it.
    #[error("link session is closed")]
    LinkClosed,

    /// A response did not match the schema of the command that was sent.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A channel, address or value was rejected before any frame was sent.
    #[error("{what} {value} out of range ({limit})")]
    OutOfRange {
        /// What was being validated, e.g. `"DAC channel"`.
        what: &'static str,
        /// The offending value, already formatted.
        value: String,
        /// Human-readable description of the accepted range.
        limit: &'static str,
    },

    /// A query was issued before an asynchronous operation completed.
    #[error("module operation still in progress")]
    NotReady,

    /// Failure opening or configuring the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error from the byte stream itself.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file or environment parsing error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RackError {
    /// Helper for `OutOfRange` with a displayable value.
    pub(crate) fn out_of_range(
        what: &'static str,
        value: impl std::fmt::Display,
        limit: &'static str,
    ) -> Self {
        RackError::OutOfRange {
            what,
            value: value.to_string(),
            limit,
        }
    }

    /// True for conditions the caller is expected to retry or poll through.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RackError::LinkLocked | RackError::LinkTimeout { .. } | RackError::NotReady
        )
    }
}
