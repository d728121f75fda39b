//! Protocol errors

use thiserror::Error;

use super::MAX_BATCH_SIZE;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A discovery scan is already running in this process
    #[error("discovery already in progress")]
    Busy,

    /// A bounded wait elapsed without the expected event
    #[error("operation timed out")]
    Timeout,

    /// The operation needs a live session and there is none
    #[error("not connected to a device")]
    NotConnected,

    /// The underlying serial link failed
    #[error("serial port error: {0}")]
    Transport(String),

    /// A handshake reply did not decode into device identity fields
    #[error("malformed handshake string: {0:?}")]
    MalformedHandshake(String),

    /// An encoded batch exceeded the atomic-write limit
    #[error("batch of {size} bytes exceeds the {MAX_BATCH_SIZE} byte limit")]
    BatchOverflow {
        /// Size the encoded batch would have had
        size: usize,
    },

    /// A session script referenced a state that was never registered
    #[error("unknown session state: {0:?}")]
    UnknownState(String),

    /// A typed payload view was requested for the wrong response code
    #[error("response code 0x{code:02X} has no {view} view")]
    WrongView {
        /// The frame's actual response code
        code: u8,
        /// Name of the requested view
        view: &'static str,
    },

    /// A command builder rejected its arguments
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),

    /// The device violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The API was used incorrectly by the caller
    #[error("usage error: {0}")]
    Usage(String),

    /// I/O failure outside the serial layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
