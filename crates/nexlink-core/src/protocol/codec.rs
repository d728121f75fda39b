//! Command encoding
//!
//! Turns command strings into terminated wire frames:
//! - unicast: `<ASCII bytes> FF FF FF`
//! - broadcast: `FF FF <ASCII bytes> FF FF FF` (accepted even while the
//!   device is in two-byte addressing mode)
//! - batch: `com_stop` frame, each item's frame, `com_star` frame, as one
//!   buffer bounded by [`MAX_BATCH_SIZE`]
//!
//! Encoding is pure; the single atomic write happens in the connection
//! layer under the per-port write lock.

use super::{ProtocolError, MAX_BATCH_SIZE, TERMINATOR};

/// Command halting instruction execution, opening a batch
pub const BATCH_OPEN_COMMAND: &str = "com_stop";

/// Command resuming instruction execution, closing a batch
pub const BATCH_CLOSE_COMMAND: &str = "com_star";

/// Encode a single command as a unicast frame
pub fn encode(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(&TERMINATOR);
    bytes
}

/// Encode a command with the two-byte leading terminator so the device
/// accepts it regardless of addressing mode
pub fn encode_broadcast(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + 2 + TERMINATOR.len());
    bytes.extend_from_slice(&[0xFF, 0xFF]);
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(&TERMINATOR);
    bytes
}

/// Encode a batch of commands bracketed by the stop/star sentinels.
///
/// Fails fast with [`ProtocolError::BatchOverflow`] when the encoded buffer
/// would exceed [`MAX_BATCH_SIZE`]; callers must pre-chunk larger batches.
pub fn encode_batch(commands: &[&str]) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = encode(BATCH_OPEN_COMMAND);
    for command in commands {
        bytes.extend_from_slice(&encode(command));
    }
    bytes.extend_from_slice(&encode(BATCH_CLOSE_COMMAND));

    if bytes.len() > MAX_BATCH_SIZE {
        return Err(ProtocolError::BatchOverflow { size: bytes.len() });
    }
    Ok(bytes)
}
