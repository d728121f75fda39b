//! Response framing
//!
//! Splits the raw byte stream into protocol units. The wire format has no
//! length prefix; a frame ends at three consecutive 0xFF bytes, the first
//! byte is the response code, and everything in between is payload.
//!
//! During a firmware upload the device abandons general framing and speaks
//! single flow-control bytes, so the accumulator has a second mode for that
//! phase.

use tracing::trace;

use super::{FLOW_CONTROL_BYTE, TERMINATOR};

/// Parsing behavior of the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Terminator-delimited response frames
    Standard,
    /// Single-byte flow control; any byte other than 0x05 means the device
    /// has left upload mode
    FirmwareUpload,
}

/// An unparsed frame: code byte plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// First byte of the unit, the response code
    pub code: u8,
    /// Bytes between the code and the terminator
    pub payload: Vec<u8>,
}

/// Accumulates appended bytes and yields complete frames in order, without
/// losing or duplicating bytes across calls.
///
/// The buffer is only split once a complete terminator sits at the very end
/// of the most recent append; partial terminators straddling two reads are
/// never split prematurely. Trailing bytes that never complete a terminator
/// stay buffered until more data arrives or the connection closes.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    mode: ParseMode,
}

impl FrameAccumulator {
    /// Empty accumulator in standard framing mode
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            mode: ParseMode::Standard,
        }
    }

    /// Current parsing mode
    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Switch to firmware-upload parsing; any partially buffered frame is
    /// discarded since the device is no longer speaking the framed protocol
    pub fn enter_upload_mode(&mut self) {
        self.buf.clear();
        self.mode = ParseMode::FirmwareUpload;
    }

    /// Return to standard framing
    pub fn exit_upload_mode(&mut self) {
        self.mode = ParseMode::Standard;
    }

    /// Bytes currently buffered awaiting a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and return every frame completed by this append
    pub fn push(&mut self, bytes: &[u8]) -> Vec<RawFrame> {
        match self.mode {
            ParseMode::Standard => {
                self.buf.extend_from_slice(bytes);
                self.split_ready()
            }
            ParseMode::FirmwareUpload => {
                let mut frames = Vec::new();
                for (i, &byte) in bytes.iter().enumerate() {
                    if byte == FLOW_CONTROL_BYTE {
                        frames.push(RawFrame {
                            code: FLOW_CONTROL_BYTE,
                            payload: Vec::new(),
                        });
                    } else {
                        // Device left upload mode; surface the stray byte as
                        // a code-only frame and resume standard framing on
                        // the remainder.
                        trace!(byte, "upload mode exited");
                        self.mode = ParseMode::Standard;
                        frames.push(RawFrame {
                            code: byte,
                            payload: Vec::new(),
                        });
                        frames.extend(self.push(&bytes[i + 1..]));
                        break;
                    }
                }
                frames
            }
        }
    }

    fn split_ready(&mut self) -> Vec<RawFrame> {
        if self.buf.len() < TERMINATOR.len() || !self.buf.ends_with(&TERMINATOR) {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i + TERMINATOR.len() <= self.buf.len() {
            if self.buf[i..i + TERMINATOR.len()] == TERMINATOR {
                let unit = &self.buf[start..i];
                // A bare terminator with no code byte is not a valid frame
                if !unit.is_empty() {
                    frames.push(RawFrame {
                        code: unit[0],
                        payload: unit[1..].to_vec(),
                    });
                }
                i += TERMINATOR.len();
                start = i;
            } else {
                i += 1;
            }
        }
        // Bytes past the last matched terminator stay buffered; a run of
        // four or more 0xFF leaves a partial terminator behind
        self.buf.drain(..start);
        frames
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
