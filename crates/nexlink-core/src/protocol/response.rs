//! Device responses
//!
//! The response-code catalogue and the parsed frame type with its guarded
//! payload views. Views are derived on demand, never stored; reading a view
//! whose code family does not match is a [`ProtocolError::WrongView`].

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;

use super::{CommandSink, ProtocolError};

/// Catalogue of device-to-host response codes.
///
/// A static table with explicit byte values; display names come from
/// [`ResponseCode::name`], not from runtime introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// The instruction was not recognized
    InvalidInstruction = 0x00,
    /// The instruction executed successfully
    Success = 0x01,
    /// A referenced component id does not exist
    InvalidComponentId = 0x02,
    /// A referenced page id does not exist
    InvalidPageId = 0x03,
    /// A referenced picture id does not exist
    InvalidPictureId = 0x04,
    /// A referenced font id does not exist
    InvalidFontId = 0x05,
    /// A file or microSD operation failed
    InvalidFileOperation = 0x06,
    /// CRC verification failed
    InvalidCrc = 0x09,
    /// A baud rate setting was rejected
    InvalidBaudRate = 0x11,
    /// A waveform id or channel was rejected
    InvalidWaveformId = 0x12,
    /// A variable name or attribute was rejected
    InvalidVariable = 0x1A,
    /// An operation on a variable was rejected
    InvalidVariableOperation = 0x1B,
    /// An attribute assignment failed
    AssignmentFailed = 0x1C,
    /// An EEPROM operation failed
    EepromFailed = 0x1D,
    /// The instruction carried the wrong number of parameters
    InvalidParameterCount = 0x1E,
    /// A GPIO operation failed
    IoOperationFailed = 0x1F,
    /// An escaped character was not understood
    InvalidEscapeCharacter = 0x20,
    /// A variable name exceeded the device limit
    VariableNameTooLong = 0x23,
    /// The device's serial receive buffer overflowed
    SerialBufferOverflow = 0x24,
    /// A component was pressed or released
    TouchEvent = 0x65,
    /// The current page number, reported after a page change or `sendme`
    CurrentPage = 0x66,
    /// A raw touch coordinate while awake
    TouchCoordinate = 0x67,
    /// A raw touch coordinate while asleep
    TouchCoordinateSleep = 0x68,
    /// A string attribute value
    StringData = 0x70,
    /// A numeric attribute value
    NumericData = 0x71,
    /// The device entered sleep mode on its own
    AutoSleep = 0x86,
    /// The device left sleep mode on its own
    AutoWake = 0x87,
    /// The device powered up and is ready
    Ready = 0x88,
    /// A firmware upgrade from microSD began
    StartMicroSdUpgrade = 0x89,
    /// A transparent data transfer completed
    TransparentDataFinished = 0xFD,
    /// The device is ready to receive transparent data
    TransparentDataReady = 0xFE,
}

impl ResponseCode {
    /// Look up a catalogue entry by its byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        use ResponseCode::*;
        Some(match byte {
            0x00 => InvalidInstruction,
            0x01 => Success,
            0x02 => InvalidComponentId,
            0x03 => InvalidPageId,
            0x04 => InvalidPictureId,
            0x05 => InvalidFontId,
            0x06 => InvalidFileOperation,
            0x09 => InvalidCrc,
            0x11 => InvalidBaudRate,
            0x12 => InvalidWaveformId,
            0x1A => InvalidVariable,
            0x1B => InvalidVariableOperation,
            0x1C => AssignmentFailed,
            0x1D => EepromFailed,
            0x1E => InvalidParameterCount,
            0x1F => IoOperationFailed,
            0x20 => InvalidEscapeCharacter,
            0x23 => VariableNameTooLong,
            0x24 => SerialBufferOverflow,
            0x65 => TouchEvent,
            0x66 => CurrentPage,
            0x67 => TouchCoordinate,
            0x68 => TouchCoordinateSleep,
            0x70 => StringData,
            0x71 => NumericData,
            0x86 => AutoSleep,
            0x87 => AutoWake,
            0x88 => Ready,
            0x89 => StartMicroSdUpgrade,
            0xFD => TransparentDataFinished,
            0xFE => TransparentDataReady,
            _ => return None,
        })
    }

    /// The code's byte value
    pub fn byte(&self) -> u8 {
        *self as u8
    }

    /// Human-readable name for logs and diagnostics
    pub fn name(&self) -> &'static str {
        use ResponseCode::*;
        match self {
            InvalidInstruction => "invalid instruction",
            Success => "success",
            InvalidComponentId => "invalid component id",
            InvalidPageId => "invalid page id",
            InvalidPictureId => "invalid picture id",
            InvalidFontId => "invalid font id",
            InvalidFileOperation => "invalid file operation",
            InvalidCrc => "invalid crc",
            InvalidBaudRate => "invalid baud rate",
            InvalidWaveformId => "invalid waveform id",
            InvalidVariable => "invalid variable",
            InvalidVariableOperation => "invalid variable operation",
            AssignmentFailed => "assignment failed",
            EepromFailed => "eeprom operation failed",
            InvalidParameterCount => "invalid parameter count",
            IoOperationFailed => "io operation failed",
            InvalidEscapeCharacter => "invalid escape character",
            VariableNameTooLong => "variable name too long",
            SerialBufferOverflow => "serial buffer overflow",
            TouchEvent => "touch event",
            CurrentPage => "current page",
            TouchCoordinate => "touch coordinate",
            TouchCoordinateSleep => "touch coordinate (sleep)",
            StringData => "string data",
            NumericData => "numeric data",
            AutoSleep => "entered sleep",
            AutoWake => "left sleep",
            Ready => "device ready",
            StartMicroSdUpgrade => "microsd upgrade started",
            TransparentDataFinished => "transparent data finished",
            TransparentDataReady => "transparent data ready",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.byte(), self.name())
    }
}

/// A touch coordinate report (codes 0x67/0x68)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchCoordinate {
    /// Horizontal position in pixels
    pub x: u16,
    /// Vertical position in pixels
    pub y: u16,
    /// True on press, false on release
    pub pressed: bool,
}

/// A touch press/release on a component (code 0x65)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchEvent {
    /// Page the component lives on
    pub page: u8,
    /// Component id within the page
    pub component: u8,
    /// True on press, false on release
    pub pressed: bool,
}

/// One parsed protocol unit: a response code, its raw payload, and a
/// back-reference to the transport that produced it so a handler can write
/// commands back without re-resolving the connection.
#[derive(Clone)]
pub struct ResponseFrame {
    code: u8,
    payload: Vec<u8>,
    sink: CommandSink,
}

impl ResponseFrame {
    /// Frame from a parsed code, payload, and the producing transport
    pub fn new(code: u8, payload: Vec<u8>, sink: CommandSink) -> Self {
        Self {
            code,
            payload,
            sink,
        }
    }

    /// Raw response-code byte
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Catalogue entry for the code, when it is a known one
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_byte(self.code)
    }

    /// Two-digit hex rendering of the code
    pub fn code_hex(&self) -> String {
        format!("{:02X}", self.code)
    }

    /// Raw payload bytes between the code and the terminator
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Handle for writing commands back on the producing transport
    pub fn sink(&self) -> &CommandSink {
        &self.sink
    }

    fn guard(&self, expected: &[u8], view: &'static str) -> Result<(), ProtocolError> {
        if expected.contains(&self.code) {
            Ok(())
        } else {
            Err(ProtocolError::WrongView {
                code: self.code,
                view,
            })
        }
    }

    /// ASCII string payload (code 0x70)
    pub fn string(&self) -> Result<String, ProtocolError> {
        self.guard(&[ResponseCode::StringData.byte()], "string")?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Little-endian 32-bit signed integer payload (code 0x71)
    pub fn number(&self) -> Result<i32, ProtocolError> {
        self.guard(&[ResponseCode::NumericData.byte()], "number")?;
        if self.payload.len() < 4 {
            return Err(ProtocolError::Protocol(format!(
                "numeric payload is {} bytes, expected 4",
                self.payload.len()
            )));
        }
        Ok(LittleEndian::read_i32(&self.payload[..4]))
    }

    /// Touch coordinate with pressed flag (codes 0x67/0x68)
    pub fn touch_coordinate(&self) -> Result<TouchCoordinate, ProtocolError> {
        self.guard(
            &[
                ResponseCode::TouchCoordinate.byte(),
                ResponseCode::TouchCoordinateSleep.byte(),
            ],
            "touch coordinate",
        )?;
        if self.payload.len() < 5 {
            return Err(ProtocolError::Protocol(format!(
                "touch coordinate payload is {} bytes, expected 5",
                self.payload.len()
            )));
        }
        Ok(TouchCoordinate {
            x: BigEndian::read_u16(&self.payload[0..2]),
            y: BigEndian::read_u16(&self.payload[2..4]),
            pressed: self.payload[4] != 0,
        })
    }

    /// Touch event on a component (code 0x65)
    pub fn touch_event(&self) -> Result<TouchEvent, ProtocolError> {
        self.guard(&[ResponseCode::TouchEvent.byte()], "touch event")?;
        if self.payload.len() < 3 {
            return Err(ProtocolError::Protocol(format!(
                "touch event payload is {} bytes, expected 3",
                self.payload.len()
            )));
        }
        Ok(TouchEvent {
            page: self.payload[0],
            component: self.payload[1],
            pressed: self.payload[2] != 0,
        })
    }

    /// Current page number (code 0x66)
    pub fn page(&self) -> Result<u8, ProtocolError> {
        self.guard(&[ResponseCode::CurrentPage.byte()], "page")?;
        self.payload.first().copied().ok_or_else(|| {
            ProtocolError::Protocol("current page payload is empty".to_string())
        })
    }
}

impl fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .response_code()
            .map(|c| c.name())
            .unwrap_or("unknown code");
        f.debug_struct("ResponseFrame")
            .field("code", &format_args!("0x{:02X} ({})", self.code, name))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
