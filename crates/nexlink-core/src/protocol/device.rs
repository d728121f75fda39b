//! Device identity and facade
//!
//! [`DeviceIdentity`] decodes the `comok` handshake into typed fields.
//! [`Device`] bundles an identity with a [`ConnectionManager`] and offers
//! the common one-shot operations so callers rarely touch the connection
//! layer directly.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::connection::{
    ChannelOpener, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
    Subscription,
};
use super::response::ResponseFrame;
use super::upload;
use super::{ProtocolError, HANDSHAKE_MARKER, SIMULATOR_HANDSHAKE};

/// Where and how a device was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Port the device answered on
    pub port_name: String,
    /// Baud rate it answered at
    pub baud_rate: u32,
    /// Raw handshake reply, starting with `comok`
    pub handshake: String,
}

/// Typed fields of a `comok` handshake:
/// `comok <touch>,<address>,<model>,<firmware>,<mcu>,<serial>,<flash>[,...]`
///
/// Trailing fields beyond the seventh are ignored; newer firmware appends
/// to the handshake without breaking older hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Whether the panel has a touch layer
    pub touch_supported: bool,
    /// Reserved address field, verbatim
    pub address: String,
    /// Model designation, e.g. `NX4024T032_011R`
    pub model: String,
    /// Firmware version number
    pub firmware_version: u32,
    /// MCU identification code
    pub mcu_code: String,
    /// Device serial number
    pub serial_number: String,
    /// Flash size in bytes
    pub flash_size: u64,
    /// The raw handshake the fields were decoded from
    pub handshake: String,
}

impl DeviceIdentity {
    /// Decode a handshake reply
    pub fn parse(handshake: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedHandshake(handshake.to_string());

        let rest = handshake
            .strip_prefix(HANDSHAKE_MARKER)
            .ok_or_else(malformed)?
            .trim_start();
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() < 7 {
            return Err(malformed());
        }

        Ok(Self {
            touch_supported: fields[0] == "1",
            address: fields[1].to_string(),
            model: fields[2].to_string(),
            // Reserved by the protocol; some targets put non-numeric noise
            // here, which is not worth failing the whole handshake over
            firmware_version: fields[3].parse().unwrap_or(0),
            mcu_code: fields[4].to_string(),
            serial_number: fields[5].to_string(),
            flash_size: fields[6].parse().map_err(|_| malformed())?,
            handshake: handshake.to_string(),
        })
    }

    /// Whether this identity came from a simulator target rather than a
    /// physical panel
    pub fn is_simulator(&self) -> bool {
        self.handshake == SIMULATOR_HANDSHAKE
    }
}

/// A discovered or explicitly addressed device.
///
/// Cloning is cheap and every clone shares the same underlying connection.
#[derive(Clone)]
pub struct Device {
    identity: Arc<DeviceIdentity>,
    manager: ConnectionManager,
    port_name: String,
    baud_rate: u32,
}

impl Device {
    /// Device at a known port and baud rate, identified by its handshake
    pub fn new(port_name: &str, baud_rate: u32, handshake: &str) -> Result<Self, ProtocolError> {
        let identity = DeviceIdentity::parse(handshake)?;
        let simulator = identity.is_simulator();
        let manager = ConnectionManager::new(
            ConnectionConfig {
                port_name: port_name.to_string(),
                baud_rate,
                ..Default::default()
            },
            simulator,
        );
        Ok(Self {
            identity: Arc::new(identity),
            manager,
            port_name: port_name.to_string(),
            baud_rate,
        })
    }

    /// Device from a discovery hit
    pub fn from_discovery(result: &DiscoveryResult) -> Result<Self, ProtocolError> {
        Self::new(&result.port_name, result.baud_rate, &result.handshake)
    }

    /// Device with a caller-supplied channel factory
    pub fn with_opener(
        port_name: &str,
        baud_rate: u32,
        handshake: &str,
        opener: Box<ChannelOpener>,
    ) -> Result<Self, ProtocolError> {
        let identity = DeviceIdentity::parse(handshake)?;
        let simulator = identity.is_simulator();
        let manager = ConnectionManager::with_opener(
            ConnectionConfig {
                port_name: port_name.to_string(),
                baud_rate,
                ..Default::default()
            },
            simulator,
            opener,
        );
        Ok(Self {
            identity: Arc::new(identity),
            manager,
            port_name: port_name.to_string(),
            baud_rate,
        })
    }

    /// Decoded handshake fields
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Port the device lives on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Baud rate of the session
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Attach to the shared connection, opening it if necessary
    pub fn connect(&self) -> Result<Subscription, ProtocolError> {
        self.manager.subscribe()
    }

    /// Send one command and wait for the next frame the device produces.
    ///
    /// Frames already queued before the command is written are drained
    /// first, so a stale touch event is not mistaken for the answer.
    pub fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError> {
        let subscription = self.manager.subscribe()?;
        while subscription.try_recv().is_some() {}

        let sink = subscription.sink().ok_or(ProtocolError::NotConnected)?;
        debug!(command, "execute");
        sink.send(command)?;

        match subscription.recv_timeout(timeout)? {
            ConnectionEvent::Frame(frame) => Ok(frame),
            ConnectionEvent::Closed => Err(ProtocolError::NotConnected),
        }
    }

    /// Stream a firmware image to the device
    pub fn upload_firmware(&self, image: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        let subscription = self.manager.subscribe()?;
        upload::upload_firmware(&subscription, self.baud_rate, image, timeout)
    }

    /// Tear the connection down, cancelling every subscriber
    pub fn disconnect(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.manager.disconnect(timeout)
    }

    /// Wait for the connection to finish tearing down
    pub fn wait_until_disconnected(&self, timeout: Duration) -> bool {
        self.manager.wait_until_disconnected(timeout)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("port_name", &self.port_name)
            .field("baud_rate", &self.baud_rate)
            .field("model", &self.identity.model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HANDSHAKE: &str = "comok 1,30000-0,NX4024T032_011R,52,61488,D264B8204F0E1828,16777216";

    #[test]
    fn test_parse_handshake() {
        let identity = DeviceIdentity::parse(HANDSHAKE).unwrap();
        assert_eq!(identity.touch_supported, true);
        assert_eq!(identity.address, "30000-0");
        assert_eq!(identity.model, "NX4024T032_011R");
        assert_eq!(identity.firmware_version, 52);
        assert_eq!(identity.mcu_code, "61488");
        assert_eq!(identity.serial_number, "D264B8204F0E1828");
        assert_eq!(identity.flash_size, 16_777_216);
        assert!(!identity.is_simulator());
    }

    #[test]
    fn test_parse_simulator_handshake() {
        let identity = DeviceIdentity::parse(SIMULATOR_HANDSHAKE).unwrap();
        assert_eq!(identity.model, "simulator");
        assert!(identity.is_simulator());
    }

    #[test]
    fn test_parse_accepts_trailing_fields() {
        let extended = format!("{HANDSHAKE},reserved,future");
        let identity = DeviceIdentity::parse(&extended).unwrap();
        assert_eq!(identity.model, "NX4024T032_011R");
        assert_eq!(identity.flash_size, 16_777_216);
        assert_eq!(identity.handshake, extended);
    }

    #[test]
    fn test_parse_tolerates_reserved_firmware_field() {
        let identity = DeviceIdentity::parse("comok 1,0,m,beta,61488,abc,1024").unwrap();
        assert_eq!(identity.firmware_version, 0);
        assert_eq!(identity.flash_size, 1024);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            DeviceIdentity::parse("comok 1,2,3"),
            Err(ProtocolError::MalformedHandshake(_))
        ));
        assert!(matches!(
            DeviceIdentity::parse("hello"),
            Err(ProtocolError::MalformedHandshake(_))
        ));
        assert!(matches!(
            DeviceIdentity::parse("comok 1,0,m,0,0,0,notanumber"),
            Err(ProtocolError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_identity_json_roundtrip() {
        let identity = DeviceIdentity::parse(HANDSHAKE).unwrap();
        let json = serde_json::to_string(&identity).unwrap();
        let back: DeviceIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }

    #[test]
    fn test_device_from_discovery() {
        let result = DiscoveryResult {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            handshake: HANDSHAKE.to_string(),
        };
        let device = Device::from_discovery(&result).unwrap();
        assert_eq!(device.port_name(), "/dev/ttyUSB0");
        assert_eq!(device.baud_rate(), 115_200);
        assert_eq!(device.identity().model, "NX4024T032_011R");
        assert_eq!(device.state(), ConnectionState::Disconnected);
    }
}
