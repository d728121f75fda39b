//! Nextion Serial Protocol
//!
//! Client side of the Nextion HMI binary response protocol: port/baud
//! discovery, command encoding, response framing, the shared connection
//! layer, and the scripted session machine used for firmware upload.

pub mod codec;
pub mod commands;
mod connection;
mod device;
mod discovery;
mod error;
pub mod framing;
pub mod response;
pub mod serial;
mod session;
pub mod transport;
mod upload;

pub use codec::{encode, encode_batch, encode_broadcast};
pub use connection::{
    ChannelOpener, CommandSink, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectionState, Subscription,
};
pub use device::{Device, DeviceIdentity, DiscoveryResult};
pub use discovery::{find, find_with_opener, DiscoveryOptions, ProbeOpener};
pub use error::ProtocolError;
pub use framing::{FrameAccumulator, ParseMode};
pub use response::{ResponseCode, ResponseFrame, TouchCoordinate, TouchEvent};
pub use serial::{list_ports, open_port, PortInfo};
pub use session::{Session, SessionState, Transition};
pub use transport::{Channel, LoopbackChannel, SerialChannel};
pub use upload::upload_firmware;

/// Three 0xFF bytes marking the end of every protocol unit in both directions
pub const TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Device-sent byte during firmware upload signaling readiness for a block
pub const FLOW_CONTROL_BYTE: u8 = 0x05;

/// Fixed firmware upload block size in bytes
pub const UPLOAD_BLOCK_SIZE: usize = 4096;

/// Protocol-native upload speed, advertised in the `whmi-wri` command
pub const UPLOAD_BAUD: u32 = 921_600;

/// Upper bound on an encoded batch write
pub const MAX_BATCH_SIZE: usize = 1024;

/// Baud rates probed during discovery, fastest protocol-native speed first
pub const DEFAULT_BAUD_RATES: [u32; 6] = [921_600, 115_200, 57_600, 38_400, 19_200, 9_600];

/// Default baud rate when constructing a device without discovery
pub const DEFAULT_BAUD_RATE: u32 = 9_600;

/// Default timeout for command responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Marker prefix of the handshake reply identifying a device
pub const HANDSHAKE_MARKER: &str = "comok";

/// Single-byte reply some simulator targets send instead of a handshake
pub const SIMULATOR_HANDSHAKE_BYTE: u8 = 26;

/// Canonical handshake synthesized for simulator targets
pub const SIMULATOR_HANDSHAKE: &str = "comok 1,0,simulator,0,0,0,16777216";

/// Benign nonsense command used as a wake-up probe during discovery
pub const DECOY_COMMAND: &str = "DRAKJHSUYDGBNCJHGJKSHBDN";
