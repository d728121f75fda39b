//! # NexLink Core Library
//!
//! Client-side protocol stack for Nextion HMI touch displays.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port enumeration and device discovery across ports and baud rates
//! - Command encoding (single, broadcast, and atomic batches)
//! - Response framing and typed payload views
//! - A shared connection layer multiplexing one port across many consumers
//! - Scripted multi-step sessions, including TFT firmware upload
//!
//! ## Example
//!
//! ```rust,ignore
//! use nexlink_core::protocol::{find, Device, DiscoveryOptions};
//! use std::time::Duration;
//!
//! // Find a display on any port
//! let hit = find(&DiscoveryOptions::default())?.expect("no device");
//! let device = Device::from_discovery(&hit)?;
//!
//! // Switch to page 0 and read back a text attribute
//! device.execute("page 0", Duration::from_secs(1))?;
//! let reply = device.execute("get t0.txt", Duration::from_secs(1))?;
//! println!("t0.txt = {}", reply.string()?);
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        commands, encode, encode_batch, encode_broadcast, find, list_ports, upload_firmware,
        CommandSink, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
        Device, DeviceIdentity, DiscoveryOptions, DiscoveryResult, ProtocolError, ResponseCode,
        ResponseFrame, Session, SessionState, Subscription, TouchCoordinate, TouchEvent,
        Transition,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
