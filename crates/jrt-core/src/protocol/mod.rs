//! Serial Protocol Communication
//!
//! Implements the JRT M8xx laser rangefinder binary protocol.
//!
//! Commands are fixed byte patterns. Responses start with a success (`AA`) or
//! error (`EE`) header and carry a register byte identifying their content.

mod codec;
pub mod commands;
mod connection;
mod engine;
mod error;
pub mod frame;
pub mod serial;
mod session;
pub mod status;

pub use codec::{ChunkCodec, FrameAssembler, Inbound, InboundCodec, DEFAULT_MAX_PAYLOAD_WORDS};
pub use commands::Command;
pub use connection::{ConnectionState, SensorConnection};
pub use engine::{ProtocolEngine, ReadLoop};
pub use error::{FrameError, ProtocolError};
pub use frame::{Frame, Measurement, Response};
pub use serial::{list_ports, DeviceProvider, PortInfo, SerialSettings, SystemDevices};
pub use session::{Diagnostic, LinkStats, Session};

/// Serial baud rate used by the sensor (fixed)
pub const BAUD_RATE: u32 = 115200;

/// Header token of a successful response
pub const HEADER_SUCCESS: &str = "AA";

/// Header token of an error response
pub const HEADER_ERROR: &str = "EE";

/// Register token of a status response
pub const REGISTER_STATUS: &str = "00";

/// Register token of a distance measurement response
pub const REGISTER_DISTANCE: &str = "22";

/// Register token of the laser control echo
pub const REGISTER_LASER: &str = "BE";

/// Status code reported with every successful measurement
pub const STATUS_NO_ERROR: &str = "0000";

/// Default write timeout in milliseconds
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 100;

/// Delay between opening the port and sending the handshake, in milliseconds.
/// The sensor drops commands received before it has settled.
pub const DEFAULT_SETTLING_DELAY_MS: u64 = 1000;
