//! # JRT Core Library
//!
//! Core functionality for talking to JRT laser distance sensors over USB serial.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Fixed command frames for the JRT M8xx binary protocol
//! - Response frame decoding, reassembly and classification
//! - Status code descriptions
//! - An asynchronous protocol engine publishing measurements to observers
//! - Connection lifecycle with the mandatory post-open settling delay
//!
//! ## Example
//!
//! ```rust,ignore
//! use jrt_core::prelude::*;
//!
//! let mut conn = SensorConnection::new(SystemDevices::new(), SensorConfig::default())?;
//! let mut measurements = conn.session().subscribe_measurement();
//!
//! if conn.connect().await? == ConnectionState::Connected {
//!     conn.engine().unwrap().request_single_shot().await?;
//!     measurements.changed().await?;
//!     println!("{:?}", *measurements.borrow());
//! }
//! conn.disconnect().await;
//! ```

pub mod config;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SensorConfig;
    pub use crate::protocol::{
        Command, ConnectionState, DeviceProvider, Diagnostic, Measurement, ProtocolEngine,
        ProtocolError, SensorConnection, Session, SystemDevices,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
