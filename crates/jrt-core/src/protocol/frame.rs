//! Response frame decoding
//!
//! Frames are handled as arrays of two-digit uppercase hex tokens, matching
//! how the sensor manual documents them:
//!
//! ```text
//! [0]     header     AA = success, EE = error
//! [1..3]  address
//! [3]     register   00 = status, 22 = distance, BE = laser echo
//! [4..6]  payload length in 16-bit words (big-endian)
//! [6..]   payload
//! [last]  checksum
//! ```

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    FrameError, HEADER_ERROR, HEADER_SUCCESS, REGISTER_DISTANCE, REGISTER_LASER, REGISTER_STATUS,
};

/// Offset of the header token
pub const HEADER_OFFSET: usize = 0;
/// Offset of the register token
pub const REGISTER_OFFSET: usize = 3;
/// Tokens holding the status code
pub const STATUS_CODE: Range<usize> = 6..8;
/// Tokens holding the distance
pub const DISTANCE: Range<usize> = 6..10;
/// Tokens holding the signal quality
pub const SIGNAL_QUALITY: Range<usize> = 10..12;
/// Tokens holding the laser state in a laser echo
pub const LASER_STATE: Range<usize> = 6..8;

/// Shortest frame that still carries a status code
pub const MIN_FRAME_LEN: usize = STATUS_CODE.end;
/// Shortest frame that carries distance and signal quality
pub const MEASUREMENT_FRAME_LEN: usize = SIGNAL_QUALITY.end;

/// A decoded distance reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Distance in sensor units (millimetres)
    pub distance: u32,
    /// Signal quality reported with the reading, lower is better
    pub signal_quality: u16,
    /// When the frame was decoded
    pub received_at: DateTime<Utc>,
}

/// Classified content of a response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Status register read-back
    Status {
        /// Four hex digit status code
        code: String,
    },
    /// Distance register read-back
    Measurement(Measurement),
    /// Echo of a laser on/off command
    Laser {
        /// Laser state the sensor acknowledged
        on: bool,
    },
    /// Error response carrying a status code
    Error {
        /// Four hex digit status code
        code: String,
    },
}

/// A response frame as uppercase hex tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tokens: Vec<String>,
}

impl Frame {
    /// Decode raw bytes into a frame.
    ///
    /// Fails on empty input and on frames too short to hold a status code.
    /// Distance frames are length-checked again by [`Frame::classify`].
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                min: MIN_FRAME_LEN,
            });
        }
        Ok(Self {
            tokens: to_hex_tokens(bytes),
        })
    }

    /// All tokens of the frame
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of bytes in the frame
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the frame holds no bytes
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Header token (`AA` or `EE` for well-formed frames)
    pub fn header(&self) -> &str {
        self.token(HEADER_OFFSET).unwrap_or_default()
    }

    /// Register token
    pub fn register(&self) -> &str {
        self.token(REGISTER_OFFSET).unwrap_or_default()
    }

    /// Single token at `index`, if present
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    /// Tokens in `range` joined into one hex string, if the frame is long enough
    pub fn field(&self, range: Range<usize>) -> Option<String> {
        self.tokens.get(range).map(|t| t.concat())
    }

    /// Space separated hex rendering, e.g. `AA 00 00 22`
    pub fn to_hex_string(&self) -> String {
        self.tokens.join(" ")
    }

    /// Classify the frame by header and register
    pub fn classify(&self) -> Result<Response, FrameError> {
        match self.header() {
            HEADER_SUCCESS => match self.register() {
                REGISTER_STATUS => Ok(Response::Status {
                    code: self.status_code()?,
                }),
                REGISTER_DISTANCE => self.measurement().map(Response::Measurement),
                REGISTER_LASER => Ok(Response::Laser {
                    on: self.laser_state()?,
                }),
                other => Err(FrameError::UnknownRegister(other.to_string())),
            },
            HEADER_ERROR => Ok(Response::Error {
                code: self.status_code()?,
            }),
            other => Err(FrameError::UnknownHeader(other.to_string())),
        }
    }

    fn status_code(&self) -> Result<String, FrameError> {
        self.field(STATUS_CODE).ok_or(FrameError::TooShort {
            len: self.len(),
            min: MIN_FRAME_LEN,
        })
    }

    fn laser_state(&self) -> Result<bool, FrameError> {
        let state = self.field(LASER_STATE).ok_or(FrameError::TooShort {
            len: self.len(),
            min: MIN_FRAME_LEN,
        })?;
        u16::from_str_radix(&state, 16)
            .map(|v| v != 0)
            .map_err(|_| FrameError::InvalidHex(state))
    }

    fn measurement(&self) -> Result<Measurement, FrameError> {
        let too_short = || FrameError::TooShort {
            len: self.len(),
            min: MEASUREMENT_FRAME_LEN,
        };
        let distance = self.field(DISTANCE).ok_or_else(too_short)?;
        let quality = self.field(SIGNAL_QUALITY).ok_or_else(too_short)?;

        Ok(Measurement {
            distance: u32::from_str_radix(&distance, 16)
                .map_err(|_| FrameError::InvalidHex(distance.clone()))?,
            signal_quality: u16::from_str_radix(&quality, 16)
                .map_err(|_| FrameError::InvalidHex(quality.clone()))?,
            received_at: Utc::now(),
        })
    }
}

/// Uppercase two-digit hex token for each byte
pub fn to_hex_tokens(bytes: &[u8]) -> Vec<String> {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Space separated uppercase hex rendering of raw bytes
pub fn to_hex_string(bytes: &[u8]) -> String {
    to_hex_tokens(bytes).join(" ")
}

/// Parse a hex string (case-insensitive, whitespace ignored) into bytes
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, FrameError> {
    let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(FrameError::InvalidHex(hex.to_string()));
    }

    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| FrameError::InvalidHex(hex.to_string()))
        })
        .collect()
}

/// JRT checksum: wrapping sum of every byte after the header
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .skip(1)
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}
