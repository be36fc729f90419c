//! Protocol commands
//!
//! Defines the fixed command frames understood by the JRT sensor.
//! Refer to the M8xx-JRT user manual section 6.5 for measure modes.

use serde::{Deserialize, Serialize};

/// Commands sent to the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Power the laser pointer on
    PowerLaserOn,

    /// Power the laser pointer off
    PowerLaserOff,

    /// Read the status register
    ReadStatus,

    /// Single measurement with AUTO setting
    SingleShotAuto,

    /// Start continuous measurement with AUTO setting
    StartContinuousAuto,

    /// Stop continuous measurement
    StopContinuous,

    /// Auto baud rate detection, completes initialization after port open
    SetAutoBaudRate,
}

const LASER_ON: &[u8] = &[0xAA, 0x00, 0x01, 0xBE, 0x00, 0x01, 0x00, 0x01, 0xC1];
const LASER_OFF: &[u8] = &[0xAA, 0x00, 0x01, 0xBE, 0x00, 0x01, 0x00, 0x00, 0xC0];
const READ_STATUS: &[u8] = &[0xAA, 0x80, 0x00, 0x00, 0x80];
const SINGLE_SHOT_AUTO: &[u8] = &[0xAA, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x21];
const CONTINUOUS_AUTO: &[u8] = &[0xAA, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x04, 0x25];
const STOP_CONTINUOUS: &[u8] = &[0x58];
const AUTO_BAUD_RATE: &[u8] = &[0x55];

impl Command {
    /// Every command, in table order
    pub const ALL: [Command; 7] = [
        Command::PowerLaserOn,
        Command::PowerLaserOff,
        Command::ReadStatus,
        Command::SingleShotAuto,
        Command::StartContinuousAuto,
        Command::StopContinuous,
        Command::SetAutoBaudRate,
    ];

    /// Raw bytes written to the port for this command
    pub fn encode(&self) -> &'static [u8] {
        match self {
            Command::PowerLaserOn => LASER_ON,
            Command::PowerLaserOff => LASER_OFF,
            Command::ReadStatus => READ_STATUS,
            Command::SingleShotAuto => SINGLE_SHOT_AUTO,
            Command::StartContinuousAuto => CONTINUOUS_AUTO,
            Command::StopContinuous => STOP_CONTINUOUS,
            Command::SetAutoBaudRate => AUTO_BAUD_RATE,
        }
    }

    /// Documented hex form of the command, as it appears in the manual
    pub fn hex(&self) -> &'static str {
        match self {
            Command::PowerLaserOn => "AA0001BE00010001C1",
            Command::PowerLaserOff => "AA0001BE00010000C0",
            Command::ReadStatus => "AA80000080",
            Command::SingleShotAuto => "AA0000200001000021",
            Command::StartContinuousAuto => "AA0000200001000425",
            Command::StopContinuous => "58",
            Command::SetAutoBaudRate => "55",
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::PowerLaserOn => "laser-on",
            Command::PowerLaserOff => "laser-off",
            Command::ReadStatus => "read-status",
            Command::SingleShotAuto => "single-shot",
            Command::StartContinuousAuto => "continuous-start",
            Command::StopContinuous => "continuous-stop",
            Command::SetAutoBaudRate => "auto-baud",
        }
    }

    /// Whether the sensor answers this command with a frame
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::StopContinuous | Command::SetAutoBaudRate)
    }
}
