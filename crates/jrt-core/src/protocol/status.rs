//! Sensor status codes
//!
//! Maps the 2-byte status code reported in status and error frames to a
//! description.

/// Known status codes and their descriptions
pub const STATUS_MESSAGES: &[(&str, &str)] = &[
    ("0000", "No error"),
    ("0001", "Supply voltage too low, must be above 2.2V"),
    ("0002", "Internal error, can be ignored"),
    ("0003", "Module temperature too low (below -20C)"),
    ("0004", "Module temperature too high (above 40C)"),
    ("0005", "Target out of range"),
    ("0006", "Invalid measurement result"),
    ("0007", "Background light too strong"),
    ("0008", "Laser signal too weak"),
    ("0009", "Laser signal too strong"),
    ("000A", "Hardware fault 1"),
    ("000B", "Hardware fault 2"),
    ("000C", "Hardware fault 3"),
    ("000D", "Hardware fault 4"),
    ("000E", "Hardware fault 5"),
    ("000F", "Laser beam not stable"),
    ("0010", "Hardware fault 6"),
    ("0011", "Hardware fault 7"),
    ("0081", "Invalid command"),
];

/// Look up the description of a status code (case-insensitive)
pub fn lookup(code: &str) -> Option<&'static str> {
    STATUS_MESSAGES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, message)| *message)
}

/// Description of a status code, falling back to a generic message for
/// codes the table does not know
pub fn describe(code: &str) -> String {
    match lookup(code) {
        Some(message) => message.to_string(),
        None => format!("Unknown status code {}", code.to_ascii_uppercase()),
    }
}
