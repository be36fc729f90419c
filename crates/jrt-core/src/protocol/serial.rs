//! Serial port handling
//!
//! Device discovery, access checks and port opening. The connection
//! lifecycle only sees the [`DeviceProvider`] trait, so platforms with their
//! own enumeration and permission flows can plug in their own provider.

use std::collections::HashMap;
use std::fmt;
#[cfg(target_os = "linux")]
use std::fs;
use std::future::Future;

use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, warn};

use super::{ProtocolError, BAUD_RATE};

/// Line parameters for the sensor port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// 115200-8-N-1, the only setting the sensor supports
    pub const JRT: SerialSettings = SerialSettings {
        baud_rate: BAUD_RATE,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
    };
}

/// Source of sensor devices and their byte streams
pub trait DeviceProvider: Send + Sync {
    /// Device handle returned by discovery
    type Device: Clone + fmt::Debug + Send + Sync;
    /// Open bidirectional stream to a device
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Serial-capable devices currently attached, preferred first
    fn find_candidate_devices(&self) -> Vec<Self::Device>;

    /// Whether this process may open `device`
    fn has_permission(&self, device: &Self::Device) -> bool;

    /// Ask for access to `device`; resolves to whether access was granted
    fn request_permission(&self, device: &Self::Device) -> impl Future<Output = bool> + Send;

    /// Open `device` with the given line settings
    fn open(
        &self,
        device: &Self::Device,
        settings: &SerialSettings,
    ) -> Result<Self::Stream, ProtocolError>;
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Whether the port looks like a USB serial adapter
    pub fn is_usb(&self) -> bool {
        if self.vid.is_some() {
            return true;
        }
        let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
        basename.starts_with("ttyACM") || basename.starts_with("ttyUSB")
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Sort key putting ttyACM* first, then ttyUSB*, each numerically, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux: udev may not have tagged a freshly plugged adapter yet
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

#[cfg(unix)]
fn has_access(path: &str) -> bool {
    use std::ffi::CString;

    match CString::new(path) {
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 },
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn has_access(_path: &str) -> bool {
    true
}

/// Provider backed by the host's serial ports
#[derive(Debug, Clone, Default)]
pub struct SystemDevices {
    port: Option<String>,
}

impl SystemDevices {
    /// Discover USB serial adapters
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed port instead of discovery
    pub fn with_port(name: impl Into<String>) -> Self {
        Self {
            port: Some(name.into()),
        }
    }
}

impl DeviceProvider for SystemDevices {
    type Device = PortInfo;
    type Stream = SerialStream;

    fn find_candidate_devices(&self) -> Vec<PortInfo> {
        let ports = list_ports();
        match &self.port {
            Some(name) => ports
                .into_iter()
                .find(|p| &p.name == name)
                .map(|p| vec![p])
                .unwrap_or_else(|| vec![PortInfo::named(name.clone())]),
            None => ports.into_iter().filter(PortInfo::is_usb).collect(),
        }
    }

    fn has_permission(&self, device: &PortInfo) -> bool {
        has_access(&device.name)
    }

    async fn request_permission(&self, device: &PortInfo) -> bool {
        // Device node permissions are managed outside the process.
        let granted = self.has_permission(device);
        if !granted {
            warn!(
                port = %device.name,
                "no read/write access to port; add the user to the group owning the device node"
            );
        }
        granted
    }

    fn open(
        &self,
        device: &PortInfo,
        settings: &SerialSettings,
    ) -> Result<SerialStream, ProtocolError> {
        debug!(port = %device.name, baud = settings.baud_rate, "opening serial port");
        tokio_serial::new(&device.name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }
}
