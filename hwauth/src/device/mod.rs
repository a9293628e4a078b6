//! Wallet endpoint discovery.
//!
//! Serial ports are enumerated and classified by USB VID/PID into wallet
//! application endpoints, bootloader endpoints and everything else.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// What a USB endpoint looks like from its VID/PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Wallet running its application (or test) firmware.
    Wallet,
    /// Wallet in its bootloader.
    Bootloader,
    /// A VID/PID the user registered in the configuration.
    Registered,
    /// Anything else.
    Unknown,
}

/// Built-in VID/PID pairs.
const KNOWN_ENDPOINTS: &[(u16, u16, EndpointKind)] = &[
    (0x0483, 0x5740, EndpointKind::Wallet),
    (0x0483, 0xDF11, EndpointKind::Bootloader),
    (0x3503, 0x0103, EndpointKind::Wallet),
    (0x3503, 0x0104, EndpointKind::Bootloader),
];

impl EndpointKind {
    /// Classify a VID/PID pair, consulting user-registered pairs last.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16, registered: &[(u16, u16)]) -> Self {
        if let Some((_, _, kind)) = KNOWN_ENDPOINTS
            .iter()
            .find(|(v, p, _)| *v == vid && *p == pid)
        {
            return *kind;
        }
        if registered.contains(&(vid, pid)) {
            return Self::Registered;
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wallet => "Wallet",
            Self::Bootloader => "Wallet bootloader",
            Self::Registered => "Registered device",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the endpoint is plausibly a wallet.
    pub fn is_wallet(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A discovered endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classification.
    pub kind: EndpointKind,
    /// USB Vendor ID, if USB.
    pub vid: Option<u16>,
    /// USB Product ID, if USB.
    pub pid: Option<u16>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

/// Enumerate serial ports with their classification.
#[cfg(feature = "native")]
pub fn detect_ports(registered: &[(u16, u16)]) -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort {
                name: info.port_name,
                kind: EndpointKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            };
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.kind = EndpointKind::from_vid_pid(usb.vid, usb.pid, registered);
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
                trace!(
                    "Found USB port: {} ({:04X}:{:04X}, {:?})",
                    detected.name, usb.vid, usb.pid, detected.kind
                );
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no native serial support).
#[cfg(not(feature = "native"))]
pub fn detect_ports(_registered: &[(u16, u16)]) -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best wallet endpoint among `ports`.
///
/// Application endpoints win over bootloaders, which win over registered
/// pairs. Unknown ports are never picked automatically.
pub fn select_port(ports: &[DetectedPort]) -> Result<DetectedPort> {
    [
        EndpointKind::Wallet,
        EndpointKind::Bootloader,
        EndpointKind::Registered,
    ]
    .iter()
    .find_map(|kind| ports.iter().find(|p| p.kind == *kind))
    .cloned()
    .ok_or(Error::DeviceNotFound)
}

/// Auto-detect a single wallet endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port(registered: &[(u16, u16)]) -> Result<DetectedPort> {
    let port = select_port(&detect_ports(registered))?;
    info!("Auto-detected {}: {}", port.kind.name(), port.name);
    Ok(port)
}

/// Format ports for display, one line each.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let kind = if port.kind.is_wallet() {
                format!(" [{}]", port.kind.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{kind}{product}", port.name)
        })
        .collect()
}
