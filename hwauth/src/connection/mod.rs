//! Device link abstraction and per-connection context.

#[cfg(feature = "native")]
pub mod serial;

#[cfg(feature = "native")]
pub use serial::SerialConnection;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};
use semver::Version;

use crate::error::{Error, Result};
use crate::events::Flow;
use crate::protocol::{DeviceInfo, Request, Response};

/// An established channel to the physical device.
///
/// Implementations serialize requests internally; the physical link only
/// carries one request at a time.
pub trait DeviceConnection: Send + Sync {
    /// Endpoint name (port path or similar).
    fn name(&self) -> &str;

    /// Whether the link is still up.
    fn is_open(&self) -> bool;

    /// Send a request and wait for its response.
    fn send(&self, request: &Request) -> Result<Response>;

    /// Tell the device to abandon whatever it is waiting for.
    ///
    /// Returns whether the device acknowledged.
    fn cancel(&self) -> Result<bool>;

    /// Close the link.
    fn close(&self);
}

/// Which firmware the device is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    /// Production application firmware.
    Main,
    /// Factory test application (device not yet registered).
    TestApp,
    /// Bootloader; only a firmware update is possible.
    Bootloader,
}

impl DeviceMode {
    /// Wire encoding.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Main => 0,
            Self::TestApp => 1,
            Self::Bootloader => 2,
        }
    }

    /// Decode the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Main),
            1 => Ok(Self::TestApp),
            2 => Ok(Self::Bootloader),
            other => Err(Error::InvalidFrame(format!("unknown device mode {other}"))),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::TestApp => write!(f, "test-app"),
            Self::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Everything a flow needs to know about the connected device.
///
/// Refreshed by the caller on every physical (re)connection. Clones share the
/// link and the single-flight slot.
#[derive(Clone)]
pub struct ConnectionContext {
    link: Arc<dyn DeviceConnection>,
    info: DeviceInfo,
    firmware_version: Option<Version>,
    flow: Arc<Mutex<Option<Flow>>>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("link", &self.link.name())
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    /// Build a context from an already queried [`DeviceInfo`].
    pub fn new(link: Arc<dyn DeviceConnection>, info: DeviceInfo) -> Result<Self> {
        let firmware_version = match (&info.mode, &info.firmware_version) {
            (DeviceMode::Bootloader, _) | (_, None) => None,
            (_, Some(v)) => Some(Version::parse(v.trim_start_matches('v'))?),
        };
        Ok(Self {
            link,
            info,
            firmware_version,
            flow: Arc::new(Mutex::new(None)),
        })
    }

    /// Query the device and build its context.
    pub fn establish(link: Arc<dyn DeviceConnection>) -> Result<Self> {
        let info = match link.send(&Request::GetDeviceInfo)? {
            Response::DeviceInfo(info) => info,
            // Old bootloaders answer every request with their mode.
            Response::Bootloader => DeviceInfo {
                mode: DeviceMode::Bootloader,
                state: 0,
                sdk_version: String::new(),
                firmware_version: None,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "expected DeviceInfo, got {}",
                    other.name()
                )));
            },
        };
        debug!(
            "Connected to {} on {} (sdk {}, firmware {})",
            info.mode,
            link.name(),
            info.sdk_version,
            info.firmware_version.as_deref().unwrap_or("none")
        );
        Self::new(link, info)
    }

    /// The underlying link.
    pub fn connection(&self) -> &Arc<dyn DeviceConnection> {
        &self.link
    }

    /// Whether the link is up.
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Device mode.
    pub fn mode(&self) -> DeviceMode {
        self.info.mode
    }

    /// Persisted state byte.
    pub fn state(&self) -> u8 {
        self.info.state
    }

    /// Negotiated SDK version string.
    pub fn sdk_version(&self) -> &str {
        &self.info.sdk_version
    }

    /// Installed firmware version, unknown in bootloader mode.
    pub fn firmware_version(&self) -> Option<&Version> {
        self.firmware_version.as_ref()
    }

    /// Raw device info.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Send one request over the link.
    pub fn send(&self, request: &Request) -> Result<Response> {
        if !self.link.is_open() {
            return Err(Error::DeviceNotConnected);
        }
        trace!("-> {}", request.name());
        let response = self.link.send(request)?;
        trace!("<- {}", response.name());
        Ok(response)
    }

    /// Take the single-flight slot for `flow`.
    ///
    /// Fails fast with [`Error::Busy`] while another flow holds it. The slot
    /// is released when the guard drops.
    pub fn acquire(&self, flow: Flow) -> Result<FlowGuard> {
        let mut slot = self.flow.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = *slot {
            debug!("Cannot start {flow}: {holder} in progress");
            return Err(Error::Busy(holder));
        }
        *slot = Some(flow);
        Ok(FlowGuard {
            slot: Arc::clone(&self.flow),
            flow,
        })
    }

    /// The flow currently holding the connection.
    pub fn current_flow(&self) -> Option<Flow> {
        *self.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the single-flight slot of a [`ConnectionContext`].
#[derive(Debug)]
pub struct FlowGuard {
    slot: Arc<Mutex<Option<Flow>>>,
    flow: Flow,
}

impl FlowGuard {
    /// The flow holding the slot.
    pub fn flow(&self) -> Flow {
        self.flow
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}
