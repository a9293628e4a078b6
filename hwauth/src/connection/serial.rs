//! Serial port transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::classify::ErrorKind;
use crate::connection::DeviceConnection;
use crate::error::{Error, Result};
use crate::protocol::{Frame, Request, Response};

/// Default baud rate of the device's USB CDC link.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial link settings.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Port name/path.
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// How long to wait for a plain reply.
    pub reply_timeout: Duration,
    /// How long to wait for a reply that needs the user to act on the device.
    pub confirm_timeout: Duration,
}

impl SerialSettings {
    /// Default reply timeout.
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

    /// Default user-confirmation timeout.
    pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);

    /// Settings with default timeouts.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            reply_timeout: Self::DEFAULT_REPLY_TIMEOUT,
            confirm_timeout: Self::DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    /// Set the plain reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the user-confirmation timeout.
    #[must_use]
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }
}

/// [`DeviceConnection`] over a serial port.
pub struct SerialConnection {
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    open: AtomicBool,
    settings: SerialSettings,
}

impl SerialConnection {
    /// Open the port described by `settings`.
    pub fn open(settings: SerialSettings) -> Result<Self> {
        let port = serialport::new(&settings.port_name, settings.baud_rate)
            .timeout(settings.reply_timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;
        port.clear(ClearBuffer::All)?;
        debug!(
            "Opened {} at {} baud",
            settings.port_name, settings.baud_rate
        );

        Ok(Self {
            port: Mutex::new(Some(port)),
            open: AtomicBool::new(true),
            settings,
        })
    }

    /// Settings the link was opened with.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn exchange(
        port: &mut dyn serialport::SerialPort,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let bytes = request.to_frame()?.encode()?;
        trace!("TX {} ({} bytes)", request.name(), bytes.len());
        port.set_timeout(timeout)?;
        port.write_all(&bytes)?;
        port.flush()?;

        let frame = Frame::read_from(port)?;
        trace!("RX type {:#04x} ({} bytes)", frame.kind, frame.payload.len());
        Response::from_frame(&frame)
    }
}

impl DeviceConnection for SerialConnection {
    fn name(&self) -> &str {
        &self.settings.port_name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, request: &Request) -> Result<Response> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(port) = guard.as_mut() else {
            return Err(Error::DeviceNotConnected);
        };
        let timeout = if request.awaits_user() {
            self.settings.confirm_timeout
        } else {
            self.settings.reply_timeout
        };

        let result = Self::exchange(port.as_mut(), request, timeout);
        if let Err(e) = &result {
            if e.classify().kind == ErrorKind::DeviceNotConnected {
                warn!("Link to {} lost: {e}", self.settings.port_name);
                self.open.store(false, Ordering::SeqCst);
                *guard = None;
            }
        }
        result
    }

    fn cancel(&self) -> Result<bool> {
        match self.send(&Request::Cancel)? {
            Response::Ack => Ok(true),
            other => {
                debug!("Cancel answered with {}", other.name());
                Ok(false)
            },
        }
    }

    fn close(&self) {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!("Closed {}", self.settings.port_name);
        }
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.close();
    }
}
