//! Error types for hwauth.

use std::io;
use thiserror::Error;

use crate::classify::{Classification, FailureSignal, classify};
use crate::events::Flow;
use crate::gate::GateDenial;

/// Result type for hwauth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hwauth operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// HTTP transport error.
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed device frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device link is closed or the device never answered.
    #[error("Device not connected")]
    DeviceNotConnected,

    /// No candidate device endpoint was found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Another flow currently holds the connection.
    #[error("Device busy: {0} flow in progress")]
    Busy(Flow),

    /// The device answered with a failure status.
    #[error("Device reported failure: {0:?}")]
    Device(FailureSignal),

    /// Unexpected message or invalid stage transition.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote server answered with an error status.
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// A signature did not verify.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The retry gate refused a retry.
    #[error("Retry refused: {0}")]
    RetryRefused(GateDenial),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid semantic version string.
    #[error("Invalid version: {0}")]
    Version(#[from] semver::Error),

    /// Downloaded data does not match its expected digest.
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Reduce this error to the raw failure signal it represents.
    pub fn signal(&self) -> FailureSignal {
        match self {
            Self::Io(e) => io_signal(e.kind()),
            #[cfg(feature = "native")]
            Self::Serial(e) => match e.kind() {
                serialport::ErrorKind::NoDevice => FailureSignal::NoResponse,
                serialport::ErrorKind::Io(kind) => io_signal(kind),
                _ => FailureSignal::Unclassified,
            },
            #[cfg(feature = "http")]
            Self::Http(e) => FailureSignal::Http {
                status: e.status().map(|s| s.as_u16()),
            },
            Self::Timeout(_) => FailureSignal::TransportTimeout,
            Self::DeviceNotConnected | Self::DeviceNotFound | Self::Busy(_) => {
                FailureSignal::NoResponse
            },
            Self::Device(signal) => *signal,
            Self::Server { status, .. } => FailureSignal::Http {
                status: Some(*status),
            },
            Self::VerificationFailed(_) => FailureSignal::VerificationFailed,
            Self::RetryRefused(denial) => match denial {
                GateDenial::DeviceDisconnected => FailureSignal::NoResponse,
                GateDenial::NetworkUnreachable => FailureSignal::Http { status: None },
                GateDenial::ServerUnavailable => FailureSignal::Http { status: Some(503) },
                GateDenial::Terminal(kind) => FailureSignal::Refused {
                    kind: *kind,
                    terminal: true,
                },
                GateDenial::NotRetryable(kind) => FailureSignal::Refused {
                    kind: *kind,
                    terminal: kind.terminal(),
                },
                GateDenial::NothingToRetry | GateDenial::NonCancellable => {
                    FailureSignal::Unclassified
                },
            },
            Self::InvalidFrame(_)
            | Self::CrcMismatch { .. }
            | Self::Protocol(_)
            | Self::Cancelled
            | Self::Version(_)
            | Self::Integrity { .. }
            | Self::Config(_) => FailureSignal::Unclassified,
        }
    }

    /// Classify this error.
    pub fn classify(&self) -> Classification {
        classify(self.signal())
    }
}

fn io_signal(kind: io::ErrorKind) -> FailureSignal {
    match kind {
        io::ErrorKind::TimedOut => FailureSignal::TransportTimeout,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => FailureSignal::NoResponse,
        _ => FailureSignal::Unclassified,
    }
}
