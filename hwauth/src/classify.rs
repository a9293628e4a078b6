//! Failure classification.
//!
//! Every failure the orchestrator can observe (a silent device, an on-device
//! rejection, an HTTP error, a failed signature check, ...) is first reduced
//! to a [`FailureSignal`] and then mapped by [`classify`] onto the closed
//! [`ErrorKind`] taxonomy. This mapping is the only place where retry
//! eligibility is decided; the state machines and the retry gate consume the
//! resulting [`Classification`] and never re-derive it.

use std::fmt;

/// Closed taxonomy of failures surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The device did not answer at all or the link is gone.
    DeviceNotConnected,
    /// The device is running its bootloader; a firmware update must run first.
    DeviceInBootloader,
    /// The device is running its factory test application.
    DeviceInTestApp,
    /// The device is busy or not ready to accept the request.
    DeviceNotReady,
    /// The user rejected the request on the device.
    RequestRejectedByUser,
    /// The card reported a (transient) fault.
    CardFault,
    /// The card's pairing key with this device is invalid.
    CardPairingFailed,
    /// Signature verification of the device or card failed.
    DeviceCompromised,
    /// The remote server could not be reached.
    NetworkUnreachable,
    /// The remote server answered with an error.
    NetworkServerError,
    /// A transport-level timeout expired.
    Timeout,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Static retry eligibility of this kind.
    pub const fn retryable(self) -> bool {
        !matches!(
            self,
            Self::DeviceInBootloader
                | Self::DeviceInTestApp
                | Self::CardPairingFailed
                | Self::DeviceCompromised
        )
    }

    /// Terminal kinds are never retried and surface "contact support".
    pub const fn terminal(self) -> bool {
        matches!(self, Self::CardPairingFailed | Self::DeviceCompromised)
    }

    /// Stable machine-readable name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceNotConnected => "device_not_connected",
            Self::DeviceInBootloader => "device_in_bootloader",
            Self::DeviceInTestApp => "device_in_test_app",
            Self::DeviceNotReady => "device_not_ready",
            Self::RequestRejectedByUser => "request_rejected_by_user",
            Self::CardFault => "card_fault",
            Self::CardPairingFailed => "card_pairing_failed",
            Self::DeviceCompromised => "device_compromised",
            Self::NetworkUnreachable => "network_unreachable",
            Self::NetworkServerError => "network_server_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure signal as observed at a boundary (transport, device, network).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// No response from the device; the link is closed or silent.
    NoResponse,
    /// The transport gave up waiting for a reply.
    TransportTimeout,
    /// The device reports it is in bootloader mode.
    Bootloader,
    /// The device reports it is running the factory test application.
    TestApp,
    /// The device reports it is not ready.
    NotReady,
    /// The user rejected the request on the device.
    UserRejected,
    /// The card reported a fault.
    CardFault,
    /// The device reports a card pairing failure.
    CardPairingFailed,
    /// Cryptographic verification of a signature failed.
    VerificationFailed,
    /// HTTP failure; `status` is `None` when no response was received at all.
    Http {
        /// Response status, if the server answered.
        status: Option<u16>,
    },
    /// Protocol-level negative acknowledgement with a device error code.
    Nack(u8),
    /// A retry was refused for an earlier failure of `kind`.
    Refused {
        /// Kind of the failure that was not retried.
        kind: ErrorKind,
        /// Whether that failure was terminal.
        terminal: bool,
    },
    /// Anything that does not fit the categories above.
    Unclassified,
}

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// The classified kind.
    pub kind: ErrorKind,
    /// Whether the caller may offer a retry.
    pub retryable: bool,
    /// Whether the failure is terminal (contact support).
    pub terminal: bool,
}

impl Classification {
    /// Classification carrying the static bits of `kind`.
    pub const fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.retryable(),
            terminal: kind.terminal(),
        }
    }

    /// A failure that kept recurring until the attempt budget ran out.
    pub const fn exhausted() -> Self {
        Self {
            kind: ErrorKind::Unknown,
            retryable: false,
            terminal: true,
        }
    }
}

/// Map a raw failure signal to its classification.
pub fn classify(signal: FailureSignal) -> Classification {
    let kind = match signal {
        FailureSignal::Refused { kind, terminal } => {
            return Classification {
                kind,
                retryable: false,
                terminal,
            };
        },
        FailureSignal::NoResponse => ErrorKind::DeviceNotConnected,
        FailureSignal::TransportTimeout => ErrorKind::Timeout,
        FailureSignal::Bootloader => ErrorKind::DeviceInBootloader,
        FailureSignal::TestApp => ErrorKind::DeviceInTestApp,
        FailureSignal::NotReady => ErrorKind::DeviceNotReady,
        FailureSignal::UserRejected => ErrorKind::RequestRejectedByUser,
        FailureSignal::CardFault => ErrorKind::CardFault,
        FailureSignal::CardPairingFailed => ErrorKind::CardPairingFailed,
        FailureSignal::VerificationFailed => ErrorKind::DeviceCompromised,
        FailureSignal::Http { status: Some(_) } => ErrorKind::NetworkServerError,
        FailureSignal::Http { status: None } => ErrorKind::NetworkUnreachable,
        FailureSignal::Nack(_) | FailureSignal::Unclassified => ErrorKind::Unknown,
    };
    Classification::of(kind)
}
