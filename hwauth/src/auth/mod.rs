//! Challenge/response authentication of the device and its cards.
//!
//! Both handshakes share one stage shape ([`HandshakeStage`]) and one
//! transition table ([`Handshake::apply`]). The concrete machines
//! ([`device::DeviceAuth`], [`card::CardAuth`]) are sans-IO: they consume
//! device responses and server verdicts and answer with the next [`Step`] to
//! perform. [`crate::engine::Engine`] performs the steps.

pub mod card;
pub mod device;
pub mod sequence;
pub mod server;

use std::fmt;

use log::debug;

use crate::classify::ErrorKind;
use crate::error::{Error, Result};
use crate::events::FlowEvent;
use crate::protocol::{Request, Response};
use server::{AuthTarget, SerialVerdict};

/// Stage of a device or card handshake.
///
/// Declaration order is the forward order of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeStage {
    /// Nothing sent yet.
    NotStarted,
    /// Request sent, waiting for the user to confirm.
    RequestSent,
    /// The user confirmed.
    Accepted,
    /// The user rejected the request on the device.
    Rejected,
    /// The card signed its serial.
    SerialSigned,
    /// The challenge was signed.
    ChallengeSigned,
    /// Signature verified (and, for cards, pairing confirmed).
    Verified,
    /// Failed with an error kind.
    Failed,
    /// The card's pairing with this device is invalid.
    PairingFailed,
}

impl HandshakeStage {
    /// Terminal stages only leave through an explicit reset.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Verified | Self::Failed | Self::PairingFailed
        )
    }

    /// Terminal and not verified.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Rejected | Self::Failed | Self::PairingFailed)
    }

    /// Stages a cancel can still act on. Once a signature is in flight the
    /// handshake runs to its verdict.
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::NotStarted | Self::RequestSent | Self::Accepted)
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::RequestSent => "request sent",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::SerialSigned => "serial signed",
            Self::ChallengeSigned => "challenge signed",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::PairingFailed => "pairing failed",
        };
        f.write_str(name)
    }
}

/// Input to the shared transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The request went out.
    SendRequest,
    /// The user confirmed.
    Accept,
    /// The user rejected.
    Reject,
    /// A serial signature arrived.
    SignSerial,
    /// A challenge signature arrived.
    SignChallenge,
    /// Verification (and pairing, for cards) succeeded.
    Verify,
    /// A signature did not verify.
    VerificationFailed,
    /// The card's pairing key is invalid.
    PairingFailed,
    /// Any other classified failure.
    Fault(ErrorKind),
    /// Return to `NotStarted`.
    Reset,
}

/// Stage plus the error attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    stage: HandshakeStage,
    error: Option<ErrorKind>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// A fresh handshake.
    pub const fn new() -> Self {
        Self {
            stage: HandshakeStage::NotStarted,
            error: None,
        }
    }

    /// Current stage.
    pub const fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Error attached to the current stage.
    pub const fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Apply one event.
    ///
    /// Stages only move forward. A terminal stage accepts nothing but
    /// [`HandshakeEvent::Reset`].
    pub fn apply(&mut self, event: HandshakeEvent) -> Result<HandshakeStage> {
        use HandshakeEvent as E;
        use HandshakeStage as S;

        let (stage, error) = match (self.stage, event) {
            (_, E::Reset) => (S::NotStarted, None),
            (from, _) if from.is_terminal() => return Err(self.invalid(event)),
            (S::NotStarted, E::SendRequest) => (S::RequestSent, None),
            (S::RequestSent, E::Accept) => (S::Accepted, None),
            (S::RequestSent | S::Accepted, E::Reject) => {
                (S::Rejected, Some(ErrorKind::RequestRejectedByUser))
            },
            (S::Accepted, E::SignSerial) => (S::SerialSigned, None),
            (S::Accepted | S::SerialSigned, E::SignChallenge) => (S::ChallengeSigned, None),
            (S::ChallengeSigned, E::Verify) => (S::Verified, None),
            (S::Accepted | S::SerialSigned | S::ChallengeSigned, E::VerificationFailed) => {
                (S::Failed, Some(ErrorKind::DeviceCompromised))
            },
            (S::Accepted | S::SerialSigned | S::ChallengeSigned, E::PairingFailed) => {
                (S::PairingFailed, Some(ErrorKind::CardPairingFailed))
            },
            (_, E::Fault(kind)) => (S::Failed, Some(kind)),
            _ => return Err(self.invalid(event)),
        };

        if stage != self.stage {
            debug!("Handshake: {} -> {stage}", self.stage);
        }
        self.stage = stage;
        self.error = error;
        Ok(stage)
    }

    /// Return to `NotStarted`, clearing any error.
    pub fn reset(&mut self) {
        self.stage = HandshakeStage::NotStarted;
        self.error = None;
    }

    fn invalid(&self, event: HandshakeEvent) -> Error {
        Error::Protocol(format!("{event:?} is not valid in stage {}", self.stage))
    }
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send a request to the device and feed back the response.
    Send(Request),
    /// Ask the verification server to check a serial signature.
    VerifySerial {
        /// Serial as reported by the device or card.
        serial: Vec<u8>,
        /// Signature over the serial.
        signature: Vec<u8>,
    },
    /// Ask the verification server to check a challenge signature.
    VerifyChallenge {
        /// Serial the challenge was issued for.
        serial: Vec<u8>,
        /// The challenge.
        challenge: Vec<u8>,
        /// Signature over the challenge.
        signature: Vec<u8>,
    },
    /// Nothing left to do.
    Complete,
}

/// Common driving surface of the device and card machines.
pub trait HandshakeMachine {
    /// What is being authenticated.
    fn target(&self) -> AuthTarget;

    /// Current handshake state.
    fn handshake(&self) -> &Handshake;

    /// Mutable handshake state.
    fn handshake_mut(&mut self) -> &mut Handshake;

    /// Consume a device response.
    ///
    /// Responses that carry a failure signal are returned as
    /// [`Error::Device`] without a transition; the driver hands them to
    /// [`HandshakeMachine::on_failure`] like any other error.
    fn on_response(&mut self, response: Response) -> Result<Step>;

    /// Consume the server's serial verdict.
    fn on_serial_verdict(&mut self, verdict: SerialVerdict) -> Result<Step>;

    /// Consume the server's challenge verdict.
    fn on_challenge_verdict(&mut self, valid: bool) -> Result<Step>;

    /// Transition event for the current state.
    fn event(&self) -> FlowEvent;

    /// Record a failure and return its kind.
    ///
    /// A handshake that is already terminal keeps its stage.
    fn on_failure(&mut self, error: &Error) -> ErrorKind {
        let kind = error.classify().kind;
        let handshake = self.handshake_mut();
        if handshake.stage().is_terminal() {
            return handshake.error().unwrap_or(kind);
        }
        let event = match kind {
            ErrorKind::RequestRejectedByUser => HandshakeEvent::Reject,
            ErrorKind::CardPairingFailed => HandshakeEvent::PairingFailed,
            other => HandshakeEvent::Fault(other),
        };
        if handshake.apply(event).is_err() {
            // e.g. a rejection before the request went out
            let _ = handshake.apply(HandshakeEvent::Fault(kind));
        }
        kind
    }

    /// Whether [`HandshakeMachine::cancel`] would take effect now.
    fn can_cancel(&self) -> bool {
        self.handshake().stage().is_cancellable()
    }

    /// Abandon the handshake.
    ///
    /// Returns whether anything was outstanding, in which case the driver
    /// must tell the device to cancel. Outside the cancellable stages this
    /// is a no-op.
    fn cancel(&mut self) -> bool {
        if !self.can_cancel() {
            return false;
        }
        let handshake = self.handshake_mut();
        debug!("Handshake cancelled in stage {}", handshake.stage());
        handshake.reset();
        true
    }
}

fn unexpected(stage: HandshakeStage, response: &Response) -> Error {
    Error::Protocol(format!("unexpected {} in stage {stage}", response.name()))
}

/// Turn a failure-carrying response into its error, or report it as
/// unexpected for `stage`.
fn reject_response(stage: HandshakeStage, response: &Response) -> Error {
    match response.failure_signal() {
        Some(signal) => Error::Device(signal),
        None => unexpected(stage, response),
    }
}
