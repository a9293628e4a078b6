//! Device authentication.
//!
//! ```text
//! NotStarted -> RequestSent -> Accepted -> ChallengeSigned -> Verified
//!                    |            |             |
//!                 Rejected      Failed        Failed
//! ```
//!
//! The device answers `DeviceAuthStart` with its signed serial once the user
//! confirms. The serial is checked remotely, the returned challenge is signed
//! by the device and checked again, and the device is finally told the
//! outcome.

use log::{debug, info, warn};

use crate::auth::server::{AuthTarget, SerialVerdict};
use crate::auth::{
    Handshake, HandshakeEvent, HandshakeMachine, HandshakeStage, Step, reject_response,
};
use crate::classify::{ErrorKind, FailureSignal};
use crate::connection::{ConnectionContext, DeviceMode};
use crate::error::{Error, Result};
use crate::events::FlowEvent;
use crate::protocol::{Request, Response};

/// Device authentication state machine.
#[derive(Debug, Default)]
pub struct DeviceAuth {
    handshake: Handshake,
    serial: Vec<u8>,
    challenge: Vec<u8>,
    notice: Option<ErrorKind>,
}

impl DeviceAuth {
    /// A fresh machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check preconditions and produce the first step.
    ///
    /// A device running its factory test application is reported through
    /// [`DeviceAuth::notice`] and nothing is sent; the stage stays
    /// `NotStarted`.
    pub fn start(&mut self, ctx: &ConnectionContext) -> Result<Step> {
        self.handshake.reset();
        self.serial.clear();
        self.challenge.clear();
        self.notice = None;

        if !ctx.is_open() {
            return Err(Error::DeviceNotConnected);
        }
        match ctx.mode() {
            DeviceMode::Bootloader => {
                warn!("Device is in bootloader mode, update the firmware first");
                Err(Error::Device(FailureSignal::Bootloader))
            },
            DeviceMode::TestApp => {
                info!("Device is running the factory test application");
                self.notice = Some(ErrorKind::DeviceInTestApp);
                Ok(Step::Complete)
            },
            DeviceMode::Main => {
                self.handshake.apply(HandshakeEvent::SendRequest)?;
                Ok(Step::Send(Request::DeviceAuthStart))
            },
        }
    }

    /// Informational condition reported by [`DeviceAuth::start`].
    pub fn notice(&self) -> Option<ErrorKind> {
        self.notice
    }

    /// Current stage.
    pub fn stage(&self) -> HandshakeStage {
        self.handshake.stage()
    }

    /// The device serial, available once verified.
    pub fn verified_serial(&self) -> Option<&[u8]> {
        (self.handshake.stage() == HandshakeStage::Verified).then_some(self.serial.as_slice())
    }
}

impl HandshakeMachine for DeviceAuth {
    fn target(&self) -> AuthTarget {
        AuthTarget::Device
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    fn on_response(&mut self, response: Response) -> Result<Step> {
        let stage = self.handshake.stage();
        match (stage, response) {
            (HandshakeStage::RequestSent, Response::SerialSignature { serial, signature }) => {
                self.handshake.apply(HandshakeEvent::Accept)?;
                debug!("Device serial {}", hex::encode(&serial));
                self.serial.clone_from(&serial);
                Ok(Step::VerifySerial { serial, signature })
            },
            (HandshakeStage::Accepted, Response::ChallengeSignature { signature }) => {
                self.handshake.apply(HandshakeEvent::SignChallenge)?;
                Ok(Step::VerifyChallenge {
                    serial: self.serial.clone(),
                    challenge: self.challenge.clone(),
                    signature,
                })
            },
            (HandshakeStage::Verified | HandshakeStage::Failed, Response::Ack) => Ok(Step::Complete),
            (stage, other) => Err(reject_response(stage, &other)),
        }
    }

    fn on_serial_verdict(&mut self, verdict: SerialVerdict) -> Result<Step> {
        match verdict {
            SerialVerdict::Challenge(challenge) => {
                if self.handshake.stage() != HandshakeStage::Accepted {
                    return Err(Error::Protocol(format!(
                        "serial verdict in stage {}",
                        self.handshake.stage()
                    )));
                }
                self.challenge.clone_from(&challenge);
                Ok(Step::Send(Request::DeviceSignChallenge { challenge }))
            },
            SerialVerdict::Rejected => {
                self.handshake.apply(HandshakeEvent::VerificationFailed)?;
                warn!("Device serial signature rejected by the server");
                Ok(Step::Send(Request::DeviceAuthResult { verified: false }))
            },
        }
    }

    fn on_challenge_verdict(&mut self, valid: bool) -> Result<Step> {
        if valid {
            self.handshake.apply(HandshakeEvent::Verify)?;
            info!("Device verified");
        } else {
            self.handshake.apply(HandshakeEvent::VerificationFailed)?;
            warn!("Device challenge signature rejected by the server");
        }
        Ok(Step::Send(Request::DeviceAuthResult { verified: valid }))
    }

    fn event(&self) -> FlowEvent {
        FlowEvent::Device {
            stage: self.handshake.stage(),
            error: self.handshake.error().or(self.notice),
        }
    }
}
