//! Card authentication.
//!
//! ```text
//! NotStarted -> RequestSent -> Accepted -> SerialSigned -> ChallengeSigned -> Verified
//!                    |            |             |                |
//!                 Rejected        +------ Failed | PairingFailed -+
//! ```
//!
//! After the challenge verifies, the device checks the card's pairing key.
//! An invalid pairing ends in `PairingFailed`, never in `Failed`.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};

use crate::auth::server::{AuthTarget, SerialVerdict};
use crate::auth::{Handshake, HandshakeEvent, HandshakeMachine, HandshakeStage, Step, reject_response};
use crate::error::{Error, Result};
use crate::events::FlowEvent;
use crate::protocol::{Request, Response};

/// One of the four physical cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CardSlot {
    /// Card "01".
    One,
    /// Card "02".
    Two,
    /// Card "03".
    Three,
    /// Card "04".
    Four,
}

impl CardSlot {
    /// All slots in authentication order.
    pub const ALL: [Self; 4] = [Self::One, Self::Two, Self::Three, Self::Four];

    /// 1-based index.
    pub const fn index(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }

    /// Slot for a 1-based index.
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    /// The slot after this one.
    pub const fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }
}

impl fmt::Display for CardSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.index())
    }
}

impl FromStr for CardSlot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u8>()
            .ok()
            .and_then(Self::from_index)
            .ok_or_else(|| Error::Config(format!("invalid card slot '{s}', expected 01..04")))
    }
}

/// Authentication of a single card.
#[derive(Debug)]
pub struct CardAuth {
    slot: CardSlot,
    handshake: Handshake,
    serial: Vec<u8>,
    challenge: Vec<u8>,
}

impl CardAuth {
    /// A fresh machine for `slot`.
    pub fn new(slot: CardSlot) -> Self {
        Self {
            slot,
            handshake: Handshake::new(),
            serial: Vec::new(),
            challenge: Vec::new(),
        }
    }

    /// The slot being authenticated.
    pub fn slot(&self) -> CardSlot {
        self.slot
    }

    /// Current stage.
    pub fn stage(&self) -> HandshakeStage {
        self.handshake.stage()
    }

    /// Ask the user to tap the card.
    pub fn start(&mut self) -> Result<Step> {
        self.handshake.apply(HandshakeEvent::SendRequest)?;
        Ok(Step::Send(Request::CardAuthStart { slot: self.slot }))
    }
}

impl HandshakeMachine for CardAuth {
    fn target(&self) -> AuthTarget {
        AuthTarget::Card(self.slot)
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    fn on_response(&mut self, response: Response) -> Result<Step> {
        let slot = self.slot;
        match (self.handshake.stage(), response) {
            (HandshakeStage::RequestSent, Response::Accepted) => {
                self.handshake.apply(HandshakeEvent::Accept)?;
                Ok(Step::Send(Request::CardSignSerial { slot }))
            },
            (HandshakeStage::Accepted, Response::SerialSignature { serial, signature }) => {
                self.handshake.apply(HandshakeEvent::SignSerial)?;
                self.serial.clone_from(&serial);
                Ok(Step::VerifySerial { serial, signature })
            },
            (HandshakeStage::SerialSigned, Response::ChallengeSignature { signature }) => {
                self.handshake.apply(HandshakeEvent::SignChallenge)?;
                Ok(Step::VerifyChallenge {
                    serial: self.serial.clone(),
                    challenge: self.challenge.clone(),
                    signature,
                })
            },
            (HandshakeStage::ChallengeSigned, Response::Paired) => {
                self.handshake.apply(HandshakeEvent::Verify)?;
                info!("Card {slot} verified");
                Ok(Step::Complete)
            },
            (stage, other) => Err(reject_response(stage, &other)),
        }
    }

    fn on_serial_verdict(&mut self, verdict: SerialVerdict) -> Result<Step> {
        match verdict {
            SerialVerdict::Challenge(challenge) => {
                if self.handshake.stage() != HandshakeStage::SerialSigned {
                    return Err(Error::Protocol(format!(
                        "serial verdict in stage {}",
                        self.handshake.stage()
                    )));
                }
                self.challenge.clone_from(&challenge);
                Ok(Step::Send(Request::CardSignChallenge {
                    slot: self.slot,
                    challenge,
                }))
            },
            SerialVerdict::Rejected => {
                self.handshake.apply(HandshakeEvent::VerificationFailed)?;
                warn!("Card {} serial signature rejected by the server", self.slot);
                Ok(Step::Complete)
            },
        }
    }

    fn on_challenge_verdict(&mut self, valid: bool) -> Result<Step> {
        if self.handshake.stage() != HandshakeStage::ChallengeSigned {
            return Err(Error::Protocol(format!(
                "challenge verdict in stage {}",
                self.handshake.stage()
            )));
        }
        if valid {
            Ok(Step::Send(Request::CardPair { slot: self.slot }))
        } else {
            self.handshake.apply(HandshakeEvent::VerificationFailed)?;
            warn!("Card {} challenge signature rejected by the server", self.slot);
            Ok(Step::Complete)
        }
    }

    fn event(&self) -> FlowEvent {
        FlowEvent::Card {
            slot: self.slot,
            stage: self.handshake.stage(),
            error: self.handshake.error(),
        }
    }
}
