//! Four-card sequence controller.
//!
//! Cards are authenticated strictly in slot order, one at a time. A failed
//! card does not stop the sequence: the verdict needs all four outcomes to
//! tell a partial failure from a total one. A dropped link freezes the
//! sequence until the caller resumes it explicitly.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};

use crate::auth::{HandshakeMachine, HandshakeStage};
use crate::auth::card::{CardAuth, CardSlot};
use crate::classify::{Classification, ErrorKind};
use crate::connection::ConnectionContext;
use crate::error::{Error, Result};
use crate::gate::{GateDenial, RetryGate};

/// Outcome recorded for one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardOutcome {
    /// Not attempted yet (or reset for retry).
    Pending,
    /// Currently being authenticated.
    InProgress,
    /// Authenticated and paired.
    Verified,
    /// Failed with the given kind.
    Failed(ErrorKind),
    /// Pairing with this device is invalid.
    PairingFailed,
}

impl CardOutcome {
    /// Whether the card reached a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed(_) | Self::PairingFailed)
    }

    /// Error kind attached to the outcome.
    pub const fn error(self) -> Option<ErrorKind> {
        match self {
            Self::Failed(kind) => Some(kind),
            Self::PairingFailed => Some(ErrorKind::CardPairingFailed),
            Self::Pending | Self::InProgress | Self::Verified => None,
        }
    }
}

impl fmt::Display for CardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in progress"),
            Self::Verified => write!(f, "verified"),
            Self::Failed(kind) => write!(f, "failed ({kind})"),
            Self::PairingFailed => write!(f, "pairing failed"),
        }
    }
}

/// Aggregate over all four outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// Every card verified.
    AllVerified,
    /// Every card failed.
    AllFailed,
    /// Some verified, some failed.
    PartialFailure,
    /// At least one card has not finished.
    Incomplete,
}

impl fmt::Display for SequenceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllVerified => write!(f, "all cards verified"),
            Self::AllFailed => write!(f, "all cards failed"),
            Self::PartialFailure => write!(f, "some cards failed"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Per-slot outcomes plus sequencing state.
#[derive(Debug, Clone)]
pub struct CardSequence {
    outcomes: BTreeMap<CardSlot, CardOutcome>,
    frozen: bool,
}

impl Default for CardSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl CardSequence {
    /// All four slots pending.
    pub fn new() -> Self {
        Self {
            outcomes: CardSlot::ALL
                .into_iter()
                .map(|slot| (slot, CardOutcome::Pending))
                .collect(),
            frozen: false,
        }
    }

    /// Outcome of one slot.
    pub fn outcome(&self, slot: CardSlot) -> CardOutcome {
        self.outcomes
            .get(&slot)
            .copied()
            .unwrap_or(CardOutcome::Pending)
    }

    /// All outcomes in slot order.
    pub fn outcomes(&self) -> impl Iterator<Item = (CardSlot, CardOutcome)> + '_ {
        self.outcomes.iter().map(|(slot, outcome)| (*slot, *outcome))
    }

    /// Whether a link drop froze the sequence.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Verdict over the current outcomes.
    pub fn verdict(&self) -> SequenceVerdict {
        verdict_of(self.outcomes.values().copied())
    }

    /// The slot the next call to [`CardSequence::begin_next`] would start.
    pub fn next_slot(&self) -> Option<CardSlot> {
        if self
            .outcomes
            .values()
            .any(|o| *o == CardOutcome::InProgress)
        {
            return None;
        }
        self.outcomes
            .iter()
            .find(|(_, o)| **o == CardOutcome::Pending)
            .map(|(slot, _)| *slot)
    }

    /// Start the lowest pending slot.
    ///
    /// Returns `Ok(None)` once no slot is pending. Fails fast with
    /// [`Error::DeviceNotConnected`] while frozen or when the link is down;
    /// a down link also freezes the sequence.
    pub fn begin_next(&mut self, ctx: &ConnectionContext) -> Result<Option<CardAuth>> {
        if self.frozen {
            return Err(Error::DeviceNotConnected);
        }
        if !ctx.is_open() {
            self.freeze();
            return Err(Error::DeviceNotConnected);
        }
        let Some(slot) = self.next_slot() else {
            return Ok(None);
        };
        debug!("Card sequence: starting card {slot}");
        self.outcomes.insert(slot, CardOutcome::InProgress);
        Ok(Some(CardAuth::new(slot)))
    }

    /// Record the result of a card handshake started by
    /// [`CardSequence::begin_next`].
    pub fn finish(&mut self, auth: &CardAuth) -> CardOutcome {
        let slot = auth.slot();
        let handshake = auth.handshake();
        let outcome = match (handshake.stage(), handshake.error()) {
            (HandshakeStage::Verified, _) => CardOutcome::Verified,
            (HandshakeStage::PairingFailed, _) => CardOutcome::PairingFailed,
            (HandshakeStage::Failed, Some(ErrorKind::DeviceNotConnected)) => {
                warn!("Link lost during card {slot}, sequence frozen");
                self.freeze();
                CardOutcome::Pending
            },
            (HandshakeStage::Failed | HandshakeStage::Rejected, kind) => {
                CardOutcome::Failed(kind.unwrap_or(ErrorKind::Unknown))
            },
            // Cancelled or abandoned mid-way.
            _ => CardOutcome::Pending,
        };
        debug!("Card sequence: card {slot} -> {outcome}");
        self.outcomes.insert(slot, outcome);
        outcome
    }

    /// Unfreeze after the caller re-established the link.
    pub fn resume(&mut self, ctx: &ConnectionContext) -> Result<()> {
        if !ctx.is_open() {
            return Err(Error::DeviceNotConnected);
        }
        if self.frozen {
            debug!("Card sequence resumed");
        }
        self.frozen = false;
        Ok(())
    }

    /// Reset one failed slot so sequencing resumes from it.
    ///
    /// Only `Failed` slots with a retryable kind qualify, and only while the
    /// link is open and the network reachable. Verified slots are untouched.
    pub fn retry(
        &mut self,
        slot: CardSlot,
        gate: &RetryGate,
        ctx: &ConnectionContext,
    ) -> Result<()> {
        let kind = match self.outcome(slot) {
            CardOutcome::Failed(kind) => kind,
            CardOutcome::PairingFailed => {
                return Err(Error::RetryRefused(GateDenial::Terminal(
                    ErrorKind::CardPairingFailed,
                )));
            },
            CardOutcome::Pending | CardOutcome::InProgress | CardOutcome::Verified => {
                return Err(Error::RetryRefused(GateDenial::NothingToRetry));
            },
        };
        gate.authorize(ctx, Classification::of(kind))
            .map_err(Error::RetryRefused)?;

        debug!("Card sequence: retrying card {slot}");
        self.outcomes.insert(slot, CardOutcome::Pending);
        self.frozen = false;
        Ok(())
    }

    fn freeze(&mut self) {
        self.frozen = true;
        for outcome in self.outcomes.values_mut() {
            if *outcome == CardOutcome::InProgress {
                *outcome = CardOutcome::Pending;
            }
        }
    }
}

/// Verdict over any set of outcomes.
pub fn verdict_of(outcomes: impl IntoIterator<Item = CardOutcome>) -> SequenceVerdict {
    let mut verified = 0usize;
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome {
            CardOutcome::Pending | CardOutcome::InProgress => return SequenceVerdict::Incomplete,
            CardOutcome::Verified => verified += 1,
            CardOutcome::Failed(_) | CardOutcome::PairingFailed => failed += 1,
        }
    }
    match (verified, failed) {
        (_, 0) => SequenceVerdict::AllVerified,
        (0, _) => SequenceVerdict::AllFailed,
        _ => SequenceVerdict::PartialFailure,
    }
}
