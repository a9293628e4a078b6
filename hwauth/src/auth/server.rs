//! Remote signature verification.

use std::fmt;

use crate::auth::card::CardSlot;
use crate::error::Result;

/// What a signature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    /// The device itself.
    Device,
    /// One of the cards.
    Card(CardSlot),
}

impl fmt::Display for AuthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Card(slot) => write!(f, "card {slot}"),
        }
    }
}

/// Server answer to a serial signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialVerdict {
    /// The serial verified; sign this challenge next.
    Challenge(Vec<u8>),
    /// The serial signature did not verify.
    Rejected,
}

/// Verification server.
///
/// Both calls block until the server answers. Transport failures are
/// reported as errors; a signature that does not verify is a verdict.
pub trait AuthServer {
    /// Check a serial signature and obtain a challenge.
    fn verify_serial(
        &self,
        target: AuthTarget,
        serial: &[u8],
        signature: &[u8],
    ) -> Result<SerialVerdict>;

    /// Check a challenge signature.
    fn verify_challenge(
        &self,
        target: AuthTarget,
        serial: &[u8],
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<bool>;
}

impl<T: AuthServer + ?Sized> AuthServer for &T {
    fn verify_serial(
        &self,
        target: AuthTarget,
        serial: &[u8],
        signature: &[u8],
    ) -> Result<SerialVerdict> {
        (**self).verify_serial(target, serial, signature)
    }

    fn verify_challenge(
        &self,
        target: AuthTarget,
        serial: &[u8],
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        (**self).verify_challenge(target, serial, challenge, signature)
    }
}
