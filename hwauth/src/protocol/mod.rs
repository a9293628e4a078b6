//! Device protocol messages.
//!
//! Requests and responses travel as [`frame::Frame`]s. Variable-length
//! fields are prefixed with a little-endian `u16` length; card slots travel
//! as their 1-based index.

pub mod frame;

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::auth::card::CardSlot;
use crate::classify::FailureSignal;
use crate::connection::DeviceMode;
use crate::error::{Error, Result};
pub use frame::Frame;

/// Largest `data` a [`Request::FirmwareChunk`] can carry: the frame payload
/// minus the `u32` offset and the `u16` length prefix.
pub const MAX_FIRMWARE_CHUNK: usize = frame::MAX_PAYLOAD - 4 - 2;

/// Request type bytes.
mod kind {
    pub const GET_DEVICE_INFO: u8 = 0x01;
    pub const DEVICE_AUTH_START: u8 = 0x10;
    pub const DEVICE_SIGN_CHALLENGE: u8 = 0x11;
    pub const DEVICE_AUTH_RESULT: u8 = 0x12;
    pub const CARD_AUTH_START: u8 = 0x20;
    pub const CARD_SIGN_SERIAL: u8 = 0x21;
    pub const CARD_SIGN_CHALLENGE: u8 = 0x22;
    pub const CARD_PAIR: u8 = 0x23;
    pub const FIRMWARE_UPDATE_START: u8 = 0x30;
    pub const FIRMWARE_CHUNK: u8 = 0x31;
    pub const FIRMWARE_FINISH: u8 = 0x32;
    pub const CANCEL: u8 = 0x7F;

    pub const DEVICE_INFO: u8 = 0x81;
    pub const ACCEPTED: u8 = 0x82;
    pub const REJECTED: u8 = 0x83;
    pub const SERIAL_SIGNATURE: u8 = 0x84;
    pub const CHALLENGE_SIGNATURE: u8 = 0x85;
    pub const PAIRED: u8 = 0x86;
    pub const PAIRING_FAILED: u8 = 0x87;
    pub const CARD_FAULT: u8 = 0x88;
    pub const BOOTLOADER: u8 = 0x89;
    pub const NOT_READY: u8 = 0x8A;
    pub const ACK: u8 = 0x8B;
    pub const NACK: u8 = 0x8C;
}

/// Host to device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Query mode, versions and state byte.
    GetDeviceInfo,
    /// Ask the user to confirm device authentication.
    DeviceAuthStart,
    /// Have the device sign a server challenge.
    DeviceSignChallenge {
        /// Challenge issued by the verification server.
        challenge: Vec<u8>,
    },
    /// Tell the device the outcome of its verification.
    DeviceAuthResult {
        /// Whether the device verified.
        verified: bool,
    },
    /// Ask the user to tap a card.
    CardAuthStart {
        /// Card being authenticated.
        slot: CardSlot,
    },
    /// Have the card sign its serial.
    CardSignSerial {
        /// Card being authenticated.
        slot: CardSlot,
    },
    /// Have the card sign a server challenge.
    CardSignChallenge {
        /// Card being authenticated.
        slot: CardSlot,
        /// Challenge issued by the verification server.
        challenge: Vec<u8>,
    },
    /// Check the card's pairing with this device.
    CardPair {
        /// Card being paired.
        slot: CardSlot,
    },
    /// Ask the user to confirm a firmware update.
    FirmwareUpdateStart {
        /// Version about to be installed.
        version: String,
        /// Image size in bytes.
        size: u32,
    },
    /// One chunk of the firmware image.
    FirmwareChunk {
        /// Offset of `data` in the image.
        offset: u32,
        /// Chunk bytes.
        data: Vec<u8>,
    },
    /// End of image; the device verifies and reboots.
    FirmwareFinish {
        /// SHA-256 of the full image.
        sha256: [u8; 32],
    },
    /// Abort whatever the device is waiting for.
    Cancel,
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetDeviceInfo => "GetDeviceInfo",
            Self::DeviceAuthStart => "DeviceAuthStart",
            Self::DeviceSignChallenge { .. } => "DeviceSignChallenge",
            Self::DeviceAuthResult { .. } => "DeviceAuthResult",
            Self::CardAuthStart { .. } => "CardAuthStart",
            Self::CardSignSerial { .. } => "CardSignSerial",
            Self::CardSignChallenge { .. } => "CardSignChallenge",
            Self::CardPair { .. } => "CardPair",
            Self::FirmwareUpdateStart { .. } => "FirmwareUpdateStart",
            Self::FirmwareChunk { .. } => "FirmwareChunk",
            Self::FirmwareFinish { .. } => "FirmwareFinish",
            Self::Cancel => "Cancel",
        }
    }

    /// Whether the reply depends on the user physically confirming or
    /// tapping a card, so the transport should wait longer for it.
    pub fn awaits_user(&self) -> bool {
        matches!(
            self,
            Self::DeviceAuthStart | Self::CardAuthStart { .. } | Self::FirmwareUpdateStart { .. }
        )
    }

    /// Build the frame for this request.
    pub fn to_frame(&self) -> Result<Frame> {
        let mut payload = Vec::new();
        let kind = match self {
            Self::GetDeviceInfo => kind::GET_DEVICE_INFO,
            Self::DeviceAuthStart => kind::DEVICE_AUTH_START,
            Self::DeviceSignChallenge { challenge } => {
                put_bytes(&mut payload, challenge)?;
                kind::DEVICE_SIGN_CHALLENGE
            },
            Self::DeviceAuthResult { verified } => {
                payload.push(u8::from(*verified));
                kind::DEVICE_AUTH_RESULT
            },
            Self::CardAuthStart { slot } => {
                payload.push(slot.index());
                kind::CARD_AUTH_START
            },
            Self::CardSignSerial { slot } => {
                payload.push(slot.index());
                kind::CARD_SIGN_SERIAL
            },
            Self::CardSignChallenge { slot, challenge } => {
                payload.push(slot.index());
                put_bytes(&mut payload, challenge)?;
                kind::CARD_SIGN_CHALLENGE
            },
            Self::CardPair { slot } => {
                payload.push(slot.index());
                kind::CARD_PAIR
            },
            Self::FirmwareUpdateStart { version, size } => {
                put_bytes(&mut payload, version.as_bytes())?;
                payload.write_u32::<LittleEndian>(*size)?;
                kind::FIRMWARE_UPDATE_START
            },
            Self::FirmwareChunk { offset, data } => {
                payload.write_u32::<LittleEndian>(*offset)?;
                put_bytes(&mut payload, data)?;
                kind::FIRMWARE_CHUNK
            },
            Self::FirmwareFinish { sha256 } => {
                payload.extend_from_slice(sha256);
                kind::FIRMWARE_FINISH
            },
            Self::Cancel => kind::CANCEL,
        };
        Ok(Frame::new(kind, payload))
    }
}

/// Identity and mode reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Which firmware the device is running.
    pub mode: DeviceMode,
    /// Persisted onboarding/state byte.
    pub state: u8,
    /// Negotiated SDK/protocol version.
    pub sdk_version: String,
    /// Installed application firmware version, absent in the bootloader.
    pub firmware_version: Option<String>,
}

/// Device to host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Reply to [`Request::GetDeviceInfo`].
    DeviceInfo(DeviceInfo),
    /// The user confirmed the request.
    Accepted,
    /// The user rejected the request on the device.
    Rejected,
    /// Serial and its signature.
    SerialSignature {
        /// Device or card serial.
        serial: Vec<u8>,
        /// Signature over the serial.
        signature: Vec<u8>,
    },
    /// Signature over a server challenge.
    ChallengeSignature {
        /// Signature bytes.
        signature: Vec<u8>,
    },
    /// Card pairing is valid.
    Paired,
    /// Card pairing key does not match this device.
    PairingFailed,
    /// The card reported a fault.
    CardFault,
    /// The device is in its bootloader.
    Bootloader,
    /// The device is busy.
    NotReady,
    /// Generic acknowledgement.
    Ack,
    /// Generic negative acknowledgement with an error code.
    Nack(u8),
}

impl Response {
    /// Failure signal carried by this response, if it reports one.
    pub fn failure_signal(&self) -> Option<FailureSignal> {
        match self {
            Self::Rejected => Some(FailureSignal::UserRejected),
            Self::PairingFailed => Some(FailureSignal::CardPairingFailed),
            Self::CardFault => Some(FailureSignal::CardFault),
            Self::Bootloader => Some(FailureSignal::Bootloader),
            Self::NotReady => Some(FailureSignal::NotReady),
            Self::Nack(code) => Some(FailureSignal::Nack(*code)),
            Self::DeviceInfo(_)
            | Self::Accepted
            | Self::SerialSignature { .. }
            | Self::ChallengeSignature { .. }
            | Self::Paired
            | Self::Ack => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceInfo(_) => "DeviceInfo",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::SerialSignature { .. } => "SerialSignature",
            Self::ChallengeSignature { .. } => "ChallengeSignature",
            Self::Paired => "Paired",
            Self::PairingFailed => "PairingFailed",
            Self::CardFault => "CardFault",
            Self::Bootloader => "Bootloader",
            Self::NotReady => "NotReady",
            Self::Ack => "Ack",
            Self::Nack(_) => "Nack",
        }
    }

    /// Parse a response frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut cur = Cursor::new(frame.payload.as_slice());
        let response = match frame.kind {
            kind::DEVICE_INFO => {
                let mode = DeviceMode::from_byte(read_u8(&mut cur)?)?;
                let state = read_u8(&mut cur)?;
                let sdk_version = get_string(&mut cur)?;
                let firmware_version = Some(get_string(&mut cur)?).filter(|v| !v.is_empty());
                Self::DeviceInfo(DeviceInfo {
                    mode,
                    state,
                    sdk_version,
                    firmware_version,
                })
            },
            kind::ACCEPTED => Self::Accepted,
            kind::REJECTED => Self::Rejected,
            kind::SERIAL_SIGNATURE => Self::SerialSignature {
                serial: get_bytes(&mut cur)?,
                signature: get_bytes(&mut cur)?,
            },
            kind::CHALLENGE_SIGNATURE => Self::ChallengeSignature {
                signature: get_bytes(&mut cur)?,
            },
            kind::PAIRED => Self::Paired,
            kind::PAIRING_FAILED => Self::PairingFailed,
            kind::CARD_FAULT => Self::CardFault,
            kind::BOOTLOADER => Self::Bootloader,
            kind::NOT_READY => Self::NotReady,
            kind::ACK => Self::Ack,
            kind::NACK => Self::Nack(read_u8(&mut cur)?),
            other => {
                return Err(Error::InvalidFrame(format!(
                    "unknown response type {other:#04x}"
                )));
            },
        };
        Ok(response)
    }

    /// Build the frame for this response. Used by device simulators and tests.
    pub fn to_frame(&self) -> Result<Frame> {
        let mut payload = Vec::new();
        let kind = match self {
            Self::DeviceInfo(info) => {
                payload.push(info.mode.to_byte());
                payload.push(info.state);
                put_bytes(&mut payload, info.sdk_version.as_bytes())?;
                let fw = info.firmware_version.as_deref().unwrap_or_default();
                put_bytes(&mut payload, fw.as_bytes())?;
                kind::DEVICE_INFO
            },
            Self::Accepted => kind::ACCEPTED,
            Self::Rejected => kind::REJECTED,
            Self::SerialSignature { serial, signature } => {
                put_bytes(&mut payload, serial)?;
                put_bytes(&mut payload, signature)?;
                kind::SERIAL_SIGNATURE
            },
            Self::ChallengeSignature { signature } => {
                put_bytes(&mut payload, signature)?;
                kind::CHALLENGE_SIGNATURE
            },
            Self::Paired => kind::PAIRED,
            Self::PairingFailed => kind::PAIRING_FAILED,
            Self::CardFault => kind::CARD_FAULT,
            Self::Bootloader => kind::BOOTLOADER,
            Self::NotReady => kind::NOT_READY,
            Self::Ack => kind::ACK,
            Self::Nack(code) => {
                payload.push(*code);
                kind::NACK
            },
        };
        Ok(Frame::new(kind, payload))
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::InvalidFrame(format!("field of {} bytes too long", bytes.len())))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn truncated() -> Error {
    Error::InvalidFrame("truncated payload".into())
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    cur.read_u8().map_err(|_| truncated())
}

fn get_bytes(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cur.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    let mut bytes = vec![0u8; usize::from(len)];
    cur.read_exact(&mut bytes).map_err(|_| truncated())?;
    Ok(bytes)
}

fn get_string(cur: &mut Cursor<&[u8]>) -> Result<String> {
    String::from_utf8(get_bytes(cur)?)
        .map_err(|e| Error::InvalidFrame(format!("invalid UTF-8 in string field: {e}")))
}
