//! Binary frame codec for the device link.
//!
//! ```text
//! +------------+--------+------+-------+---------------+--------+
//! |   Magic    | Length | Type | ~Type |    Payload    | CRC16  |
//! +------------+--------+------+-------+---------------+--------+
//! |   4 bytes  | 2 bytes| 1    | 1     |   variable    | 2 bytes|
//! +------------+--------+------+-------+---------------+--------+
//! ```
//!
//! All integers are little-endian. `Length` counts the whole frame, CRC
//! included. The CRC is CRC-16/XMODEM over everything before it.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{CRC_16_XMODEM, Crc};
use log::trace;

use crate::error::{Error, Result};

/// Frame magic number.
pub const FRAME_MAGIC: u32 = 0x4857_4155;

/// Bytes before the payload: magic, length, type, ~type.
pub const HEADER_LEN: usize = 8;

/// Header plus CRC.
pub const OVERHEAD: usize = HEADER_LEN + 2;

/// Largest payload that still fits the 16-bit length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - OVERHEAD;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type byte.
    pub kind: u8,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(kind: u8, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Serialize the frame to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidFrame(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD}",
                self.payload.len()
            )));
        }
        let total = OVERHEAD + self.payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.write_u32::<LittleEndian>(FRAME_MAGIC)?;
        // Bounded by MAX_PAYLOAD above.
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<LittleEndian>(total as u16)?;
        buf.push(self.kind);
        buf.push(!self.kind);
        buf.extend_from_slice(&self.payload);
        let crc = crc16_xmodem(&buf);
        buf.write_u16::<LittleEndian>(crc)?;
        Ok(buf)
    }

    /// Decode exactly one frame from `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < OVERHEAD {
            return Err(Error::InvalidFrame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let (kind, total) = parse_header(&data[..HEADER_LEN])?;
        if total != data.len() {
            return Err(Error::InvalidFrame(format!(
                "length field says {total} bytes, got {}",
                data.len()
            )));
        }

        let body_end = total - 2;
        let expected = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
        let actual = crc16_xmodem(&data[..body_end]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self {
            kind,
            payload: data[HEADER_LEN..body_end].to_vec(),
        })
    }

    /// Read one frame from a byte stream.
    ///
    /// Bytes before the magic are skipped, so line noise left in the receive
    /// buffer after a reset does not desynchronize the reader.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let magic = FRAME_MAGIC.to_le_bytes();
        let mut header = [0u8; HEADER_LEN];
        let mut matched = 0;
        while matched < magic.len() {
            let byte = reader.read_u8()?;
            if byte == magic[matched] {
                matched += 1;
            } else {
                if matched > 0 {
                    trace!("Skipping {matched} bytes of partial magic");
                }
                matched = usize::from(byte == magic[0]);
            }
        }
        header[..4].copy_from_slice(&magic);
        reader.read_exact(&mut header[4..])?;

        let (_, total) = parse_header(&header)?;
        let mut data = header.to_vec();
        data.resize(total, 0);
        reader.read_exact(&mut data[HEADER_LEN..])?;
        Self::decode(&data)
    }
}

fn parse_header(header: &[u8]) -> Result<(u8, usize)> {
    let mut cur = Cursor::new(header);
    let magic = cur.read_u32::<LittleEndian>()?;
    if magic != FRAME_MAGIC {
        return Err(Error::InvalidFrame(format!("bad magic {magic:#010x}")));
    }
    let total = usize::from(cur.read_u16::<LittleEndian>()?);
    if total < OVERHEAD {
        return Err(Error::InvalidFrame(format!("length {total} below minimum")));
    }
    let kind = cur.read_u8()?;
    let inverted = cur.read_u8()?;
    if inverted != !kind {
        return Err(Error::InvalidFrame(format!(
            "type {kind:#04x} does not match complement {inverted:#04x}"
        )));
    }
    Ok((kind, total))
}
