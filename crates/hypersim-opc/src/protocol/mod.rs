//! Open Pixel Control wire format
//!
//! Every OPC message is a 4-byte big-endian header followed by a payload:
//!
//! | byte | field                                              |
//! |------|----------------------------------------------------|
//! | 0    | channel (0 = all channels)                         |
//! | 1    | command (0x00 = set pixel colors, 0xFF = sysEx)    |
//! | 2    | length, high byte                                  |
//! | 3    | length, low byte                                   |
//! | 4..  | `length` payload bytes                             |
//!
//! Pixel payloads are consecutive `(r, g, b)` byte triples. SysEx payloads
//! start with a 16-bit system id and a 16-bit command id, see [`sysex`].
//!
//! ## Example
//!
//! ```rust
//! use hypersim_opc::protocol::{self, Command, Pixel};
//!
//! # fn main() -> hypersim_opc::Result<()> {
//! let bytes = protocol::encode_pixels(0, &[Pixel::new(10, 20, 30)])?;
//! match protocol::decode_message(&bytes)? {
//!     Command::SetPixels { frame, .. } => assert_eq!(frame.pixels()[0].g, 20),
//!     other => panic!("unexpected command {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

pub mod sysex;

use serde::{Deserialize, Serialize};

use crate::{error::OpcError, Result};

/// Size of the message header in bytes
pub const HEADER_LEN: usize = 4;
/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;
/// Default OPC TCP port
pub const DEFAULT_PORT: u16 = 7890;

/// Command byte: set pixel colors
pub const CMD_SET_PIXELS: u8 = 0x00;
/// Command byte: system exclusive
pub const CMD_SYSEX: u8 = 0xFF;

/// Channel 0 addresses every strand
pub const BROADCAST_CHANNEL: u8 = 0;

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub channel: u8,
    pub command: u8,
    pub length: u16,
}

impl Header {
    /// Parse the four header bytes. Every byte combination is a valid header.
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            channel: bytes[0],
            command: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Number of payload bytes that follow this header
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.length.to_be_bytes();
        [self.channel, self.command, hi, lo]
    }
}

/// A single RGB pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Pixel {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build a pixel from computed values, clamping each channel into 0-255
    pub fn from_clamped(r: i32, g: i32, b: i32) -> Self {
        let clamp = |v: i32| v.clamp(0, 255) as u8;
        Self::new(clamp(r), clamp(g), clamp(b))
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<(u8, u8, u8)> for Pixel {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self::new(r, g, b)
    }
}

/// An ordered list of pixels; index 0 is the first LED of the string
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Frame(Vec<Pixel>);

impl Frame {
    pub fn new(pixels: Vec<Pixel>) -> Self {
        Self(pixels)
    }

    /// Group raw bytes into pixels. Trailing bytes that do not form a full
    /// triple are dropped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(
            bytes
                .chunks_exact(3)
                .map(|rgb| Pixel::new(rgb[0], rgb[1], rgb[2]))
                .collect(),
        )
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pixel> {
        self.0.iter()
    }
}

impl From<Vec<Pixel>> for Frame {
    fn from(pixels: Vec<Pixel>) -> Self {
        Self(pixels)
    }
}

impl FromIterator<Pixel> for Frame {
    fn from_iter<I: IntoIterator<Item = Pixel>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Frame {
    type Item = &'a Pixel;
    type IntoIter = std::slice::Iter<'a, Pixel>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A decoded OPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set pixel colors, starting at the first LED
    SetPixels { channel: u8, frame: Frame },
    /// Pixel command whose payload holds less than one full pixel
    Noop { channel: u8 },
    /// System exclusive message
    SysEx {
        system_id: u16,
        command_id: u16,
        body: Vec<u8>,
    },
    /// Any other command byte. Logged by the caller, never applied.
    Unknown { channel: u8, command: u8 },
}

impl Command {
    /// Short human-readable name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetPixels { .. } => "set-pixels",
            Command::Noop { .. } => "noop",
            Command::SysEx { .. } => "sysex",
            Command::Unknown { .. } => "unknown",
        }
    }
}

/// Decode a message whose payload has already been read in full.
///
/// `payload` must be exactly `header.length` bytes long; the transport is
/// responsible for delivering that many bytes.
pub fn decode(header: Header, payload: &[u8]) -> Result<Command> {
    if payload.len() != header.payload_len() {
        return Err(OpcError::FramingError(format!(
            "header announces {} payload bytes, got {}",
            header.length,
            payload.len()
        )));
    }

    let command = match header.command {
        CMD_SET_PIXELS if payload.len() < 3 => Command::Noop {
            channel: header.channel,
        },
        CMD_SET_PIXELS => Command::SetPixels {
            channel: header.channel,
            frame: Frame::from_bytes(payload),
        },
        CMD_SYSEX if payload.len() > 3 => Command::SysEx {
            system_id: u16::from_be_bytes([payload[0], payload[1]]),
            command_id: u16::from_be_bytes([payload[2], payload[3]]),
            body: payload[4..].to_vec(),
        },
        CMD_SYSEX => Command::SysEx {
            system_id: 0,
            command_id: 0,
            body: Vec::new(),
        },
        command => Command::Unknown {
            channel: header.channel,
            command,
        },
    };

    Ok(command)
}

/// Decode one complete message (header + payload) from a buffer
pub fn decode_message(bytes: &[u8]) -> Result<Command> {
    if bytes.len() < HEADER_LEN {
        return Err(OpcError::FramingError(format!(
            "message too short for a header: {} bytes",
            bytes.len()
        )));
    }
    let header = Header::parse([bytes[0], bytes[1], bytes[2], bytes[3]]);
    decode(header, &bytes[HEADER_LEN..])
}

/// Build a raw message. Payloads longer than 65535 bytes cannot be framed.
pub fn encode_message(channel: u8, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        OpcError::FramingError(format!(
            "payload of {} bytes exceeds maximum of {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        ))
    })?;

    let header = Header {
        channel,
        command,
        length,
    };

    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(&header.to_bytes());
    message.extend_from_slice(payload);
    Ok(message)
}

/// Build a set-pixel-colors message
pub fn encode_pixels(channel: u8, pixels: &[Pixel]) -> Result<Vec<u8>> {
    let payload: Vec<u8> = pixels.iter().flat_map(|p| p.to_bytes()).collect();
    encode_message(channel, CMD_SET_PIXELS, &payload)
}

/// Build a sysEx message. SysEx is always sent on the broadcast channel.
pub fn encode_sysex(system_id: u16, command_id: u16, body: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&system_id.to_be_bytes());
    payload.extend_from_slice(&command_id.to_be_bytes());
    payload.extend_from_slice(body);
    encode_message(BROADCAST_CHANNEL, CMD_SYSEX, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let header = Header::parse([3, CMD_SET_PIXELS, 0x01, 0x02]);
        assert_eq!(header.channel, 3);
        assert_eq!(header.command, CMD_SET_PIXELS);
        assert_eq!(header.payload_len(), 258);
        assert_eq!(header.to_bytes(), [3, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_pixels() {
        let header = Header::parse([0, 0, 0, 6]);
        let command = decode(header, &[10, 20, 30, 40, 50, 60]).unwrap();

        assert_eq!(
            command,
            Command::SetPixels {
                channel: 0,
                frame: Frame::new(vec![Pixel::new(10, 20, 30), Pixel::new(40, 50, 60)]),
            }
        );
    }

    #[test]
    fn test_trailing_bytes_dropped() {
        let header = Header::parse([0, 0, 0, 5]);
        match decode(header, &[1, 2, 3, 4, 5]).unwrap() {
            Command::SetPixels { frame, .. } => {
                assert_eq!(frame.len(), 1);
                assert_eq!(frame.pixels()[0], Pixel::new(1, 2, 3));
            }
            other => panic!("expected pixels, got {:?}", other),
        }
    }

    #[test]
    fn test_undersized_pixel_payload_is_noop() {
        assert_eq!(
            decode(Header::parse([7, 0, 0, 0]), &[]).unwrap(),
            Command::Noop { channel: 7 }
        );
        assert_eq!(
            decode(Header::parse([0, 0, 0, 2]), &[9, 9]).unwrap(),
            Command::Noop { channel: 0 }
        );
    }

    #[test]
    fn test_decode_sysex() {
        let payload = [0x00, 0x01, 0x00, 0x02, 0b1010];
        let command = decode(Header::parse([0, CMD_SYSEX, 0, 5]), &payload).unwrap();

        assert_eq!(
            command,
            Command::SysEx {
                system_id: 1,
                command_id: 2,
                body: vec![0b1010],
            }
        );
    }

    #[test]
    fn test_short_sysex_has_zero_ids() {
        let command = decode(Header::parse([0, CMD_SYSEX, 0, 3]), &[1, 2, 3]).unwrap();
        assert_eq!(
            command,
            Command::SysEx {
                system_id: 0,
                command_id: 0,
                body: Vec::new(),
            }
        );
    }

    #[test]
    fn test_unknown_command() {
        let command = decode(Header::parse([2, 0x42, 0, 1]), &[0]).unwrap();
        assert_eq!(
            command,
            Command::Unknown {
                channel: 2,
                command: 0x42
            }
        );
        assert_eq!(command.name(), "unknown");
    }

    #[test]
    fn test_length_mismatch_is_framing_error() {
        let result = decode(Header::parse([0, 0, 0, 6]), &[1, 2, 3]);
        assert!(matches!(result, Err(OpcError::FramingError(_))));

        let result = decode_message(&[0, 0]);
        assert!(matches!(result, Err(OpcError::FramingError(_))));
    }

    #[test]
    fn test_encode_sysex_layout() {
        let message = encode_sysex(1, 2, &[0x0F]).unwrap();
        assert_eq!(message, vec![0, 0xFF, 0, 5, 0, 1, 0, 2, 0x0F]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let result = encode_message(0, CMD_SET_PIXELS, &payload);
        assert!(matches!(result, Err(OpcError::FramingError(_))));

        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let message = encode_message(0, CMD_SET_PIXELS, &payload).unwrap();
        assert_eq!(&message[..4], &[0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn test_pixel_from_clamped() {
        assert_eq!(Pixel::from_clamped(-5, 128, 300), Pixel::new(0, 128, 255));
    }
}
