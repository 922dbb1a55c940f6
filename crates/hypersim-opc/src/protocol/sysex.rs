//! System exclusive (sysEx) messages
//!
//! A sysEx payload carries a big-endian 16-bit system id and command id
//! followed by a command-specific body. Only system id 1 is understood:
//!
//! - command 1: color correction, UTF-8 JSON `{"gamma": 2.2, "whitepoint": [1.0, 0.9, 0.8]}`
//! - command 2: firmware flags, one byte (bit0 no dithering, bit1 no
//!   interpolation, bit2 manual LED control, bit3 LED on/off)

use serde::{Deserialize, Serialize};

use super::encode_sysex;
use crate::color::ColorCorrectionParams;
use crate::{error::OpcError, Result};

/// System id of the LED controller this server emulates
pub const SYSTEM_ID: u16 = 1;
/// Set global gamma and whitepoint
pub const CMD_COLOR_CORRECTION: u16 = 1;
/// Set firmware configuration flags
pub const CMD_FIRMWARE_CONFIG: u16 = 2;

const FLAG_NO_DITHER: u8 = 1 << 0;
const FLAG_NO_INTERP: u8 = 1 << 1;
const FLAG_MANUAL_LED: u8 = 1 << 2;
const FLAG_LED_ON_OFF: u8 = 1 << 3;

/// Firmware configuration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FirmwareFlags {
    pub disable_dithering: bool,
    pub disable_interpolation: bool,
    pub manual_led_control: bool,
    pub led_on_off: bool,
}

impl FirmwareFlags {
    /// Decode the low four bits of a flag byte. Upper bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            disable_dithering: bits & FLAG_NO_DITHER != 0,
            disable_interpolation: bits & FLAG_NO_INTERP != 0,
            manual_led_control: bits & FLAG_MANUAL_LED != 0,
            led_on_off: bits & FLAG_LED_ON_OFF != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.disable_dithering {
            bits |= FLAG_NO_DITHER;
        }
        if self.disable_interpolation {
            bits |= FLAG_NO_INTERP;
        }
        if self.manual_led_control {
            bits |= FLAG_MANUAL_LED;
        }
        if self.led_on_off {
            bits |= FLAG_LED_ON_OFF;
        }
        bits
    }

    /// Build a complete firmware-config sysEx message for these flags
    pub fn to_message(&self) -> Result<Vec<u8>> {
        encode_sysex(SYSTEM_ID, CMD_FIRMWARE_CONFIG, &[self.bits()])
    }
}

/// Partial flag update; `None` keeps the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareFlagsUpdate {
    pub disable_dithering: Option<bool>,
    pub disable_interpolation: Option<bool>,
    pub manual_led_control: Option<bool>,
    pub led_on_off: Option<bool>,
}

impl FirmwareFlagsUpdate {
    /// An update that sets every flag
    pub fn full(flags: FirmwareFlags) -> Self {
        Self {
            disable_dithering: Some(flags.disable_dithering),
            disable_interpolation: Some(flags.disable_interpolation),
            manual_led_control: Some(flags.manual_led_control),
            led_on_off: Some(flags.led_on_off),
        }
    }

    pub fn apply_to(&self, flags: &mut FirmwareFlags) {
        if let Some(v) = self.disable_dithering {
            flags.disable_dithering = v;
        }
        if let Some(v) = self.disable_interpolation {
            flags.disable_interpolation = v;
        }
        if let Some(v) = self.manual_led_control {
            flags.manual_led_control = v;
        }
        if let Some(v) = self.led_on_off {
            flags.led_on_off = v;
        }
    }
}

/// A sysEx message after body validation
#[derive(Debug, Clone, PartialEq)]
pub enum SysExMessage {
    ColorCorrection(ColorCorrectionParams),
    FirmwareConfig(FirmwareFlagsUpdate),
    /// Known system, unrecognized command
    UnknownCommand { command_id: u16 },
    /// Unrecognized system
    UnknownDevice { system_id: u16, command_id: u16 },
}

/// Validate a sysEx body against its system and command ids
pub fn parse(system_id: u16, command_id: u16, body: &[u8]) -> Result<SysExMessage> {
    if system_id != SYSTEM_ID {
        return Ok(SysExMessage::UnknownDevice {
            system_id,
            command_id,
        });
    }

    match command_id {
        CMD_COLOR_CORRECTION => parse_color_correction(body).map(SysExMessage::ColorCorrection),
        CMD_FIRMWARE_CONFIG => {
            let bits = body.first().copied().ok_or_else(|| {
                OpcError::DecodeError("empty firmware config body".to_string())
            })?;
            Ok(SysExMessage::FirmwareConfig(FirmwareFlagsUpdate::full(
                FirmwareFlags::from_bits(bits),
            )))
        }
        command_id => Ok(SysExMessage::UnknownCommand { command_id }),
    }
}

fn parse_color_correction(body: &[u8]) -> Result<ColorCorrectionParams> {
    let text = std::str::from_utf8(body)
        .map_err(|e| OpcError::DecodeError(format!("color correction body is not UTF-8: {}", e)))?;

    serde_json::from_str(text)
        .map_err(|e| OpcError::DecodeError(format!("invalid color correction body: {}", e)))
}
