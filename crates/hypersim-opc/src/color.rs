//! Gamma and whitepoint color correction
//!
//! Corrected values come from a per-channel lookup table:
//!
//! ```text
//! table[c][i] = clamp(0, 255, round(i^gamma * whitepoint[c]))
//! ```
//!
//! The exponent is applied to the raw byte value, not to a normalized
//! `i / 255`. This matches the controller firmware convention: any gamma
//! above 1.0 saturates most of the range, and whitepoints well below 1.0
//! are expected to pull it back down.
//!
//! The table is rebuilt in full on every parameter change and published
//! atomically, so readers always see a table computed from one parameter set.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::protocol::sysex::{CMD_COLOR_CORRECTION, SYSTEM_ID};
use crate::protocol::{encode_sysex, Frame, Pixel};
use crate::{error::OpcError, Result};

/// Number of entries per channel
pub const TABLE_SIZE: usize = 256;

/// Global color correction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorCorrectionParams {
    pub gamma: f64,
    /// Per-channel scale (r, g, b). Usually 0.0-1.0 but not clamped.
    pub whitepoint: [f64; 3],
}

impl Default for ColorCorrectionParams {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            whitepoint: [1.0, 1.0, 1.0],
        }
    }
}

impl ColorCorrectionParams {
    pub fn new(gamma: f64, whitepoint: [f64; 3]) -> Self {
        Self { gamma, whitepoint }
    }

    /// Gamma must be positive and finite; whitepoint values must be finite
    pub fn validate(&self) -> Result<()> {
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(OpcError::InvalidParameter(format!(
                "gamma must be a positive finite number, got {}",
                self.gamma
            )));
        }
        if let Some(value) = self.whitepoint.iter().find(|v| !v.is_finite()) {
            return Err(OpcError::InvalidParameter(format!(
                "whitepoint values must be finite, got {}",
                value
            )));
        }
        Ok(())
    }

    /// JSON body of the color-correction sysEx command
    pub fn to_sysex_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            OpcError::InvalidParameter(format!("cannot encode color correction: {}", e))
        })
    }

    /// Complete color-correction sysEx message
    pub fn to_message(&self) -> Result<Vec<u8>> {
        encode_sysex(SYSTEM_ID, CMD_COLOR_CORRECTION, &self.to_sysex_body()?)
    }
}

/// One of the three color channels of a pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
}

impl ColorChannel {
    pub const ALL: [ColorChannel; 3] = [Self::Red, Self::Green, Self::Blue];

    fn index(self) -> usize {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Blue => 2,
        }
    }
}

/// Precomputed 3x256 correction table
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    params: ColorCorrectionParams,
    channels: [[u8; TABLE_SIZE]; 3],
}

impl LookupTable {
    /// Build the table for the given parameters. Parameters are not validated.
    pub fn compute(params: &ColorCorrectionParams) -> Self {
        let mut channels = [[0u8; TABLE_SIZE]; 3];
        for (table, scale) in channels.iter_mut().zip(params.whitepoint) {
            for (i, entry) in table.iter_mut().enumerate() {
                let value = (i as f64).powf(params.gamma) * scale;
                // NaN (0 * inf) saturates to 0
                *entry = value.round().clamp(0.0, 255.0) as u8;
            }
        }

        Self {
            params: *params,
            channels,
        }
    }

    pub fn identity() -> Self {
        Self::compute(&ColorCorrectionParams::default())
    }

    /// Parameters the table was computed from
    pub fn params(&self) -> &ColorCorrectionParams {
        &self.params
    }

    /// Table for one channel
    pub fn channel(&self, channel: ColorChannel) -> &[u8; TABLE_SIZE] {
        &self.channels[channel.index()]
    }

    #[inline]
    pub fn lookup(&self, channel: ColorChannel, value: u8) -> u8 {
        self.channel(channel)[value as usize]
    }

    #[inline]
    pub fn apply_pixel(&self, pixel: Pixel) -> Pixel {
        Pixel::new(
            self.channels[0][pixel.r as usize],
            self.channels[1][pixel.g as usize],
            self.channels[2][pixel.b as usize],
        )
    }
}

impl Default for LookupTable {
    fn default() -> Self {
        Self::identity()
    }
}

/// Owns the correction parameters and the table derived from them
pub struct ColorCorrector {
    table: ArcSwap<LookupTable>,
}

impl ColorCorrector {
    /// Create a corrector with gamma 1.0 and whitepoint (1, 1, 1)
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(LookupTable::identity()),
        }
    }

    pub fn with_params(params: ColorCorrectionParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            table: ArcSwap::from_pointee(LookupTable::compute(&params)),
        })
    }

    /// Validate the parameters and replace the table.
    ///
    /// On error the previous table stays in place.
    pub fn set_parameters(&self, params: ColorCorrectionParams) -> Result<()> {
        params.validate()?;
        self.table.store(Arc::new(LookupTable::compute(&params)));
        tracing::debug!(
            "Color correction set: gamma={} whitepoint={:?}",
            params.gamma,
            params.whitepoint
        );
        Ok(())
    }

    pub fn params(&self) -> ColorCorrectionParams {
        *self.table.load().params()
    }

    /// Snapshot of the current table
    pub fn table(&self) -> Arc<LookupTable> {
        self.table.load_full()
    }

    /// Map every pixel through one snapshot of the table
    pub fn apply(&self, frame: &Frame) -> Frame {
        let table = self.table.load();
        frame.iter().map(|pixel| table.apply_pixel(*pixel)).collect()
    }
}

impl Default for ColorCorrector {
    fn default() -> Self {
        Self::new()
    }
}
