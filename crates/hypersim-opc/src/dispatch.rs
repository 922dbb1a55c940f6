//! Command routing and the standby gate
//!
//! Every command is applied while holding a single gate lock. Engaging
//! standby takes that same lock and keeps it until the returned
//! [`StandbyGuard`] is dropped, so a consumer can rebuild its rendering
//! state without racing an in-flight pixel update.
//!
//! While standby is engaged:
//! - pixel updates wait for the gate and are applied after release
//! - color-correction commands are dropped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};

use crate::color::{ColorCorrectionParams, ColorCorrector};
use crate::protocol::sysex::{self, FirmwareFlags, FirmwareFlagsUpdate, SysExMessage};
use crate::protocol::{Command, Frame};
use crate::{error::OpcError, Result};

/// Receives corrected frames and correction changes.
///
/// Both methods run on the connection task that received the command and
/// must return quickly.
pub trait PixelSink: Send + Sync {
    /// Called with the color-corrected frame
    fn pixels_updated(&self, frame: &Frame);

    /// Called after a color-correction command was applied
    fn color_correction_changed(&self, _params: &ColorCorrectionParams) {}
}

impl<F> PixelSink for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn pixels_updated(&self, frame: &Frame) {
        self(frame)
    }
}

/// What a dispatched command did
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Frame corrected and handed to the sink (pixel count)
    PixelsUpdated(usize),
    ColorCorrectionApplied(ColorCorrectionParams),
    /// Color correction received during standby and dropped
    ColorCorrectionSuppressed,
    /// Flags after the update
    FirmwareFlagsUpdated(FirmwareFlags),
    /// Nothing to apply (no-op, unknown command, unknown sysEx)
    Ignored,
}

/// Routes decoded commands to the color corrector, the firmware flags and
/// the pixel sink
pub struct CommandDispatcher {
    corrector: Arc<ColorCorrector>,
    sink: Option<Arc<dyn PixelSink>>,
    firmware_flags: RwLock<FirmwareFlags>,
    /// Most recent raw (uncorrected) frame
    last_frame: Mutex<Option<Frame>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    standby: Arc<AtomicBool>,
}

impl CommandDispatcher {
    pub fn new(corrector: Arc<ColorCorrector>, sink: Option<Arc<dyn PixelSink>>) -> Self {
        Self {
            corrector,
            sink,
            firmware_flags: RwLock::new(FirmwareFlags::default()),
            last_frame: Mutex::new(None),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            standby: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn color_corrector(&self) -> &Arc<ColorCorrector> {
        &self.corrector
    }

    pub fn firmware_flags(&self) -> FirmwareFlags {
        *self.firmware_flags.read()
    }

    /// Most recent frame, corrected with the current table
    pub fn latest_frame(&self) -> Option<Frame> {
        self.last_frame
            .lock()
            .as_ref()
            .map(|frame| self.corrector.apply(frame))
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    /// Apply one decoded command.
    ///
    /// Errors are local to the command: a sysEx body that fails to decode or
    /// carries invalid parameters leaves all state untouched.
    pub async fn dispatch(&self, command: Command) -> Result<DispatchOutcome> {
        match command {
            Command::SetPixels { channel, frame } => {
                let _gate = self.gate.lock().await;
                trace!("Channel {}: {} pixels", channel, frame.len());
                Ok(self.apply_pixels(frame))
            }
            Command::Noop { channel } => {
                trace!("Channel {}: empty pixel command", channel);
                Ok(DispatchOutcome::Ignored)
            }
            Command::SysEx {
                system_id,
                command_id,
                body,
            } => match sysex::parse(system_id, command_id, &body)? {
                SysExMessage::ColorCorrection(params) => self.apply_color_correction(params).await,
                SysExMessage::FirmwareConfig(update) => {
                    let _gate = self.gate.lock().await;
                    Ok(DispatchOutcome::FirmwareFlagsUpdated(
                        self.update_firmware_flags(update),
                    ))
                }
                SysExMessage::UnknownCommand { command_id } => {
                    warn!("Ignoring unknown sysEx command {}", command_id);
                    Ok(DispatchOutcome::Ignored)
                }
                SysExMessage::UnknownDevice {
                    system_id,
                    command_id,
                } => {
                    warn!(
                        "Ignoring sysEx for unknown system {} (command {})",
                        system_id, command_id
                    );
                    Ok(DispatchOutcome::Ignored)
                }
            },
            Command::Unknown { channel, command } => {
                warn!(
                    "Ignoring unknown OPC command 0x{:02X} on channel {}",
                    command, channel
                );
                Ok(DispatchOutcome::Ignored)
            }
        }
    }

    /// Merge a flag update and return the resulting flags
    pub fn update_firmware_flags(&self, update: FirmwareFlagsUpdate) -> FirmwareFlags {
        let mut flags = self.firmware_flags.write();
        update.apply_to(&mut flags);
        info!("Firmware flags: {:?}", *flags);
        *flags
    }

    /// Suspend command dispatch until the returned guard is dropped.
    ///
    /// Fails with [`OpcError::LockTimeout`] if a command in flight keeps the
    /// gate longer than `timeout`, or if standby is already engaged.
    pub async fn engage_standby(&self, timeout: Duration) -> Result<StandbyGuard> {
        let gate = tokio::time::timeout(timeout, self.gate.clone().lock_owned())
            .await
            .map_err(|_| OpcError::LockTimeout(timeout))?;

        self.standby.store(true, Ordering::Release);
        info!("Standby engaged");

        Ok(StandbyGuard {
            standby: self.standby.clone(),
            _gate: gate,
        })
    }

    fn apply_pixels(&self, frame: Frame) -> DispatchOutcome {
        let corrected = self.corrector.apply(&frame);
        if let Some(sink) = &self.sink {
            sink.pixels_updated(&corrected);
        }
        *self.last_frame.lock() = Some(frame);
        DispatchOutcome::PixelsUpdated(corrected.len())
    }

    async fn apply_color_correction(
        &self,
        params: ColorCorrectionParams,
    ) -> Result<DispatchOutcome> {
        if self.is_standby() {
            info!("Standby engaged, dropping color correction {:?}", params);
            return Ok(DispatchOutcome::ColorCorrectionSuppressed);
        }

        let _gate = self.gate.lock().await;
        self.corrector.set_parameters(params)?;
        info!(
            "Color correction applied: gamma={} whitepoint={:?}",
            params.gamma, params.whitepoint
        );

        if let Some(sink) = &self.sink {
            sink.color_correction_changed(&params);
            // Sinks may call back into `latest_frame`; never hold the lock across the callback
            let last = self.last_frame.lock().clone();
            if let Some(frame) = last {
                debug!("Re-rendering last frame with new correction");
                sink.pixels_updated(&self.corrector.apply(&frame));
            }
        }

        Ok(DispatchOutcome::ColorCorrectionApplied(params))
    }
}

/// Keeps command dispatch suspended; dropping it leaves standby
pub struct StandbyGuard {
    standby: Arc<AtomicBool>,
    _gate: OwnedMutexGuard<()>,
}

impl StandbyGuard {
    /// Leave standby
    pub fn release(self) {}
}

impl Drop for StandbyGuard {
    fn drop(&mut self) {
        // Cleared before the gate field is dropped
        self.standby.store(false, Ordering::Release);
        info!("Standby released");
    }
}
