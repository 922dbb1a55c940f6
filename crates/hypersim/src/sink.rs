use hypersim_opc::{ColorCorrectionParams, Frame, PixelSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Headless consumer: counts frames and logs a summary of each one
#[derive(Debug, Default)]
pub struct FrameLogger {
    frames: AtomicU64,
    pixels: AtomicU64,
}

impl FrameLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn pixel_count(&self) -> u64 {
        self.pixels.load(Ordering::Relaxed)
    }

    /// One-line summary for the shutdown log
    pub fn summary(&self, uptime: Duration) -> String {
        let frames = self.frame_count();
        let secs = uptime.as_secs_f64();
        let fps = if secs > 0.0 { frames as f64 / secs } else { 0.0 };
        format!(
            "{} frames ({} pixels) in {:.1}s, {:.1} fps",
            frames,
            self.pixel_count(),
            secs,
            fps
        )
    }
}

impl PixelSink for FrameLogger {
    fn pixels_updated(&self, frame: &Frame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.pixels.fetch_add(frame.len() as u64, Ordering::Relaxed);

        match frame.pixels().first() {
            Some(first) => tracing::debug!(
                "Frame {}: {} pixels, first=({}, {}, {})",
                n,
                frame.len(),
                first.r,
                first.g,
                first.b
            ),
            None => tracing::debug!("Frame {}: empty", n),
        }
    }

    fn color_correction_changed(&self, params: &ColorCorrectionParams) {
        tracing::info!(
            "Color correction now gamma={} whitepoint={:?}",
            params.gamma,
            params.whitepoint
        );
    }
}
