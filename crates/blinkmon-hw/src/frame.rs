//! Frame type and pixel conversion (YUYV/Y16 to grayscale, dark detection).

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Runs when a frame is released. Receives the frame's sequence number.
pub type ReleaseHook = Box<dyn FnOnce(u32) + Send>;

/// A captured grayscale camera frame.
///
/// Frames are single-owner and not `Clone`. Dropping the frame releases it:
/// the release hook runs exactly once, on whichever path the frame leaves by.
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Wall-clock capture time.
    pub wall_clock: DateTime<Utc>,
    pub sequence: u32,
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            wall_clock: Utc::now(),
            sequence,
            release: None,
        }
    }

    /// Attach a hook that runs when the frame is released.
    pub fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    /// Release the frame now. Equivalent to dropping it.
    pub fn release(self) {}

    /// Capture time as seconds since the Unix epoch.
    pub fn epoch_seconds(&self) -> f64 {
        self.wall_clock.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_THRESHOLD)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook(self.sequence);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits (high byte).
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(counter: &Arc<AtomicUsize>) -> Frame {
        let c = Arc::clone(counter);
        Frame::new(vec![0; 4], 2, 2, 7).with_release(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_release_runs_once_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counted(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_release_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        counted(&counter).release();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_hook_gets_sequence() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let frame = Frame::new(vec![], 0, 0, 42).with_release(Box::new(move |seq| {
            s.store(seq as usize, Ordering::SeqCst);
        }));
        drop(frame);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_epoch_seconds_matches_wall_clock() {
        let frame = Frame::new(vec![], 0, 0, 0);
        let secs = frame.epoch_seconds();
        assert!((secs - frame.wall_clock.timestamp() as f64).abs() < 1.0);
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_y16_takes_high_byte() {
        let y16 = vec![0x34, 0x12, 0xff, 0x80];
        assert_eq!(y16_to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0x80]);
    }

    #[test]
    fn test_dark_frame() {
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![0, 100, 200, 100], 2, 2, 0);
        assert_eq!(frame.avg_brightness(), 100.0);
        assert!(!frame.is_dark());
    }
}
