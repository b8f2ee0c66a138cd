//! Frame → compressed bytes for the wire.

use crate::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame buffer too short: expected {expected}, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Compresses a frame into an opaque byte payload.
pub trait FrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, EncodeError>;
}

/// Grayscale JPEG encoder.
#[derive(Debug, Clone)]
pub struct JpegFrameEncoder {
    quality: u8,
    /// Output buffer reused between frames.
    scratch: Vec<u8>,
}

impl JpegFrameEncoder {
    /// `quality` is clamped to 1–100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            scratch: Vec::new(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        let expected = (frame.width * frame.height) as usize;
        if frame.data.len() < expected {
            return Err(EncodeError::ShortBuffer {
                expected,
                actual: frame.data.len(),
            });
        }

        self.scratch.clear();
        JpegEncoder::new_with_quality(&mut self.scratch, self.quality).write_image(
            &frame.data[..expected],
            frame.width,
            frame.height,
            ExtendedColorType::L8,
        )?;
        Ok(self.scratch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_jpeg() {
        let frame = Frame::new(vec![128u8; 64 * 48], 64, 48, 0);
        let bytes = JpegFrameEncoder::default().encode(&frame).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_short_buffer_is_error() {
        let frame = Frame::new(vec![0u8; 10], 64, 48, 0);
        match JpegFrameEncoder::default().encode(&frame) {
            Err(EncodeError::ShortBuffer { expected, actual }) => {
                assert_eq!((expected, actual), (3072, 10));
            }
            other => panic!("expected ShortBuffer, got {other:?}"),
        }
    }

    #[test]
    fn test_quality_clamped() {
        assert_eq!(JpegFrameEncoder::new(0).quality(), 1);
        assert_eq!(JpegFrameEncoder::new(255).quality(), 100);
    }
}
