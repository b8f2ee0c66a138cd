//! Eye-aspect-ratio extraction from eye landmark geometry.

use crate::types::{EyeIndexScheme, EyePoints, LandmarkSet};

/// Horizontal eye widths below this (in pixels) are treated as degenerate.
pub const DEGENERATE_EPSILON: f64 = 1e-6;

/// EAR for one eye: `(|p1-p5| + |p2-p4|) / (2 |p0-p3|)`.
///
/// Returns `None` when the corner-to-corner distance is ~0.
pub fn eye_aspect_ratio(eye: &EyePoints) -> Option<f64> {
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);

    if !horizontal.is_finite() || horizontal < DEGENERATE_EPSILON {
        return None;
    }
    Some((vertical_a + vertical_b) / (2.0 * horizontal))
}

/// Mean EAR of both eyes. Degenerate geometry in either eye voids the sample.
pub fn combined_ear(left: &EyePoints, right: &EyePoints) -> Option<f64> {
    let left = eye_aspect_ratio(left)?;
    let right = eye_aspect_ratio(right)?;
    Some((left + right) / 2.0)
}

/// Computes EAR values for a fixed eye index scheme.
#[derive(Debug, Clone, Default)]
pub struct EarExtractor {
    scheme: EyeIndexScheme,
}

impl EarExtractor {
    pub fn new(scheme: EyeIndexScheme) -> Self {
        Self { scheme }
    }

    /// EAR for a face in a `width` x `height` image, or `None` when there
    /// is no face or the eye geometry is unusable.
    pub fn extract(&self, landmarks: Option<&LandmarkSet>, width: u32, height: u32) -> Option<f64> {
        let (left, right) = landmarks?.eye_points(&self.scheme, width, height)?;
        combined_ear(&left, &right)
    }
}
