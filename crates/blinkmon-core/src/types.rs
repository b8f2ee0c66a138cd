use serde::{Deserialize, Serialize};

/// A 2D point. Normalized `[0, 1]` coordinates inside a [`LandmarkSet`],
/// pixel coordinates once denormalized for measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Six landmarks outlining one eye.
///
/// Index layout: `[0]` and `[3]` are the horizontal corners, `{1, 5}` and
/// `{2, 4}` are the vertical eyelid pairs.
pub type EyePoints = [Point; 6];

/// Per-eye indices into a face landmark sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EyeIndexScheme {
    pub left: [usize; 6],
    pub right: [usize; 6],
}

impl EyeIndexScheme {
    /// Indices into the 468-point face mesh topology.
    pub const FACE_MESH: EyeIndexScheme = EyeIndexScheme {
        left: [362, 385, 387, 263, 373, 380],
        right: [33, 160, 158, 133, 153, 144],
    };

    /// Smallest landmark count that satisfies every index in the scheme.
    pub fn required_len(&self) -> usize {
        self.left
            .iter()
            .chain(self.right.iter())
            .max()
            .map_or(0, |&max| max + 1)
    }
}

impl Default for EyeIndexScheme {
    fn default() -> Self {
        Self::FACE_MESH
    }
}

/// Landmarks for one detected face, normalized to the source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Select both eyes through `scheme`, denormalized to a `width` x `height`
    /// image so distances are aspect-correct.
    ///
    /// Returns `None` when the set is too short for the scheme.
    pub fn eye_points(
        &self,
        scheme: &EyeIndexScheme,
        width: u32,
        height: u32,
    ) -> Option<(EyePoints, EyePoints)> {
        if self.points.len() < scheme.required_len() {
            return None;
        }
        let (w, h) = (width as f64, height as f64);
        let pick = |indices: &[usize; 6]| -> EyePoints {
            std::array::from_fn(|i| {
                let p = self.points[indices[i]];
                Point::new(p.x * w, p.y * h)
            })
        };
        Some((pick(&scheme.left), pick(&scheme.right)))
    }
}

/// One EAR measurement entering the state machine.
///
/// `timestamp` is seconds since the Unix epoch. `value` is `None` when no
/// face was found, the provider was not ready, or the geometry was degenerate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarSample {
    pub timestamp: f64,
    pub value: Option<f64>,
}

impl EarSample {
    pub fn new(timestamp: f64, value: Option<f64>) -> Self {
        Self { timestamp, value }
    }

    /// The value, if it is usable by downstream logic (finite and > 0).
    pub fn valid_value(&self) -> Option<f64> {
        self.value.filter(|v| v.is_finite() && *v > 0.0)
    }
}

/// A `(time, value)` pair held by the live series buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: f64,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_len_face_mesh() {
        assert_eq!(EyeIndexScheme::FACE_MESH.required_len(), 388);
    }

    #[test]
    fn test_eye_points_denormalize() {
        let scheme = EyeIndexScheme {
            left: [0, 1, 2, 3, 4, 5],
            right: [6, 7, 8, 9, 10, 11],
        };
        let points = (0..12).map(|i| Point::new(0.5, i as f64 / 100.0));
        let set = LandmarkSet::new(points.collect());

        let (left, right) = set.eye_points(&scheme, 200, 100).unwrap();
        assert_eq!(left[0], Point::new(100.0, 0.0));
        assert_eq!(right[5], Point::new(100.0, 11.0));
    }

    #[test]
    fn test_eye_points_short_set() {
        let set = LandmarkSet::new(vec![Point::new(0.0, 0.0); 10]);
        let eyes = set.eye_points(&EyeIndexScheme::FACE_MESH, 640, 480);
        assert!(eyes.is_none());
    }

    #[test]
    fn test_sample_validity() {
        assert_eq!(EarSample::new(0.0, Some(0.25)).valid_value(), Some(0.25));
        assert_eq!(EarSample::new(0.0, Some(0.0)).valid_value(), None);
        assert_eq!(EarSample::new(0.0, Some(-0.1)).valid_value(), None);
        assert_eq!(EarSample::new(0.0, Some(f64::NAN)).valid_value(), None);
        assert_eq!(EarSample::new(0.0, None).valid_value(), None);
    }
}
