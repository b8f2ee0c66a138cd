//! 468-point face mesh landmark provider via ONNX Runtime.
//!
//! Runs a face-landmark model on a square region of interest. The first frame
//! (and any frame after the face is lost) uses the centred square of the
//! image; after a hit, the next region is the previous landmarks' bounding
//! box expanded by [`ROI_EXPANSION`], the way trackers keep the face framed.

use crate::provider::{DetectionError, LandmarkProvider};
use crate::types::{LandmarkSet, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;

// --- Named constants ---
const MESH_INPUT_SIZE: usize = 192;
const MESH_LANDMARK_COUNT: usize = 468;
/// Each landmark is (x, y, z) in input-pixel units.
const MESH_VALUES_PER_LANDMARK: usize = 3;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;
const ROI_EXPANSION: f32 = 1.5;
const MIN_ROI_SIZE: f32 = 32.0;

/// Memory layout of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nchw,
    Nhwc,
}

/// Square crop in source-pixel coordinates. May extend past the image edges.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
    x: f32,
    y: f32,
    size: f32,
}

impl Roi {
    fn centred(width: usize, height: usize) -> Self {
        let size = width.min(height) as f32;
        Self {
            x: (width as f32 - size) / 2.0,
            y: (height as f32 - size) / 2.0,
            size,
        }
    }

    /// Expanded square around the bounding box of `points` (pixel space).
    fn around(points: &[(f32, f32)]) -> Option<Self> {
        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if points.is_empty() || !min_x.is_finite() || !max_x.is_finite() {
            return None;
        }
        let size = ((max_x - min_x).max(max_y - min_y) * ROI_EXPANSION).max(MIN_ROI_SIZE);
        let cx = (min_x + max_x) / 2.0;
        let cy = (min_y + max_y) / 2.0;
        Some(Self {
            x: cx - size / 2.0,
            y: cy - size / 2.0,
            size,
        })
    }
}

/// Face mesh landmark provider.
pub struct FaceMeshProvider {
    session: Session,
    layout: TensorLayout,
    output_count: usize,
    roi: Option<Roi>,
}

impl FaceMeshProvider {
    /// Load the face mesh ONNX model from the given path.
    pub fn load(model_path: &str, layout: TensorLayout) -> Result<Self, DetectionError> {
        if !Path::new(model_path).exists() {
            return Err(DetectionError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_count = session.outputs().len();
        tracing::info!(
            path = model_path,
            ?layout,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );

        if output_count < 2 {
            return Err(DetectionError::InferenceFailed(format!(
                "face mesh model requires landmark and presence outputs, got {output_count}"
            )));
        }

        Ok(Self {
            session,
            layout,
            output_count,
            roi: None,
        })
    }

    /// Crop `roi` out of a grayscale frame, resize bilinearly to the model
    /// input and normalize to `[0, 1]`. Pixels outside the frame are black.
    fn preprocess(&self, frame: &[u8], width: usize, height: usize, roi: Roi) -> Array4<f32> {
        let n = MESH_INPUT_SIZE;
        let shape = match self.layout {
            TensorLayout::Nchw => (1, 3, n, n),
            TensorLayout::Nhwc => (1, n, n, 3),
        };
        let mut tensor = Array4::<f32>::zeros(shape);
        let step = roi.size / n as f32;

        let sample = |x: i32, y: i32| -> f32 {
            if x >= 0 && (x as usize) < width && y >= 0 && (y as usize) < height {
                frame[y as usize * width + x as usize] as f32
            } else {
                0.0
            }
        };

        for oy in 0..n {
            let sy = roi.y + (oy as f32 + 0.5) * step - 0.5;
            let y0 = sy.floor() as i32;
            let fy = sy - y0 as f32;
            for ox in 0..n {
                let sx = roi.x + (ox as f32 + 0.5) * step - 0.5;
                let x0 = sx.floor() as i32;
                let fx = sx - x0 as f32;

                let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1) * fx * fy;
                let normalized = val / 255.0;

                // Grayscale → 3-channel
                for c in 0..3 {
                    match self.layout {
                        TensorLayout::Nchw => tensor[[0, c, oy, ox]] = normalized,
                        TensorLayout::Nhwc => tensor[[0, oy, ox, c]] = normalized,
                    }
                }
            }
        }

        tensor
    }
}

impl LandmarkProvider for FaceMeshProvider {
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<LandmarkSet>, DetectionError> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || image.len() < w * h {
            return Err(DetectionError::InferenceFailed(format!(
                "frame buffer too short: expected {}, got {}",
                w * h,
                image.len()
            )));
        }

        let roi = self.roi.unwrap_or_else(|| Roi::centred(w, h));
        let input = self.preprocess(image, w, h, roi);

        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self.session.run(ort::inputs![tensor])?;

        let mut raw_landmarks: Option<Vec<f32>> = None;
        let mut presence_logit: Option<f32> = None;
        for idx in 0..self.output_count {
            let (_, values) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::InferenceFailed(format!("output {idx}: {e}")))?;
            if values.len() == MESH_LANDMARK_COUNT * MESH_VALUES_PER_LANDMARK {
                raw_landmarks = Some(values.to_vec());
            } else if values.len() == 1 {
                presence_logit = Some(values[0]);
            }
        }

        let raw = raw_landmarks.ok_or_else(|| {
            DetectionError::InferenceFailed("no landmark output in model results".into())
        })?;
        let presence = presence_logit.map_or(1.0, sigmoid);

        if presence < MESH_PRESENCE_THRESHOLD {
            tracing::trace!(presence, "no face in region");
            self.roi = None;
            return Ok(None);
        }

        let (landmarks, pixels) = decode_landmarks(&raw, roi, w, h);
        self.roi = Roi::around(&pixels);
        Ok(Some(landmarks))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Map model-space landmarks back to the frame: normalized set plus the
/// pixel positions used to place the next region.
fn decode_landmarks(
    raw: &[f32],
    roi: Roi,
    width: usize,
    height: usize,
) -> (LandmarkSet, Vec<(f32, f32)>) {
    let scale = roi.size / MESH_INPUT_SIZE as f32;
    let mut pixels = Vec::with_capacity(MESH_LANDMARK_COUNT);
    let mut points = Vec::with_capacity(MESH_LANDMARK_COUNT);

    for chunk in raw.chunks_exact(MESH_VALUES_PER_LANDMARK) {
        let px = roi.x + chunk[0] * scale;
        let py = roi.y + chunk[1] * scale;
        pixels.push((px, py));
        let (x, y) = (px as f64 / width as f64, py as f64 / height as f64);
        points.push(Point::new(x, y));
    }

    (LandmarkSet::new(points), pixels)
}
