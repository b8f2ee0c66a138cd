//! Fakes shared by the daemon's unit tests.

use blinkmon_core::{DetectionError, EyeIndexScheme, LandmarkProvider, LandmarkSet, Point};
use blinkmon_hw::{EncodeError, Frame, FrameEncoder};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Side of the square test frames. Square keeps normalized EAR unchanged.
pub const FRAME_SIDE: u32 = 64;

/// A 468-point mesh whose eyes have the requested aspect ratio.
pub fn mesh_with_ear(ear: f64) -> LandmarkSet {
    let scheme = EyeIndexScheme::FACE_MESH;
    let mut points = vec![Point::new(0.5, 0.5); scheme.required_len()];
    for (eye, cx) in [(scheme.left, 0.35), (scheme.right, 0.65)] {
        // Corners at ±0.05, lids at ±h/2, so EAR = h / 0.1.
        let h = ear * 0.1;
        let layout = [
            (cx - 0.05, 0.5),
            (cx - 0.02, 0.5 - h / 2.0),
            (cx + 0.02, 0.5 - h / 2.0),
            (cx + 0.05, 0.5),
            (cx + 0.02, 0.5 + h / 2.0),
            (cx - 0.02, 0.5 + h / 2.0),
        ];
        for (idx, (x, y)) in eye.iter().zip(layout) {
            points[*idx] = Point::new(x, y);
        }
    }
    LandmarkSet::new(points)
}

pub enum Scripted {
    Ear(f64),
    NoFace,
    Unavailable,
}

/// Plays back a script, then repeats `fallback` forever.
pub struct ScriptedProvider {
    script: VecDeque<Scripted>,
    fallback: Option<f64>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: script.into(),
            fallback: None,
        }
    }

    pub fn constant(ear: f64) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Some(ear),
        }
    }
}

impl LandmarkProvider for ScriptedProvider {
    fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Option<LandmarkSet>, DetectionError> {
        match self.script.pop_front() {
            Some(Scripted::Ear(ear)) => Ok(Some(mesh_with_ear(ear))),
            Some(Scripted::NoFace) => Ok(None),
            Some(Scripted::Unavailable) => Err(DetectionError::Unavailable),
            None => Ok(self.fallback.map(mesh_with_ear)),
        }
    }
}

pub struct FakeEncoder {
    pub fail: bool,
}

impl FrameEncoder for FakeEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        if self.fail {
            return Err(EncodeError::ShortBuffer {
                expected: 1,
                actual: 0,
            });
        }
        Ok(vec![frame.sequence as u8])
    }
}

/// A frame that bumps `released` when it is released.
pub fn counted_frame(seq: u32, released: &Arc<AtomicUsize>) -> Frame {
    let released = Arc::clone(released);
    let side = FRAME_SIDE;
    let frame = Frame::new(vec![0u8; (side * side) as usize], side, side, seq);
    frame.with_release(Box::new(move |_| {
        released.fetch_add(1, Ordering::SeqCst);
    }))
}
