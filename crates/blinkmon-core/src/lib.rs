//! blinkmon-core: blink detection from facial landmarks.
//!
//! EAR extraction, the hysteresis/debounce blink state machine, the bounded
//! live series buffer, and an ONNX face-mesh landmark provider.

pub mod blink;
pub mod ear;
pub mod mesh;
pub mod provider;
pub mod series;
pub mod types;

pub use blink::{
    BlinkConfig, BlinkEvent, BlinkEventKind, BlinkState, BlinkStateMachine, StepOutput,
};
pub use ear::EarExtractor;
pub use mesh::{FaceMeshProvider, TensorLayout};
pub use provider::{DeferredProvider, DetectionError, LandmarkProvider};
pub use series::{LiveSeriesBuffer, SeriesSnapshot, ValueRange};
pub use types::{EarSample, EyeIndexScheme, LandmarkSet, Point, SeriesPoint};
