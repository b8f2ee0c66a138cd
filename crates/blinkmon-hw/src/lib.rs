//! blinkmon-hw: camera capture and frame encoding.
//!
//! V4L2 capture into owned grayscale frames that release exactly once, and
//! JPEG compression for streaming.

pub mod camera;
pub mod encode;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use encode::{EncodeError, FrameEncoder, JpegFrameEncoder};
pub use frame::Frame;
