//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Driver buffers queued for streaming capture.
const STREAM_BUFFERS: u32 = 4;

/// Highest `/dev/videoN` index probed by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Anything that yields a live sequence of frames.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the camera can be driven in, all reduced to 8-bit gray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, luma every other byte.
    Yuyv,
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
            Self::Grey => {
                let pixels = (width * height) as usize;
                return buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!(
                        "GREY buffer holds {} bytes, frame needs {pixels}",
                        buf.len()
                    ))
                });
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{self:?} conversion: {e}")))
    }
}

/// An open V4L2 capture device.
///
/// Streaming starts on the first [`FrameSource::next_frame`]. Dropping the
/// camera stops the stream and closes the device.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    outstanding: Arc<AtomicUsize>,
}

impl Camera {
    /// Open `device_path` and ask for `width` x `height`.
    ///
    /// The driver has the last word on size; read it back from the
    /// `width`/`height` fields.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let (negotiated, pixel_format) = negotiate(&device, width, height)?;
        tracing::info!(
            requested = %format!("{width}x{height}"),
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Frames handed out and not yet released.
    pub fn outstanding_frames(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Capture and discard `count` frames so auto-exposure can settle.
    pub fn warm_up(&mut self, count: usize) -> Result<(), CameraError> {
        if count > 0 {
            tracing::info!(count, "discarding warmup frames");
        }
        for _ in 0..count {
            self.next_frame()?.release();
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        if self.stream.is_none() {
            self.stream = Some(start_stream(&self.device)?);
            tracing::debug!(buffers = STREAM_BUFFERS, "capture stream started");
        }
        self.stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("capture stream unavailable".into()))
    }

    /// Stop streaming and close the device.
    pub fn release(self) {
        tracing::info!(
            device = %self.device_path,
            outstanding = self.outstanding_frames(),
            "releasing camera"
        );
    }

    /// Capture-capable devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter_map(probe_device)
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (pixel_format, width, height) = (self.pixel_format, self.width, self.height);
        let (buf, meta) = self
            .stream()?
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let gray = pixel_format.to_grayscale(buf, width, height)?;

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding);
        Ok(Frame::new(gray, width, height, sequence).with_release(Box::new(move |_| {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        })))
    }
}

fn open_device(path: &str) -> Result<Device, CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }
    Device::with_path(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            return CameraError::PermissionDenied(path.to_string());
        }
        // EBUSY has no stable ErrorKind across toolchains.
        if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
            return CameraError::DeviceBusy;
        }
        CameraError::DeviceNotFound(format!("{path}: {e}"))
    })
}

/// Request YUYV at the given size and accept whatever gray-convertible
/// format the driver settles on.
fn negotiate(
    device: &Device,
    width: u32,
    height: u32,
) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut requested = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;
    requested.fourcc = FourCC::new(b"YUYV");
    requested.width = width;
    requested.height = height;

    let negotiated = device
        .set_format(&requested)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver chose {:?}; supported are YUYV, GREY and Y16",
            negotiated.fourcc
        ))
    })?;
    Ok((negotiated, pixel_format))
}

fn start_stream(device: &Device) -> Result<MmapStream<'static>, CameraError> {
    MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
        .map_err(|e| CameraError::CaptureFailed(format!("start mmap stream: {e}")))
}

fn probe_device(path: String) -> Option<DeviceInfo> {
    if !Path::new(&path).exists() {
        return None;
    }
    let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
    caps.capabilities
        .contains(Flags::VIDEO_CAPTURE)
        .then(|| DeviceInfo {
            path,
            name: caps.card,
            driver: caps.driver,
            bus: caps.bus,
        })
}
