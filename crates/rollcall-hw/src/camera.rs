//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access was denied for {0}; check device permissions or the video group")]
    PermissionDenied(String),
    #[error("no camera found at {0}")]
    DeviceNotFound(String),
    #[error("camera {0} is in use by another program")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
}

impl CameraError {
    fn from_open(device_path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
            _ if err.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy(device_path.to_string()),
            _ => CameraError::CaptureFailed(format!("{device_path}: {err}")),
        }
    }
}

/// Anything that yields grayscale frames.
pub trait FrameSource: Send {
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// V4L2 camera device handle. Dropping it releases the device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    sequence: u32,
}

impl Camera {
    /// Open a V4L2 device and request a nominal resolution. The driver may
    /// settle on a different one; `width`/`height` hold what was negotiated.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| CameraError::from_open(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::from_open(device_path, e))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            requested_width = width,
            requested_height = height,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            sequence: 0,
        })
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let convert_err = |e: frame::FrameError| CameraError::CaptureFailed(e.to_string());
        match self.pixel_format {
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height).map_err(convert_err),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height).map_err(convert_err),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let gray = {
            let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            let (buf, _meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
            self.buf_to_grayscale(buf)?
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame::new(gray, self.width, self.height, self.sequence))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let denied = CameraError::from_open("/dev/video0", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, CameraError::PermissionDenied(_)));

        let missing = CameraError::from_open("/dev/video0", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(missing, CameraError::DeviceNotFound(_)));

        let busy = CameraError::from_open("/dev/video0", io::Error::from_raw_os_error(EBUSY));
        assert!(matches!(busy, CameraError::DeviceBusy(_)));

        let other = CameraError::from_open("/dev/video0", io::Error::other("ioctl failed"));
        assert!(matches!(other, CameraError::CaptureFailed(_)));
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/rollcall-does-not-exist", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let msgs = [
            CameraError::PermissionDenied("/dev/video0".into()).to_string(),
            CameraError::DeviceNotFound("/dev/video0".into()).to_string(),
            CameraError::CaptureFailed("boom".into()).to_string(),
        ];
        assert_ne!(msgs[0], msgs[1]);
        assert_ne!(msgs[1], msgs[2]);
        assert_ne!(msgs[0], msgs[2]);
    }
}
