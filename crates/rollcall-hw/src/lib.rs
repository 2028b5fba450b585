//! rollcall-hw — Camera capture for the attendance station.
//!
//! Provides V4L2 camera access with grayscale conversion, plus the
//! `FrameSource` seam the daemon's engine thread pulls frames from.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
