use crate::config::Config;
use rollcall_core::{Detection, DetectorError, FaceDetector, OnnxPipeline};
use rollcall_hw::{Camera, CameraError, FrameSource};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Camera(#[from] CameraError),
    #[error("failed to load face models: {0}")]
    ModelLoad(DetectorError),
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("detector panicked")]
    DetectorPanicked,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Faces found in one sampled frame, with the frame size they refer to.
#[derive(Debug, Clone)]
pub struct FrameDetections {
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

/// Messages sent from session tasks to the engine thread.
enum EngineRequest {
    Detect {
        reply: oneshot::Sender<Result<FrameDetections, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread. When the last handle is dropped
/// the thread exits and the camera is released.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture one frame and run detection on it.
    pub async fn detect(&self) -> Result<FrameDetections, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Open the configured camera and load both ONNX models, then spawn the
/// engine. Blocking; run it off the async runtime.
pub fn open_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;

    let detector_path = config.detector_model_path();
    let embedder_path = config.embedder_model_path();
    let pipeline = OnnxPipeline::load(&detector_path, &embedder_path, config.embedding_dim)
        .map_err(EngineError::ModelLoad)?;
    tracing::info!(
        detector = %detector_path,
        embedder = %embedder_path,
        dim = config.embedding_dim,
        "face models loaded"
    );

    spawn_engine(Box::new(camera), Box::new(pipeline))
}

/// Spawn the engine on a dedicated OS thread owning the frame source and
/// the detector.
pub fn spawn_engine(
    mut source: Box<dyn FrameSource>,
    mut detector: Box<dyn FaceDetector + Send>,
) -> Result<EngineHandle, EngineError> {
    // One request at a time: the session awaits each reply before the next.
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { reply } => {
                        let result = run_detect(source.as_mut(), detector.as_mut());
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_detect(
    source: &mut dyn FrameSource,
    detector: &mut (dyn FaceDetector + Send),
) -> Result<FrameDetections, EngineError> {
    let frame = source.capture_frame()?;

    let detections = panic::catch_unwind(AssertUnwindSafe(|| {
        detector.detect(&frame.data, frame.width, frame.height)
    }))
    .map_err(|_| EngineError::DetectorPanicked)??;

    tracing::trace!(
        sequence = frame.sequence,
        faces = detections.len(),
        "frame processed"
    );

    Ok(FrameDetections {
        width: frame.width,
        height: frame.height,
        detections,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use rollcall_core::{BoundingBox, Embedding};

    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn capture_frame(&mut self) -> Result<rollcall_hw::Frame, CameraError> {
            Err(CameraError::CaptureFailed("unplugged".into()))
        }
    }

    fn face() -> Detection {
        Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 30.0, height: 30.0, confidence: 0.9 },
            embedding: Embedding::new(vec![1.0, 0.0]),
        }
    }

    #[tokio::test]
    async fn test_detect_returns_faces_and_frame_size() {
        let handle = engine(ScriptedDetector::constant(vec![face()]));
        let out = handle.detect().await.unwrap();
        assert_eq!((out.width, out.height), (FRAME_W, FRAME_H));
        assert_eq!(out.detections.len(), 1);
    }

    #[tokio::test]
    async fn test_detector_panic_is_contained() {
        let handle = engine(ScriptedDetector::new(vec![Step::Panic], vec![face()]));
        assert!(matches!(handle.detect().await, Err(EngineError::DetectorPanicked)));
        // The thread survives and keeps serving.
        assert_eq!(handle.detect().await.unwrap().detections.len(), 1);
    }

    #[tokio::test]
    async fn test_detector_error_is_reported() {
        let handle = engine(ScriptedDetector::new(vec![Step::Fail], Vec::new()));
        assert!(matches!(handle.detect().await, Err(EngineError::Detector(_))));
        assert!(handle.detect().await.unwrap().detections.is_empty());
    }

    #[tokio::test]
    async fn test_capture_error_is_reported() {
        let handle = spawn_engine(
            Box::new(BrokenSource),
            Box::new(ScriptedDetector::constant(Vec::new())),
        )
        .unwrap();
        assert!(matches!(handle.detect().await, Err(EngineError::Camera(_))));
    }

    #[test]
    fn test_startup_messages_are_distinct() {
        let denied = EngineError::from(CameraError::PermissionDenied("/dev/video0".into()));
        let missing = EngineError::from(CameraError::DeviceNotFound("/dev/video0".into()));
        let models = EngineError::ModelLoad(DetectorError::ModelNotFound("det.onnx".into()));
        assert_ne!(denied.to_string(), missing.to_string());
        assert!(models.to_string().starts_with("failed to load face models"));
    }
}
