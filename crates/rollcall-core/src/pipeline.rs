use crate::detector::{gray_image, DetectorError, FaceDetector, ScrfdDetector};
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::types::{BoundingBox, Detection, Embedding};

/// SCRFD boxes plus a recognition model, behind the [`FaceDetector`] seam.
pub struct OnnxPipeline {
    detector: ScrfdDetector,
    embedder: FaceEmbedder,
}

impl OnnxPipeline {
    pub fn load(detector_path: &str, embedder_path: &str, dim: usize) -> Result<Self, DetectorError> {
        let detector = ScrfdDetector::load(detector_path)?;
        let embedder = FaceEmbedder::load(embedder_path, dim)?;
        Ok(Self { detector, embedder })
    }
}

impl FaceDetector for OnnxPipeline {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, DetectorError> {
        let boxes = self.detector.locate(frame, width, height)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let img = gray_image(frame, width, height)?;
        let embedder = &mut self.embedder;
        let detections = embed_faces(boxes, |bbox| embedder.embed(&img, bbox))?;
        tracing::trace!(faces = detections.len(), "frame processed");
        Ok(detections)
    }
}

/// Pair each box with its embedding. A box whose crop falls outside the
/// frame is dropped; any other embedding failure fails the frame.
fn embed_faces<F>(boxes: Vec<BoundingBox>, mut embed: F) -> Result<Vec<Detection>, DetectorError>
where
    F: FnMut(&BoundingBox) -> Result<Embedding, RecognizerError>,
{
    let mut detections = Vec::with_capacity(boxes.len());
    for bbox in boxes {
        match embed(&bbox) {
            Ok(embedding) => detections.push(Detection { bbox, embedding }),
            Err(RecognizerError::EmptyCrop) => {
                tracing::debug!(
                    x = bbox.x,
                    y = bbox.y,
                    w = bbox.width,
                    h = bbox.height,
                    "face crop empty; skipped"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(x: f32) -> BoundingBox {
        BoundingBox { x, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 }
    }

    #[test]
    fn test_empty_crop_skips_only_that_face() {
        let boxes = vec![bb(0.0), bb(-50.0), bb(20.0)];
        let detections = embed_faces(boxes, |bbox| {
            if bbox.x < 0.0 {
                Err(RecognizerError::EmptyCrop)
            } else {
                Ok(Embedding::new(vec![bbox.x, 1.0]))
            }
        })
        .unwrap();

        let xs: Vec<f32> = detections.iter().map(|d| d.bbox.x).collect();
        assert_eq!(xs, vec![0.0, 20.0]);
        assert_eq!(detections[1].embedding, Embedding::new(vec![20.0, 1.0]));
    }

    #[test]
    fn test_inference_failure_fails_frame() {
        let result = embed_faces(vec![bb(0.0), bb(20.0)], |_| {
            Err(RecognizerError::InferenceFailed("bad output".into()))
        });
        assert!(matches!(result, Err(DetectorError::Embedding(RecognizerError::InferenceFailed(_)))));
    }
}
