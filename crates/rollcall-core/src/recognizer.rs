//! Face embedding extraction via ONNX Runtime.
//!
//! Crops each detected box from the grayscale frame, resizes it to the
//! model's square input, and returns an L2-normalized descriptor.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
/// Extra margin around the detector box, as a fraction of its size.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEmbedder {
    session: Session,
    dim: usize,
}

impl FaceEmbedder {
    /// Load the embedding model. `dim` is the descriptor length the model
    /// must produce.
    pub fn load(model_path: &str, dim: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, dim, "loaded face embedding model");
        Ok(Self { session, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn embed(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let (x, y, w, h) = crop_rect(face, frame.width(), frame.height()).ok_or(RecognizerError::EmptyCrop)?;
        let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.dim {
            return Err(RecognizerError::DimensionMismatch {
                expected: self.dim,
                actual: raw.len(),
            });
        }
        Ok(Embedding::normalized(raw.to_vec()))
    }
}

/// Pixel rectangle to crop for a face box: the box plus a margin, clipped to
/// the frame. `None` when nothing of the box is inside the frame.
fn crop_rect(face: &BoundingBox, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x0 = (face.x - mx).floor().max(0.0);
    let y0 = (face.y - my).floor().max(0.0);
    let x1 = (face.x + face.width + mx).ceil().min(frame_w as f32);
    let y1 = (face.y + face.height + my).ceil().min(frame_h as f32);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Resize a face crop to the model input and normalize into NCHW.
fn preprocess(crop: &GrayImage) -> Array4<f32> {
    let size = EMBEDDER_INPUT_SIZE;
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_rect_adds_margin() {
        assert_eq!(crop_rect(&bb(100.0, 100.0, 50.0, 50.0), 640, 480), Some((95, 95, 60, 60)));
    }

    #[test]
    fn test_crop_rect_clips_to_frame() {
        assert_eq!(crop_rect(&bb(-20.0, 450.0, 100.0, 100.0), 640, 480), Some((0, 440, 90, 40)));
    }

    #[test]
    fn test_crop_rect_outside_frame() {
        assert_eq!(crop_rect(&bb(700.0, 10.0, 50.0, 50.0), 640, 480), None);
    }

    #[test]
    fn test_preprocess_shape_and_channels() {
        let crop = GrayImage::from_pixel(30, 40, image::Luma([128u8]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, 50, 60]] - expected).abs() < 1e-6);
        }
    }
}
