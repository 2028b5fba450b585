//! Face detection capability and its SCRFD implementation.
//!
//! The workflow only sees [`FaceDetector`]: a grayscale frame goes in, boxes
//! with embeddings come out. [`ScrfdDetector`] finds the boxes; pairing it
//! with a [`FaceEmbedder`](crate::recognizer::FaceEmbedder) happens in
//! [`OnnxPipeline`](crate::pipeline::OnnxPipeline).

use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame is {actual} bytes, expected {expected} for {width}x{height}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("embedding: {0}")]
    Embedding(#[from] RecognizerError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Given a grayscale frame, find every face and describe it.
pub trait FaceDetector {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32)
        -> Result<Vec<Detection>, DetectorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(frame, width, height)
    }
}

/// Wrap a raw grayscale buffer, checking its length.
pub(crate) fn gray_image(frame: &[u8], width: u32, height: u32) -> Result<GrayImage, DetectorError> {
    let expected = width as usize * height as usize;
    if frame.len() < expected || expected == 0 {
        return Err(DetectorError::InvalidFrame {
            width,
            height,
            expected,
            actual: frame.len(),
        });
    }
    GrayImage::from_raw(width, height, frame[..expected].to_vec()).ok_or(
        DetectorError::InvalidFrame {
            width,
            height,
            expected,
            actual: frame.len(),
        },
    )
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> (Self, u32, u32) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        let lb = Self {
            scale,
            pad_x: ((target - new_w) / 2) as f32,
            pad_y: ((target - new_h) / 2) as f32,
        };
        (lb, new_w, new_h)
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Which output tensor holds (scores, boxes) for each stride.
fn stride_outputs(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional layout");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// SCRFD face box detector.
pub struct ScrfdDetector {
    session: Session,
    outputs: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = stride_outputs(&names);
        tracing::info!(path = model_path, ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Face boxes in frame coordinates, highest confidence first.
    pub fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let img = gray_image(frame, width, height)?;
        let (input, letterbox) = preprocess(&img);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[slot];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a frame into the normalized NCHW input tensor.
fn preprocess(img: &GrayImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE;
    let (letterbox, new_w, new_h) = Letterbox::fit(img.width(), img.height(), size);
    let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);

    // Padding uses the mean so it normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    let (x0, y0) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = ((x + x0) as usize, (y + y0) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }
    (tensor, letterbox)
}

fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;
    let mut out = Vec::new();

    for (idx, &score) in scores.iter().enumerate().take(grid * grid * SCRFD_ANCHORS_PER_CELL) {
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let (cx, cy) = ((cell % grid) as f32 * s, (cell / grid) as f32 * s);

        let (x1, y1) = letterbox.to_frame(cx - d[0] * s, cy - d[1] * s);
        let (x2, y2) = letterbox.to_frame(cx + d[2] * s, cy + d[3] * s);
        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
    out
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
