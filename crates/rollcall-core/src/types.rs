use serde::{Deserialize, Serialize};

/// Default embedding length for enrolled face descriptors.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Fraction of the frame covered by this box.
    ///
    /// Returns 0.0 for a degenerate frame.
    pub fn area_ratio(&self, frame_width: u32, frame_height: u32) -> f32 {
        let frame_area = frame_width as f32 * frame_height as f32;
        if frame_area > 0.0 {
            self.area() / frame_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Only the overlapping prefix is compared; callers check lengths first.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Return a copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(values: Vec<f32>) -> Self {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Self {
                values: values.iter().map(|x| x / norm).collect(),
            }
        } else {
            Self { values }
        }
    }
}

/// One face found in a frame: where it is and what it looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(w: f32, h: f32) -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, 0.4, 0.5]);
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::normalized(vec![3.0, 4.0]);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector() {
        let e = Embedding::normalized(vec![0.0, 0.0]);
        assert_eq!(e.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_area_ratio() {
        // 200x150 box in a 640x480 frame = 30000 / 307200
        let ratio = bbox(200.0, 150.0).area_ratio(640, 480);
        assert!((ratio - 30000.0 / 307200.0).abs() < 1e-6);
    }

    #[test]
    fn test_area_ratio_degenerate_frame() {
        assert_eq!(bbox(10.0, 10.0).area_ratio(0, 480), 0.0);
    }

    #[test]
    fn test_negative_extent_has_no_area() {
        assert_eq!(bbox(-5.0, 10.0).area(), 0.0);
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = Embedding::new(vec![0.5, -0.25]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.5,-0.25]");
    }
}
