use serde::{Deserialize, Serialize};

use crate::similarity::{self, SimilarityError};

/// Axis-aligned face bounding box in pixel units, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a box from corner coordinates `(x1, y1)`–`(x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over union; 0 when the boxes are disjoint or degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let overlap_h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let intersection = overlap_w.max(0.0) * overlap_h.max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A 2-D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
        }
    }
}

/// Number of landmarks produced by the detector.
pub const LANDMARK_COUNT: usize = 5;

/// Landmark slots in detector order.
pub const LEFT_EYE: usize = 0;
pub const RIGHT_EYE: usize = 1;
pub const NOSE: usize = 2;
pub const LEFT_MOUTH: usize = 3;
pub const RIGHT_MOUTH: usize = 4;

/// Raw detector output for one face, before embedding extraction.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[Point; LANDMARK_COUNT]>,
}

/// Face embedding vector (512-dimensional for ArcFace), as produced by the model.
///
/// Values are not normalized; use [`Embedding::normalized`] or the helpers in
/// [`crate::similarity`] before comparing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm of the raw vector. Reported to clients as a quality score.
    pub fn norm(&self) -> f32 {
        similarity::l2_norm(&self.values)
    }

    /// Unit-length copy of this embedding.
    pub fn normalized(&self) -> Result<Embedding, SimilarityError> {
        Ok(Embedding {
            values: similarity::normalize(&self.values)?,
            model_version: self.model_version.clone(),
        })
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, SimilarityError> {
        similarity::cosine_similarity(&self.values, &other.values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenderValue {
    Male,
    Female,
}

/// Gender estimate from the attribute model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gender {
    pub value: GenderValue,
    pub confidence: f32,
}

/// Everything the embedding provider knows about one detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub bounding_box: BoundingBox,
    pub detection_confidence: f32,
    pub embedding: Embedding,
    /// Detector order: [left_eye, right_eye, nose, left_mouth, right_mouth]. Empty when unavailable.
    #[serde(default)]
    pub landmarks: Vec<Point>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
}

impl FaceRecord {
    /// True when the full five-point landmark set is present.
    pub fn has_full_landmarks(&self) -> bool {
        self.landmarks.len() >= LANDMARK_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_from_corners() {
        let b = BoundingBox::from_corners(10.0, 20.0, 110.0, 170.0);
        assert_eq!(b.width, 100.0);
        assert_eq!(b.height, 150.0);
        assert_eq!(b.center(), Point::new(60.0, 95.0));
        assert_eq!(b.area(), 15000.0);
    }

    #[test]
    fn test_bbox_iou() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let shifted = BoundingBox { x: 5.0, ..a };
        let far = BoundingBox { x: 50.0, y: 50.0, ..a };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&shifted) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
        assert_eq!(BoundingBox::default().iou(&BoundingBox::default()), 0.0);
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.midpoint(&b), Point::new(1.5, 2.0));
    }

    #[test]
    fn test_embedding_norm() {
        let e = Embedding::new(vec![3.0, 4.0]);
        assert!((e.norm() - 5.0).abs() < 1e-6);
        let n = e.normalized().unwrap();
        assert!((n.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_face_record_landmarks_optional_in_json() {
        let json = r#"{
            "bounding_box": {"x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0},
            "detection_confidence": 0.9,
            "embedding": {"values": [1.0, 0.0]}
        }"#;
        let face: FaceRecord = serde_json::from_str(json).unwrap();
        assert!(face.landmarks.is_empty());
        assert!(face.age.is_none());
        assert!(!face.has_full_landmarks());
    }
}
