//! Landmark-geometry feature comparison between two faces.
//!
//! Every absolute distance is measured in pixels and divided by the face's own
//! width reference (horizontal inter-eye distance), so faces of different
//! sizes and image resolutions compare on the same scale.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{
    BoundingBox, FaceRecord, Point, LANDMARK_COUNT, LEFT_EYE, LEFT_MOUTH, NOSE, RIGHT_EYE,
    RIGHT_MOUTH,
};

/// Score used for a feature whose geometry could not be computed.
pub const NEUTRAL_SCORE: f32 = 0.5;

/// Guards the nose ratio denominator. Kept at exactly 0.001 so scores stay
/// reproducible across implementations.
const NOSE_RATIO_EPSILON: f32 = 0.001;

/// Half-width of the uniform jitter used when landmarks are missing.
const ESTIMATE_JITTER: f32 = 0.1;
const ESTIMATE_MIN: f32 = 0.2;
const ESTIMATE_MAX: f32 = 0.95;

/// Width references below this are treated as degenerate.
const MIN_WIDTH_REFERENCE: f32 = 1e-6;

/// Facial regions scored by the family engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacialFeature {
    EyeRegion,
    NoseShape,
    FaceShape,
    MouthRegion,
}

impl FacialFeature {
    pub const ALL: [FacialFeature; 4] = [
        FacialFeature::EyeRegion,
        FacialFeature::NoseShape,
        FacialFeature::FaceShape,
        FacialFeature::MouthRegion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FacialFeature::EyeRegion => "eye_region",
            FacialFeature::NoseShape => "nose_shape",
            FacialFeature::FaceShape => "face_shape",
            FacialFeature::MouthRegion => "mouth_region",
        }
    }
}

impl std::fmt::Display for FacialFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-feature similarity scores in [0, 1].
pub type FeatureBreakdown = BTreeMap<FacialFeature, f32>;

/// Where the bounded noise for landmark-free estimation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Seeded from a SHA-256 of both embeddings: the same pair always scores the same.
    #[default]
    Seeded,
    /// Fresh OS entropy on every call.
    Random,
}

/// Compares the landmark geometry of a parent and a child face.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    jitter: JitterMode,
}

impl FeatureExtractor {
    pub fn new(jitter: JitterMode) -> Self {
        Self { jitter }
    }

    /// Score all four features.
    ///
    /// With a full landmark set on both faces the scores come from geometry.
    /// Otherwise each feature is estimated as `embedding_similarity` plus
    /// bounded jitter.
    pub fn extract(
        &self,
        parent: &FaceRecord,
        child: &FaceRecord,
        embedding_similarity: f32,
    ) -> FeatureBreakdown {
        if parent.has_full_landmarks() && child.has_full_landmarks() {
            compare_landmarks(
                &parent.landmarks,
                &parent.bounding_box,
                &child.landmarks,
                &child.bounding_box,
            )
        } else {
            tracing::debug!(
                parent_landmarks = parent.landmarks.len(),
                child_landmarks = child.landmarks.len(),
                "insufficient landmarks, estimating features from embedding similarity"
            );
            match self.jitter {
                JitterMode::Seeded => {
                    let mut rng = StdRng::seed_from_u64(embedding_seed(parent, child));
                    estimate_from_embedding(embedding_similarity, &mut rng)
                }
                JitterMode::Random => {
                    estimate_from_embedding(embedding_similarity, &mut rand::thread_rng())
                }
            }
        }
    }
}

/// Geometry-based scores for two faces with at least five landmarks each.
///
/// A feature whose computation degenerates (zero width reference, zero
/// coordinate variance) falls back to [`NEUTRAL_SCORE`] on its own; the other
/// features keep their computed values.
pub fn compare_landmarks(
    parent: &[Point],
    parent_bbox: &BoundingBox,
    child: &[Point],
    child_bbox: &BoundingBox,
) -> FeatureBreakdown {
    let mut breakdown = FeatureBreakdown::new();

    if parent.len() < LANDMARK_COUNT || child.len() < LANDMARK_COUNT {
        for feature in FacialFeature::ALL {
            breakdown.insert(feature, NEUTRAL_SCORE);
        }
        return breakdown;
    }

    let parent_width = width_reference(parent, parent_bbox);
    let child_width = width_reference(child, child_bbox);

    let eye = parent_width
        .zip(child_width)
        .and_then(|(pw, cw)| eye_similarity(parent, pw, child, cw));
    let nose = nose_similarity(parent, child);
    let mouth = parent_width
        .zip(child_width)
        .and_then(|(pw, cw)| mouth_similarity(parent, pw, child, cw));
    let shape = face_shape_similarity(parent, child);

    for (feature, score) in [
        (FacialFeature::EyeRegion, eye),
        (FacialFeature::NoseShape, nose),
        (FacialFeature::FaceShape, shape),
        (FacialFeature::MouthRegion, mouth),
    ] {
        let score = score.filter(|s| s.is_finite()).unwrap_or_else(|| {
            tracing::warn!(%feature, "landmark feature computation failed, using neutral score");
            NEUTRAL_SCORE
        });
        breakdown.insert(feature, score);
    }

    breakdown
}

/// Landmark-free estimate: every feature is `seed + U(-0.1, 0.1)`, clamped to [0.2, 0.95].
pub fn estimate_from_embedding<R: Rng + ?Sized>(seed: f32, rng: &mut R) -> FeatureBreakdown {
    FacialFeature::ALL
        .iter()
        .map(|&feature| {
            let variation: f32 = rng.gen_range(-ESTIMATE_JITTER..=ESTIMATE_JITTER);
            (feature, (seed + variation).clamp(ESTIMATE_MIN, ESTIMATE_MAX))
        })
        .collect()
}

/// Horizontal inter-eye distance, or the bounding-box width when the eyes
/// are vertically aligned on top of each other.
fn width_reference(landmarks: &[Point], bbox: &BoundingBox) -> Option<f32> {
    let eye_width = (landmarks[RIGHT_EYE].x - landmarks[LEFT_EYE].x).abs();
    if eye_width > MIN_WIDTH_REFERENCE {
        Some(eye_width)
    } else if bbox.width > MIN_WIDTH_REFERENCE {
        Some(bbox.width)
    } else {
        None
    }
}

fn eye_similarity(parent: &[Point], parent_width: f32, child: &[Point], child_width: f32) -> Option<f32> {
    let parent_ratio = parent[LEFT_EYE].distance(&parent[RIGHT_EYE]) / parent_width;
    let child_ratio = child[LEFT_EYE].distance(&child[RIGHT_EYE]) / child_width;

    let diff = (parent_ratio - child_ratio).abs();
    let similarity = 1.0 - (diff * 2.0).min(0.5);
    finite(similarity).map(|s| s.clamp(0.3, 1.0))
}

fn nose_ratio(landmarks: &[Point]) -> f32 {
    let eye_center = landmarks[LEFT_EYE].midpoint(&landmarks[RIGHT_EYE]);
    let mouth_center = landmarks[LEFT_MOUTH].midpoint(&landmarks[RIGHT_MOUTH]);
    let nose = landmarks[NOSE];

    let eye_to_nose = (nose.y - eye_center.y).abs();
    let nose_to_mouth = (mouth_center.y - nose.y).abs();
    eye_to_nose / (nose_to_mouth + NOSE_RATIO_EPSILON)
}

fn nose_similarity(parent: &[Point], child: &[Point]) -> Option<f32> {
    let diff = (nose_ratio(parent) - nose_ratio(child)).abs();
    let similarity = 1.0 / (1.0 + diff * 2.0);
    finite(similarity).map(|s| s.clamp(0.3, 0.95))
}

fn mouth_similarity(parent: &[Point], parent_width: f32, child: &[Point], child_width: f32) -> Option<f32> {
    let parent_ratio = (parent[RIGHT_MOUTH].x - parent[LEFT_MOUTH].x).abs() / parent_width;
    let child_ratio = (child[RIGHT_MOUTH].x - child[LEFT_MOUTH].x).abs() / child_width;

    let diff = (parent_ratio - child_ratio).abs();
    let similarity = 1.0 - (diff * 3.0).min(0.6);
    finite(similarity).map(|s| s.clamp(0.3, 1.0))
}

/// |Pearson correlation| between the centroid-centred, flattened landmark sets.
fn face_shape_similarity(parent: &[Point], child: &[Point]) -> Option<f32> {
    let p = centered_coordinates(&parent[..LANDMARK_COUNT]);
    let c = centered_coordinates(&child[..LANDMARK_COUNT]);
    let correlation = pearson(&p, &c)?;
    finite(correlation.abs()).map(|s| s.clamp(0.0, 1.0))
}

fn centered_coordinates(points: &[Point]) -> Vec<f32> {
    let n = points.len() as f32;
    let cx = points.iter().map(|p| p.x).sum::<f32>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f32>() / n;
    points
        .iter()
        .flat_map(|p| [p.x - cx, p.y - cy])
        .collect()
}

/// Pearson correlation coefficient. `None` when either series has zero variance.
fn pearson(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let n = a.len() as f32;
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;

    let mut cov = 0.0f32;
    let mut var_a = 0.0f32;
    let mut var_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if !denom.is_finite() || denom <= f32::EPSILON {
        return None;
    }
    Some(cov / denom)
}

fn finite(v: f32) -> Option<f32> {
    v.is_finite().then_some(v)
}

/// Stable seed derived from both embeddings.
fn embedding_seed(parent: &FaceRecord, child: &FaceRecord) -> u64 {
    let mut hasher = Sha256::new();
    for v in parent.embedding.values.iter().chain(child.embedding.values.iter()) {
        hasher.update(v.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn landmarks(scale: f32) -> Vec<Point> {
        [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ]
        .iter()
        .map(|&(x, y)| Point::new(x * scale, y * scale))
        .collect()
    }

    fn bbox(scale: f32) -> BoundingBox {
        BoundingBox {
            x: 60.0 * scale,
            y: 30.0 * scale,
            width: 80.0 * scale,
            height: 100.0 * scale,
        }
    }

    fn face(landmarks: Vec<Point>, embedding: Vec<f32>) -> FaceRecord {
        FaceRecord {
            bounding_box: bbox(1.0),
            detection_confidence: 0.9,
            embedding: Embedding::new(embedding),
            landmarks,
            age: None,
            gender: None,
        }
    }

    #[test]
    fn test_identical_geometry_scores_at_caps() {
        let lm = landmarks(1.0);
        let b = compare_landmarks(&lm, &bbox(1.0), &lm, &bbox(1.0));
        assert!((b[&FacialFeature::EyeRegion] - 1.0).abs() < 1e-6);
        assert!((b[&FacialFeature::NoseShape] - 0.95).abs() < 1e-6);
        assert!((b[&FacialFeature::MouthRegion] - 1.0).abs() < 1e-6);
        assert!((b[&FacialFeature::FaceShape] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_geometry_is_scale_invariant() {
        let small = landmarks(1.0);
        let large = landmarks(3.5);
        let b = compare_landmarks(&small, &bbox(1.0), &large, &bbox(3.5));
        assert!((b[&FacialFeature::EyeRegion] - 1.0).abs() < 1e-5);
        assert!((b[&FacialFeature::MouthRegion] - 1.0).abs() < 1e-5);
        assert!((b[&FacialFeature::FaceShape] - 1.0).abs() < 1e-5);
        // Nose ratio carries the 0.001 pixel epsilon, so only near-equal.
        assert!((b[&FacialFeature::NoseShape] - 0.95).abs() < 1e-3);
    }

    #[test]
    fn test_mouth_ratio_difference() {
        let parent = landmarks(1.0);
        let mut child = landmarks(1.0);
        // Widen the child's mouth from 30px to 40px: ratio 0.75 → 1.0, diff 0.25.
        child[LEFT_MOUTH].x = 80.0;
        child[RIGHT_MOUTH].x = 120.0;
        let b = compare_landmarks(&parent, &bbox(1.0), &child, &bbox(1.0));
        // 1 - min(0.25 * 3, 0.6) = 0.4
        assert!((b[&FacialFeature::MouthRegion] - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_nose_ratio_difference() {
        let parent = landmarks(1.0);
        let mut child = landmarks(1.0);
        // Parent: eye→nose 25, nose→mouth 25 → ratio ≈ 1.0
        // Child: eye→nose 35, nose→mouth 15 → ratio ≈ 2.333
        child[NOSE].y = 95.0;
        let b = compare_landmarks(&parent, &bbox(1.0), &child, &bbox(1.0));
        let p: f32 = 25.0 / (25.0 + 0.001);
        let c: f32 = 35.0 / (15.0 + 0.001);
        let expected = (1.0 / (1.0 + 2.0 * (p - c).abs())).clamp(0.3, 0.95);
        assert!((b[&FacialFeature::NoseShape] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_degenerate_shape_isolated_to_one_feature() {
        let parent = landmarks(1.0);
        // All child landmarks collapse to one point: zero variance, zero width.
        let child = vec![Point::new(50.0, 50.0); 5];
        let b = compare_landmarks(&parent, &bbox(1.0), &child, &bbox(1.0));
        assert_eq!(b[&FacialFeature::FaceShape], NEUTRAL_SCORE);
        // Eye/mouth fall back to the bounding-box width and still compute.
        assert!(b[&FacialFeature::EyeRegion] >= 0.3);
        assert_eq!(b.len(), 4);
    }

    #[test]
    fn test_zero_width_reference_is_neutral() {
        let parent = landmarks(1.0);
        let child = vec![Point::new(50.0, 50.0); 5];
        let zero_box = BoundingBox::default();
        let b = compare_landmarks(&parent, &bbox(1.0), &child, &zero_box);
        assert_eq!(b[&FacialFeature::EyeRegion], NEUTRAL_SCORE);
        assert_eq!(b[&FacialFeature::MouthRegion], NEUTRAL_SCORE);
    }

    #[test]
    fn test_all_scores_within_feature_ranges() {
        let parent = landmarks(1.0);
        let child: Vec<Point> = [(10.0, 300.0), (400.0, 2.0), (7.0, 7.0), (250.0, 90.0), (3.0, 500.0)]
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect();
        let b = compare_landmarks(&parent, &bbox(1.0), &child, &bbox(1.0));
        assert!((0.3..=1.0).contains(&b[&FacialFeature::EyeRegion]));
        assert!((0.3..=0.95).contains(&b[&FacialFeature::NoseShape]));
        assert!((0.3..=1.0).contains(&b[&FacialFeature::MouthRegion]));
        assert!((0.0..=1.0).contains(&b[&FacialFeature::FaceShape]));
    }

    #[test]
    fn test_estimate_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for seed in [0.0f32, 0.1, 0.5, 0.9, 1.0] {
            let b = estimate_from_embedding(seed, &mut rng);
            assert_eq!(b.len(), 4);
            for v in b.values() {
                assert!((ESTIMATE_MIN..=ESTIMATE_MAX).contains(v));
                assert!((v - seed.clamp(ESTIMATE_MIN, ESTIMATE_MAX)).abs() <= 0.1 + 1e-6);
            }
        }
    }

    #[test]
    fn test_extract_without_landmarks_is_deterministic_when_seeded() {
        let parent = face(vec![], vec![0.2, 0.4, 0.1]);
        let child = face(vec![], vec![0.3, 0.1, 0.5]);
        let extractor = FeatureExtractor::new(JitterMode::Seeded);
        let first = extractor.extract(&parent, &child, 0.6);
        let second = extractor.extract(&parent, &child, 0.6);
        assert_eq!(first, second);
    }

    #[test]
    fn test_extract_uses_geometry_when_landmarks_present() {
        let parent = face(landmarks(1.0), vec![1.0, 0.0]);
        let child = face(landmarks(1.0), vec![0.0, 1.0]);
        let b = FeatureExtractor::default().extract(&parent, &child, 0.0);
        assert!((b[&FacialFeature::EyeRegion] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_feature_names_serialize_snake_case() {
        let mut b = FeatureBreakdown::new();
        b.insert(FacialFeature::EyeRegion, 0.5);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, r#"{"eye_region":0.5}"#);
    }
}
