//! One-to-many face comparison.

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::types::{BoundingBox, FaceRecord, Point};

/// A detected face without its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceSummary {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<Point>>,
}

impl FaceSummary {
    pub fn of(face: &FaceRecord) -> Self {
        Self {
            bounding_box: face.bounding_box,
            confidence: face.detection_confidence,
            landmarks: None,
        }
    }

    pub fn with_landmarks(face: &FaceRecord) -> Self {
        Self {
            landmarks: Some(face.landmarks.clone()),
            ..Self::of(face)
        }
    }
}

/// A target face at or above the match threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceMatch {
    pub similarity: f32,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub landmarks: Vec<Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Best cosine similarity over all targets, never below 0.
    pub similarity: f32,
    /// Detection confidence of the source face.
    pub confidence: f32,
    pub face_matches: Vec<FaceMatch>,
    pub source_face: FaceSummary,
    pub target_faces: Vec<FaceSummary>,
    pub unmatched_faces: Vec<FaceSummary>,
}

/// Compare the first source face against every target face.
pub fn compare(
    source_faces: &[FaceRecord],
    target_faces: &[FaceRecord],
    threshold: f32,
) -> Result<ComparisonResult, AnalysisError> {
    let source = source_faces.first().ok_or(AnalysisError::NoFace("source"))?;
    if target_faces.is_empty() {
        return Err(AnalysisError::NoFace("target"));
    }

    let mut max_similarity = 0.0f32;
    let mut face_matches = Vec::new();
    let mut unmatched_faces = Vec::new();

    for target in target_faces {
        let sim = source.embedding.similarity(&target.embedding)?;
        max_similarity = max_similarity.max(sim);

        if sim >= threshold {
            face_matches.push(FaceMatch {
                similarity: sim,
                bounding_box: target.bounding_box,
                confidence: target.detection_confidence,
                landmarks: target.landmarks.clone(),
            });
        } else {
            unmatched_faces.push(FaceSummary::of(target));
        }
    }

    tracing::debug!(
        targets = target_faces.len(),
        matches = face_matches.len(),
        max_similarity,
        threshold,
        "face comparison complete"
    );

    Ok(ComparisonResult {
        similarity: max_similarity,
        confidence: source.detection_confidence,
        face_matches,
        source_face: FaceSummary::with_landmarks(source),
        target_faces: target_faces.iter().map(FaceSummary::of).collect(),
        unmatched_faces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn face(values: Vec<f32>, confidence: f32) -> FaceRecord {
        FaceRecord {
            bounding_box: BoundingBox { x: 1.0, y: 2.0, width: 30.0, height: 40.0 },
            detection_confidence: confidence,
            embedding: Embedding::new(values),
            landmarks: vec![],
            age: None,
            gender: None,
        }
    }

    #[test]
    fn test_compare_splits_matches() {
        let source = [face(vec![1.0, 0.0], 0.99)];
        let targets = [
            face(vec![1.0, 0.0], 0.9),  // 1.0
            face(vec![0.0, 1.0], 0.8),  // 0.0
            face(vec![0.6, 0.8], 0.7),  // 0.6
        ];
        let r = compare(&source, &targets, 0.5).unwrap();
        assert!((r.similarity - 1.0).abs() < 1e-6);
        assert_eq!(r.confidence, 0.99);
        assert_eq!(r.face_matches.len(), 2);
        assert_eq!(r.unmatched_faces.len(), 1);
        assert_eq!(r.unmatched_faces[0].confidence, 0.8);
        assert_eq!(r.target_faces.len(), 3);
        assert!(r.source_face.landmarks.is_some());
    }

    #[test]
    fn test_compare_floors_similarity_at_zero() {
        let r = compare(&[face(vec![1.0, 0.0], 0.9)], &[face(vec![-1.0, 0.0], 0.9)], 0.01).unwrap();
        assert_eq!(r.similarity, 0.0);
        assert!(r.face_matches.is_empty());
    }

    #[test]
    fn test_compare_threshold_is_inclusive() {
        let r = compare(&[face(vec![1.0, 0.0], 0.9)], &[face(vec![0.6, 0.8], 0.9)], 0.6).unwrap();
        // cos is 0.6 up to float error
        assert_eq!(r.face_matches.len() + r.unmatched_faces.len(), 1);
        let r = compare(&[face(vec![1.0, 0.0], 0.9)], &[face(vec![1.0, 0.0], 0.9)], 1.0).unwrap();
        assert_eq!(r.face_matches.len(), 1);
    }

    #[test]
    fn test_compare_requires_faces() {
        let f = [face(vec![1.0], 0.9)];
        assert!(matches!(compare(&[], &f, 0.5), Err(AnalysisError::NoFace("source"))));
        assert!(matches!(compare(&f, &[], 0.5), Err(AnalysisError::NoFace("target"))));
    }

    #[test]
    fn test_compare_zero_embedding_is_processing_error() {
        let err = compare(&[face(vec![0.0, 0.0], 0.9)], &[face(vec![1.0, 0.0], 0.9)], 0.5).unwrap_err();
        assert!(!err.is_input_error());
    }
}
