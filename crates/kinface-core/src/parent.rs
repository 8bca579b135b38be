//! Pick the candidate parent a child resembles most.
//!
//! Every candidate yields exactly one ranked entry. Candidates that cannot be
//! scored get a zero-score entry labelled with the reason instead of failing
//! the whole search.

use std::collections::BTreeMap;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::compare::{compare, FaceSummary};
use crate::error::AnalysisError;
use crate::family::FamilyAnalyzer;
use crate::geometry::FacialFeature;
use crate::provider::EmbeddingProvider;
use crate::types::FaceRecord;

/// Threshold used for the plain comparison path.
const BASIC_COMPARISON_THRESHOLD: f32 = 0.01;

pub const CHILD_FACE_MISSING: &str = "자녀 얼굴 감지 실패";
pub const PARENT_FACE_MISSING: &str = "부모 얼굴 감지 실패";
pub const ANALYSIS_FAILED: &str = "분석 실패";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    FamilyAnalysis,
    BasicComparison,
}

/// One ranked candidate. Scores are percentages in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentMatch {
    pub image_index: usize,
    pub similarity: f32,
    pub family_similarity: Option<f32>,
    pub confidence: f32,
    pub feature_breakdown: Option<BTreeMap<FacialFeature, f32>>,
    pub similarity_level: String,
    /// False for placeholder entries.
    #[serde(skip)]
    pub succeeded: bool,
}

impl ParentMatch {
    fn placeholder(image_index: usize, method: AnalysisMethod, label: &str) -> Self {
        let family = method == AnalysisMethod::FamilyAnalysis;
        Self {
            image_index,
            similarity: 0.0,
            family_similarity: family.then_some(0.0),
            confidence: 0.0,
            feature_breakdown: family.then(BTreeMap::new),
            similarity_level: label.to_string(),
            succeeded: false,
        }
    }

    fn rank_key(&self, method: AnalysisMethod) -> f32 {
        match method {
            AnalysisMethod::FamilyAnalysis => self.family_similarity.unwrap_or(0.0),
            AnalysisMethod::BasicComparison => self.similarity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentSearchResult {
    /// Sorted by the method's score, highest first.
    pub matches: Vec<ParentMatch>,
    /// Highest-ranked entry that was actually scored.
    pub best_match: Option<ParentMatch>,
    pub child_face_info: Option<FaceSummary>,
    pub analysis_method: AnalysisMethod,
}

/// Five-bucket label for a plain similarity percentage.
pub fn percent_similarity_level(percent: f32) -> &'static str {
    if percent > 80.0 {
        "매우 높은 유사도"
    } else if percent > 60.0 {
        "높은 유사도"
    } else if percent > 40.0 {
        "보통 유사도"
    } else if percent > 20.0 {
        "낮은 유사도"
    } else {
        "매우 낮은 유사도"
    }
}

/// Ranks candidate parents for one child.
pub struct ParentSelector<'a> {
    analyzer: &'a FamilyAnalyzer,
}

impl<'a> ParentSelector<'a> {
    pub fn new(analyzer: &'a FamilyAnalyzer) -> Self {
        Self { analyzer }
    }

    /// Detect faces in every image and rank the candidates.
    ///
    /// The child image is detected once. Detection failures are attributed to
    /// the candidate they affect.
    pub fn find_most_similar_parent<P: EmbeddingProvider + ?Sized>(
        &self,
        provider: &mut P,
        child_image: &RgbImage,
        parent_images: &[RgbImage],
        child_age: Option<u32>,
        use_family_analysis: bool,
    ) -> ParentSearchResult {
        let method = method_for(use_family_analysis);

        tracing::info!(
            candidates = parent_images.len(),
            ?method,
            "searching for most similar parent"
        );

        let child = provider.detect(child_image);
        if let Err(e) = &child {
            tracing::error!(error = %e, "child face detection failed");
        }

        let matches = parent_images
            .iter()
            .enumerate()
            .map(|(index, parent_image)| {
                let child_faces = match &child {
                    Ok(faces) => faces,
                    Err(_) => return ParentMatch::placeholder(index, method, ANALYSIS_FAILED),
                };
                if method == AnalysisMethod::FamilyAnalysis && child_faces.is_empty() {
                    tracing::warn!(candidate = index, "no child face for comparison");
                    return ParentMatch::placeholder(index, method, CHILD_FACE_MISSING);
                }
                let parent_faces = provider.detect(parent_image).map_err(AnalysisError::from);
                self.score_or_placeholder(index, child_faces, parent_faces, child_age, method)
            })
            .collect();

        let child_face_info = child.ok().and_then(|faces| faces.first().map(FaceSummary::of));
        finish(matches, child_face_info, method)
    }

    /// Rank already-detected faces. `candidates[i]` holds the faces found in
    /// candidate image `i`.
    pub fn rank_faces(
        &self,
        child_faces: &[FaceRecord],
        candidates: &[Vec<FaceRecord>],
        child_age: Option<u32>,
        use_family_analysis: bool,
    ) -> ParentSearchResult {
        let method = method_for(use_family_analysis);
        let matches = candidates
            .iter()
            .enumerate()
            .map(|(index, parent_faces)| {
                self.score_or_placeholder(index, child_faces, Ok(parent_faces.clone()), child_age, method)
            })
            .collect();
        finish(matches, child_faces.first().map(FaceSummary::of), method)
    }

    fn score_or_placeholder(
        &self,
        index: usize,
        child_faces: &[FaceRecord],
        parent_faces: Result<Vec<FaceRecord>, AnalysisError>,
        child_age: Option<u32>,
        method: AnalysisMethod,
    ) -> ParentMatch {
        let scored = parent_faces.and_then(|parent_faces| match method {
            AnalysisMethod::FamilyAnalysis => self.family_entry(index, child_faces, &parent_faces, child_age),
            AnalysisMethod::BasicComparison => basic_entry(index, child_faces, &parent_faces),
        });

        match scored {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(candidate = index, error = %e, "candidate analysis failed");
                ParentMatch::placeholder(index, method, ANALYSIS_FAILED)
            }
        }
    }

    fn family_entry(
        &self,
        index: usize,
        child_faces: &[FaceRecord],
        parent_faces: &[FaceRecord],
        child_age: Option<u32>,
    ) -> Result<ParentMatch, AnalysisError> {
        let Some(child) = child_faces.first() else {
            return Ok(ParentMatch::placeholder(index, AnalysisMethod::FamilyAnalysis, CHILD_FACE_MISSING));
        };
        let Some(parent) = parent_faces.first() else {
            tracing::warn!(candidate = index, "no parent face detected");
            return Ok(ParentMatch::placeholder(index, AnalysisMethod::FamilyAnalysis, PARENT_FACE_MISSING));
        };

        let result = self.analyzer.calculate_family_similarity(
            parent,
            child,
            parent.age,
            child_age.or(child.age),
        )?;

        tracing::info!(
            candidate = index,
            family_similarity = result.family_similarity * 100.0,
            "family analysis complete"
        );

        Ok(ParentMatch {
            image_index: index,
            similarity: result.base_similarity * 100.0,
            family_similarity: Some(result.family_similarity * 100.0),
            confidence: result.confidence * 100.0,
            feature_breakdown: Some(
                result
                    .feature_breakdown
                    .iter()
                    .map(|(&feature, &score)| (feature, score * 100.0))
                    .collect(),
            ),
            similarity_level: result.similarity_level.as_str().to_string(),
            succeeded: true,
        })
    }
}

fn basic_entry(
    index: usize,
    child_faces: &[FaceRecord],
    parent_faces: &[FaceRecord],
) -> Result<ParentMatch, AnalysisError> {
    let result = compare(child_faces, parent_faces, BASIC_COMPARISON_THRESHOLD)?;
    let similarity = result.similarity * 100.0;

    tracing::info!(candidate = index, similarity, "basic comparison complete");

    Ok(ParentMatch {
        image_index: index,
        similarity,
        family_similarity: None,
        confidence: result.confidence * 100.0,
        feature_breakdown: None,
        similarity_level: percent_similarity_level(similarity).to_string(),
        succeeded: true,
    })
}

fn method_for(use_family_analysis: bool) -> AnalysisMethod {
    if use_family_analysis {
        AnalysisMethod::FamilyAnalysis
    } else {
        AnalysisMethod::BasicComparison
    }
}

fn finish(
    mut matches: Vec<ParentMatch>,
    child_face_info: Option<FaceSummary>,
    method: AnalysisMethod,
) -> ParentSearchResult {
    // Stable: equal scores keep candidate order.
    matches.sort_by(|a, b| {
        b.rank_key(method)
            .partial_cmp(&a.rank_key(method))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let best_match = matches.iter().find(|m| m.succeeded).cloned();

    match &best_match {
        Some(best) => tracing::info!(
            candidates = matches.len(),
            best_index = best.image_index,
            best_score = best.rank_key(method),
            "parent search complete"
        ),
        None => tracing::warn!(candidates = matches.len(), "parent search found no scorable candidate"),
    }

    ParentSearchResult {
        matches,
        best_match,
        child_face_info,
        analysis_method: method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{face, keyed_image, MockProvider};

    const CHILD: u8 = 10;

    fn provider() -> MockProvider {
        MockProvider::new()
            .with_face(CHILD, vec![1.0, 0.0, 0.0])
            .with_face(1, vec![0.5, 0.866_025_4, 0.0])
            .with_face(3, vec![0.0, 1.0, 0.0])
    }

    #[test]
    fn test_partial_failure_keeps_every_candidate() {
        let analyzer = FamilyAnalyzer::default();
        let mut p = provider();
        // 1: face, 2: no face, 255: provider error
        let parents = [keyed_image(1), keyed_image(2), keyed_image(255)];
        let r = ParentSelector::new(&analyzer).find_most_similar_parent(
            &mut p,
            &keyed_image(CHILD),
            &parents,
            None,
            true,
        );

        assert_eq!(p.calls, 4, "child is detected once");
        assert_eq!(r.analysis_method, AnalysisMethod::FamilyAnalysis);
        assert_eq!(r.matches.len(), 3);
        assert_eq!(r.matches[0].image_index, 0);
        assert!(r.matches[0].family_similarity.unwrap() > 0.0);
        assert_eq!(r.matches[1].image_index, 1);
        assert_eq!(r.matches[1].similarity_level, PARENT_FACE_MISSING);
        assert_eq!(r.matches[1].family_similarity, Some(0.0));
        assert_eq!(r.matches[2].image_index, 2);
        assert_eq!(r.matches[2].similarity_level, ANALYSIS_FAILED);
        assert_eq!(r.best_match.unwrap().image_index, 0);
        assert!(r.child_face_info.is_some());
    }

    #[test]
    fn test_family_mode_ranks_by_family_similarity() {
        let analyzer = FamilyAnalyzer::default();
        let mut p = provider();
        let parents = [keyed_image(3), keyed_image(1)];
        let r = ParentSelector::new(&analyzer).find_most_similar_parent(
            &mut p,
            &keyed_image(CHILD),
            &parents,
            Some(8),
            true,
        );
        assert_eq!(r.matches[0].image_index, 1);
        assert_eq!(r.best_match.as_ref().unwrap().image_index, 1);
        let m = &r.matches[0];
        // cos 0.5 → base 0.55
        assert!((m.similarity - 55.0).abs() < 1e-3);
        assert!(m.feature_breakdown.as_ref().unwrap().values().all(|v| (0.0..=100.0).contains(v)));
        assert!((30.0..=100.0).contains(&m.confidence));
    }

    #[test]
    fn test_missing_child_face_labels_every_candidate() {
        let analyzer = FamilyAnalyzer::default();
        let mut p = provider();
        let parents = [keyed_image(1), keyed_image(3)];
        let r = ParentSelector::new(&analyzer).find_most_similar_parent(
            &mut p,
            &keyed_image(42),
            &parents,
            None,
            true,
        );
        assert_eq!(p.calls, 1);
        assert!(r.matches.iter().all(|m| m.similarity_level == CHILD_FACE_MISSING));
        assert!(r.best_match.is_none());
        assert!(r.child_face_info.is_none());
    }

    #[test]
    fn test_basic_mode() {
        let analyzer = FamilyAnalyzer::default();
        let mut p = provider();
        let parents = [keyed_image(3), keyed_image(1), keyed_image(2)];
        let r = ParentSelector::new(&analyzer).find_most_similar_parent(
            &mut p,
            &keyed_image(CHILD),
            &parents,
            None,
            false,
        );
        assert_eq!(r.analysis_method, AnalysisMethod::BasicComparison);
        let best = &r.matches[0];
        assert_eq!(best.image_index, 1);
        assert!((best.similarity - 50.0).abs() < 1e-3);
        assert!((best.confidence - 90.0).abs() < 1e-3);
        assert_eq!(best.family_similarity, None);
        assert!(best.feature_breakdown.is_none());
        assert_eq!(best.similarity_level, "보통 유사도");
        // No parent face → comparison error → placeholder without family fields.
        let failed = r.matches.iter().find(|m| m.image_index == 2).unwrap();
        assert_eq!(failed.similarity_level, ANALYSIS_FAILED);
        assert_eq!(failed.family_similarity, None);
    }

    #[test]
    fn test_explicit_child_age_wins() {
        let analyzer = FamilyAnalyzer::default();
        let mut child = face(vec![1.0, 0.0]);
        child.age = Some(30);
        let mut parent = face(vec![0.6, 0.8]);
        parent.age = Some(40);

        let r = ParentSelector::new(&analyzer).rank_faces(&[child.clone()], &[vec![parent.clone()]], Some(10), true);
        let expected = analyzer
            .calculate_family_similarity(&parent, &child, Some(40), Some(10))
            .unwrap();
        let got = r.matches[0].family_similarity.unwrap();
        assert!((got - expected.family_similarity * 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_rank_faces_zero_embedding_becomes_placeholder() {
        let analyzer = FamilyAnalyzer::default();
        let child = face(vec![1.0, 0.0]);
        let r = ParentSelector::new(&analyzer).rank_faces(
            &[child],
            &[vec![face(vec![0.0, 0.0])], vec![face(vec![1.0, 0.0])]],
            None,
            true,
        );
        assert_eq!(r.matches[0].image_index, 1);
        assert_eq!(r.matches[1].similarity_level, ANALYSIS_FAILED);
        assert_eq!(r.best_match.unwrap().image_index, 1);
    }

    #[test]
    fn test_percent_levels() {
        assert_eq!(percent_similarity_level(80.5), "매우 높은 유사도");
        assert_eq!(percent_similarity_level(80.0), "높은 유사도");
        assert_eq!(percent_similarity_level(40.0), "낮은 유사도");
        assert_eq!(percent_similarity_level(0.0), "매우 낮은 유사도");
    }

    #[test]
    fn test_serialized_entry_has_no_success_flag() {
        let m = ParentMatch::placeholder(3, AnalysisMethod::BasicComparison, ANALYSIS_FAILED);
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("succeeded").is_none());
        assert!(v["family_similarity"].is_null());
        assert_eq!(v["image_index"], 3);
    }
}
