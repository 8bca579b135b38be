//! Parent/child family-similarity scoring.
//!
//! Fuses the family-adjusted embedding similarity, per-region landmark
//! geometry and an age-gap compensation into one relatedness score with a
//! confidence and a human-readable explanation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::geometry::{FacialFeature, FeatureBreakdown, FeatureExtractor, JitterMode};
use crate::similarity;
use crate::types::FaceRecord;

/// Share of the final score taken by the age-corrected embedding similarity.
const EMBEDDING_SHARE: f32 = 0.7;
/// Share of the final score taken by the weighted feature score.
const FEATURE_SHARE: f32 = 0.3;

/// Weight for a feature missing from the weight table.
const UNLISTED_FEATURE_WEIGHT: f32 = 0.1;

/// Age gap above which the child-to-adult compensation applies.
const CHILD_TO_ADULT_GAP: u32 = 20;
/// Age gap meant to trigger the elderly compensation. Checked after
/// [`CHILD_TO_ADULT_GAP`], so it never fires.
const ELDERLY_GAP: u32 = 50;
const CHILD_TO_ADULT_COMPENSATION: f32 = 1.15;
const ELDERLY_COMPENSATION: f32 = 0.95;
const SAME_GENERATION_COMPENSATION: f32 = 1.0;

const MIN_CONFIDENCE: f32 = 0.3;
const WEIGHT_SUM_TOLERANCE: f32 = 1e-4;

/// Per-feature weights for the feature score. Must sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureWeights(BTreeMap<FacialFeature, f32>);

impl Default for FeatureWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (FacialFeature::EyeRegion, 0.35),
            (FacialFeature::NoseShape, 0.25),
            (FacialFeature::FaceShape, 0.30),
            (FacialFeature::MouthRegion, 0.10),
        ]))
    }
}

impl FeatureWeights {
    /// Build a validated weight table.
    pub fn new(weights: BTreeMap<FacialFeature, f32>) -> Result<Self, AnalysisError> {
        let table = Self(weights);
        table.validate()?;
        Ok(table)
    }

    /// Check that every weight is a finite non-negative number and that the table sums to 1.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if let Some((feature, w)) = self.0.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(AnalysisError::InvalidInput(format!(
                "feature weight for {feature} must be a non-negative number, got {w}"
            )));
        }
        let sum: f32 = self.0.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(AnalysisError::InvalidInput(format!(
                "feature weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }

    pub fn get(&self, feature: FacialFeature) -> f32 {
        self.0.get(&feature).copied().unwrap_or(UNLISTED_FEATURE_WEIGHT)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FacialFeature, &f32)> {
        self.0.iter()
    }
}

/// Five-bucket classification of the final family score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityLevel {
    #[serde(rename = "매우 높은 닮음")]
    VeryHigh,
    #[serde(rename = "높은 닮음")]
    High,
    #[serde(rename = "보통 닮음")]
    Moderate,
    #[serde(rename = "약간 닮음")]
    Slight,
    #[serde(rename = "낮은 닮음")]
    Low,
}

impl SimilarityLevel {
    /// Bucket a family score. Lower bounds are strict: 0.8 is "높은 닮음".
    pub fn classify(family_similarity: f32) -> Self {
        if family_similarity > 0.8 {
            SimilarityLevel::VeryHigh
        } else if family_similarity > 0.6 {
            SimilarityLevel::High
        } else if family_similarity > 0.4 {
            SimilarityLevel::Moderate
        } else if family_similarity > 0.2 {
            SimilarityLevel::Slight
        } else {
            SimilarityLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityLevel::VeryHigh => "매우 높은 닮음",
            SimilarityLevel::High => "높은 닮음",
            SimilarityLevel::Moderate => "보통 닮음",
            SimilarityLevel::Slight => "약간 닮음",
            SimilarityLevel::Low => "낮은 닮음",
        }
    }
}

/// Output of one parent/child comparison. Every score is in [0, 1] except
/// `confidence`, which is in [0.3, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilySimilarityResult {
    pub family_similarity: f32,
    pub base_similarity: f32,
    pub age_corrected_similarity: f32,
    pub feature_breakdown: FeatureBreakdown,
    pub confidence: f32,
    pub explanation: BTreeMap<FacialFeature, String>,
    pub similarity_level: SimilarityLevel,
}

/// Family-similarity engine. Stateless after construction; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct FamilyAnalyzer {
    weights: FeatureWeights,
    extractor: FeatureExtractor,
}

impl FamilyAnalyzer {
    pub fn new(weights: FeatureWeights, jitter: JitterMode) -> Self {
        Self {
            weights,
            extractor: FeatureExtractor::new(jitter),
        }
    }

    pub fn weights(&self) -> &FeatureWeights {
        &self.weights
    }

    /// Score how much `child` resembles `parent`.
    ///
    /// Ages are used only when both are known. Callers that have both an
    /// explicit and a detected age should pass the explicit one.
    pub fn calculate_family_similarity(
        &self,
        parent: &FaceRecord,
        child: &FaceRecord,
        parent_age: Option<u32>,
        child_age: Option<u32>,
    ) -> Result<FamilySimilarityResult, AnalysisError> {
        self.score(parent, child, parent_age, child_age).map_err(|e| {
            tracing::error!(error = %e, "family similarity calculation failed");
            e
        })
    }

    fn score(
        &self,
        parent: &FaceRecord,
        child: &FaceRecord,
        parent_age: Option<u32>,
        child_age: Option<u32>,
    ) -> Result<FamilySimilarityResult, AnalysisError> {
        let base_similarity =
            similarity::family_adjusted_similarity(&parent.embedding.values, &child.embedding.values)?;

        let feature_breakdown = self.extractor.extract(parent, child, base_similarity);
        let age_corrected_similarity = age_corrected_similarity(base_similarity, parent_age, child_age);

        let feature_score = weighted_feature_score(&self.weights, &feature_breakdown);
        let family_similarity =
            (EMBEDDING_SHARE * age_corrected_similarity + FEATURE_SHARE * feature_score).clamp(0.0, 1.0);

        let confidence = feature_confidence(&feature_breakdown);
        let explanation = explain(&feature_breakdown);
        let similarity_level = SimilarityLevel::classify(family_similarity);

        tracing::debug!(
            base_similarity,
            age_corrected_similarity,
            feature_score,
            family_similarity,
            confidence,
            ?parent_age,
            ?child_age,
            "family similarity computed"
        );

        Ok(FamilySimilarityResult {
            family_similarity,
            base_similarity,
            age_corrected_similarity,
            feature_breakdown,
            confidence,
            explanation,
            similarity_level,
        })
    }
}

/// Compensate the base similarity for the parent/child age gap.
///
/// Returns `base_similarity` unchanged when either age is unknown.
pub fn age_corrected_similarity(base_similarity: f32, parent_age: Option<u32>, child_age: Option<u32>) -> f32 {
    let (Some(parent_age), Some(child_age)) = (parent_age, child_age) else {
        return base_similarity;
    };

    let age_diff = parent_age.abs_diff(child_age);

    // First match wins; the elderly branch is shadowed by the wider one above it.
    let compensation = if age_diff > CHILD_TO_ADULT_GAP {
        CHILD_TO_ADULT_COMPENSATION
    } else if age_diff > ELDERLY_GAP {
        ELDERLY_COMPENSATION
    } else {
        SAME_GENERATION_COMPENSATION
    };

    let age_factor = 1.0 + age_diff as f32 / 100.0;
    (base_similarity * compensation * age_factor).clamp(0.0, 1.0)
}

/// Weighted mean of the breakdown. An empty breakdown scores 0.5.
pub fn weighted_feature_score(weights: &FeatureWeights, breakdown: &FeatureBreakdown) -> f32 {
    let mut weighted_sum = 0.0f32;
    let mut total_weight = 0.0f32;
    for (&feature, &score) in breakdown {
        let weight = weights.get(feature);
        weighted_sum += score * weight;
        total_weight += weight;
    }
    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.5
    }
}

/// Consistent scores across regions mean higher confidence:
/// `1 - min(variance * 2, 0.5)`, clamped to [0.3, 1].
pub fn feature_confidence(breakdown: &FeatureBreakdown) -> f32 {
    let confidence = 1.0 - (population_variance(breakdown.values().copied()) * 2.0).min(0.5);
    confidence.clamp(MIN_CONFIDENCE, 1.0)
}

fn population_variance(values: impl Iterator<Item = f32> + Clone) -> f32 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f32>() / n as f32;
    values.map(|v| (v - mean).powi(2)).sum::<f32>() / n as f32
}

/// Per-feature text such as `"매우 유사 (0.82)"`.
pub fn explain(breakdown: &FeatureBreakdown) -> BTreeMap<FacialFeature, String> {
    breakdown
        .iter()
        .map(|(&feature, &score)| {
            let level = if score > 0.7 {
                "매우 유사"
            } else if score > 0.5 {
                "유사"
            } else if score > 0.3 {
                "약간 유사"
            } else {
                "다름"
            };
            (feature, format!("{level} ({score:.2})"))
        })
        .collect()
}
