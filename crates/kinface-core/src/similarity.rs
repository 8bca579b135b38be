//! Embedding similarity primitives shared by every comparison path.

use thiserror::Error;

/// Multiplier applied to parent/child cosine similarity. Cross-generation
/// pairs score systematically lower than same-person pairs because of age and
/// sex differences; the boost compensates before clamping to [0, 1].
pub const FAMILY_BOOST: f32 = 1.1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("embedding has zero or non-finite norm")]
    ZeroNorm,
    #[error("embedding dimensions differ: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

/// Euclidean length of a vector.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Scale a vector to unit length.
pub fn normalize(values: &[f32]) -> Result<Vec<f32>, SimilarityError> {
    let norm = l2_norm(values);
    if !norm.is_finite() || norm <= f32::EPSILON {
        return Err(SimilarityError::ZeroNorm);
    }
    Ok(values.iter().map(|v| v / norm).collect())
}

/// Cosine similarity of two vectors in [-1, 1].
///
/// Both inputs are L2-normalized first. A zero vector is an error rather than
/// a NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch(a.len(), b.len()));
    }
    let a = normalize(a)?;
    let b = normalize(b)?;
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    Ok(dot.clamp(-1.0, 1.0))
}

/// Parent/child cosine similarity with [`FAMILY_BOOST`] applied, clamped to [0, 1].
pub fn family_adjusted_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    let raw = cosine_similarity(a, b)?;
    Ok((raw * FAMILY_BOOST).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![0.3, -1.2, 4.0, 0.01];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(
            cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]),
            Err(SimilarityError::ZeroNorm)
        );
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        assert_eq!(
            cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]),
            Err(SimilarityError::DimensionMismatch(2, 3))
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let v = vec![0.5, -2.0, 7.25, 1.0];
        let once = normalize(&v).unwrap();
        let twice = normalize(&once).unwrap();
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalize_rejects_nan() {
        assert_eq!(normalize(&[f32::NAN, 1.0]), Err(SimilarityError::ZeroNorm));
    }

    #[test]
    fn test_family_boost_applied() {
        // cos = 0.6 → 0.66
        let a = [1.0, 0.0];
        let b = [0.6, 0.8];
        let sim = family_adjusted_similarity(&a, &b).unwrap();
        assert!((sim - 0.66).abs() < 1e-5, "got {sim}");
    }

    #[test]
    fn test_family_boost_clamped() {
        let a = [1.0, 0.0];
        assert_eq!(family_adjusted_similarity(&a, &a).unwrap(), 1.0);
        assert_eq!(family_adjusted_similarity(&a, &[-1.0, 0.0]).unwrap(), 0.0);
    }
}
