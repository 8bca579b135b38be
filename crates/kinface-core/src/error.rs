use thiserror::Error;

use crate::provider::ProviderError;
use crate::similarity::SimilarityError;

/// Errors surfaced by the analysis operations.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("no face detected in {0} image")]
    NoFace(&'static str),
    #[error("face_id {index} is out of range ({count} faces detected)")]
    FaceIndexOutOfRange { index: usize, count: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("similarity computation failed: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("face provider failed: {0}")]
    Provider(#[from] ProviderError),
}

impl AnalysisError {
    /// True for errors caused by the caller's input rather than by processing.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AnalysisError::NoFace(_)
                | AnalysisError::FaceIndexOutOfRange { .. }
                | AnalysisError::InvalidInput(_)
        )
    }
}
