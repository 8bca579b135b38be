//! The seam between scoring code and the face model.

use crate::attributes::{AttributeError, AttributeEstimator};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceRecord;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";
pub const ATTRIBUTES_FILE: &str = "genderage.onnx";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attributes: {0}")]
    Attributes(#[from] AttributeError),
}

/// Anything that turns an image into detected, embedded faces.
///
/// Faces come back sorted by detection confidence, highest first.
pub trait EmbeddingProvider {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ProviderError>;

    /// Model identifier reported in response metadata.
    fn model_version(&self) -> &str;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ProviderError> {
        (**self).detect(image)
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }
}

/// `$XDG_DATA_HOME/kinface/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("kinface/models")
}

/// Where to find the ONNX model pack.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub attributes: PathBuf,
}

impl ModelPaths {
    /// Standard InsightFace file names inside `dir/model_name`, or directly in
    /// `dir` when that subdirectory does not exist.
    pub fn in_dir(dir: &Path, model_name: &str) -> Self {
        let pack = dir.join(model_name);
        let base = if pack.is_dir() { pack } else { dir.to_path_buf() };
        Self {
            detector: base.join(DETECTOR_FILE),
            recognizer: base.join(RECOGNIZER_FILE),
            attributes: base.join(ATTRIBUTES_FILE),
        }
    }
}

/// SCRFD + ArcFace + optional genderage, all on ONNX Runtime.
pub struct OnnxFaceProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    attributes: Option<AttributeEstimator>,
    model_name: String,
}

impl OnnxFaceProvider {
    /// Load all sessions. A missing attribute model is not an error; faces
    /// then carry no age or gender.
    pub fn load(
        paths: &ModelPaths,
        model_name: &str,
        intra_threads: usize,
    ) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&paths.detector.to_string_lossy(), intra_threads)?;
        let recognizer = FaceRecognizer::load(&paths.recognizer.to_string_lossy(), intra_threads)?;
        let attributes = match AttributeEstimator::load(&paths.attributes.to_string_lossy(), intra_threads) {
            Ok(est) => Some(est),
            Err(AttributeError::ModelNotFound(path)) => {
                tracing::warn!(%path, "genderage model not found, age/gender disabled");
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            detector,
            recognizer,
            attributes,
            model_name: model_name.to_string(),
        })
    }

    pub fn has_attributes(&self) -> bool {
        self.attributes.is_some()
    }
}

impl EmbeddingProvider for OnnxFaceProvider {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ProviderError> {
        let detections = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());

        for det in detections {
            // ArcFace needs landmarks for alignment.
            let Some(landmarks) = det.landmarks else {
                tracing::debug!(confidence = det.confidence, "skipping detection without landmarks");
                continue;
            };

            let embedding = self.recognizer.extract(image, &landmarks)?;

            let (age, gender) = match self.attributes.as_mut() {
                Some(est) => {
                    let attrs = est.estimate(image, &det.bbox)?;
                    (Some(attrs.age), Some(attrs.gender))
                }
                None => (None, None),
            };

            faces.push(FaceRecord {
                bounding_box: det.bbox,
                detection_confidence: det.confidence,
                embedding,
                landmarks: landmarks.to_vec(),
                age,
                gender,
            });
        }

        Ok(faces)
    }

    fn model_version(&self) -> &str {
        &self.model_name
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths_flat_dir() {
        let paths = ModelPaths::in_dir(Path::new("/nonexistent/models"), "buffalo_l");
        assert_eq!(paths.detector, Path::new("/nonexistent/models/det_10g.onnx"));
        assert_eq!(paths.attributes, Path::new("/nonexistent/models/genderage.onnx"));
    }

    #[test]
    fn test_load_missing_detector() {
        let paths = ModelPaths::in_dir(Path::new("/nonexistent/models"), "buffalo_l");
        let err = OnnxFaceProvider::load(&paths, "buffalo_l", 1).err().expect("must fail");
        assert!(matches!(err, ProviderError::Detector(DetectorError::ModelNotFound(_))));
    }
}
