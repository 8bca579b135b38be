//! ArcFace (w600k_r50) embedding extraction.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::types::{Embedding, Point, LANDMARK_COUNT};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Length of every embedding this recognizer produces.
pub const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";
// ArcFace scales symmetrically around 127.5, unlike SCRFD.
const PIXEL_CENTER: f32 = 127.5;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download buffalo_l from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("recognizer inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, "recognizer loaded");

        Ok(Self { session })
    }

    /// Align the face on its landmarks and embed it.
    ///
    /// The vector is not normalized; callers report its norm as a quality score.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        landmarks: &[Point; LANDMARK_COUNT],
    ) -> Result<Embedding, RecognizerError> {
        let input = face_tensor(&align_face(image, landmarks));
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;
        embedding_from_output(raw)
    }
}

/// RGB NCHW tensor scaled to [-1, 1].
fn face_tensor(aligned: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let value = aligned
            .get_pixel_checked(x as u32, y as u32)
            .map_or(0.0, |p| p[c] as f32);
        (value - PIXEL_CENTER) / PIXEL_CENTER
    })
}

fn embedding_from_output(raw: &[f32]) -> Result<Embedding, RecognizerError> {
    if raw.len() != EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected a {EMBEDDING_DIM}-dim embedding, got {} values",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed("embedding contains non-finite values".into()));
    }
    Ok(Embedding {
        values: raw.to_vec(),
        model_version: Some(MODEL_VERSION.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_face_tensor_scaling() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let t = face_tensor(&aligned);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 60, 7]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 60, 7]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 60, 7]] - 0.5 / 127.5).abs() < 1e-6);
    }

    #[test]
    fn test_face_tensor_pads_small_crops() {
        let t = face_tensor(&RgbImage::from_pixel(10, 10, Rgb([255, 255, 255])));
        assert!((t[[0, 0, 100, 100]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_from_output() {
        let e = embedding_from_output(&[0.1; EMBEDDING_DIM]).unwrap();
        assert_eq!(e.len(), EMBEDDING_DIM);
        assert_eq!(e.model_version.as_deref(), Some("w600k_r50"));

        assert!(embedding_from_output(&[0.1; 128]).is_err());
        let mut bad = vec![0.1; EMBEDDING_DIM];
        bad[3] = f32::NAN;
        assert!(embedding_from_output(&bad).is_err());
    }

    #[test]
    fn test_missing_model() {
        assert!(matches!(
            FaceRecognizer::load("/nonexistent/w600k_r50.onnx", 1),
            Err(RecognizerError::ModelNotFound(_))
        ));
    }
}
