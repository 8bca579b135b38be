//! Age and gender estimation with the InsightFace genderage model.

use crate::alignment::SimilarityTransform;
use crate::types::{BoundingBox, Gender, GenderValue};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: u32 = 96;
/// Crop side relative to the longer bbox side.
const GENDERAGE_CROP_MARGIN: f32 = 1.5;
const GENDERAGE_AGE_SCALE: f32 = 100.0;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Age/gender estimate for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceAttributes {
    pub age: u32,
    pub gender: Gender,
}

pub struct AttributeEstimator {
    session: Session,
}

impl AttributeEstimator {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, AttributeError> {
        if !Path::new(model_path).exists() {
            return Err(AttributeError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded genderage model");

        Ok(Self { session })
    }

    /// Estimate age and gender from the face inside `bbox`.
    pub fn estimate(
        &mut self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<FaceAttributes, AttributeError> {
        let crop = SimilarityTransform::centered_on(bbox, GENDERAGE_INPUT_SIZE, GENDERAGE_CROP_MARGIN)
            .warp(image, GENDERAGE_INPUT_SIZE);
        let input = Self::preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, pred) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("genderage output: {e}")))?;

        decode_prediction(pred)
    }

    /// The genderage model takes raw 0-255 RGB values.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = GENDERAGE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32;
            }
        }
        tensor
    }
}

/// Decode `[female_score, male_score, age / 100]`.
fn decode_prediction(pred: &[f32]) -> Result<FaceAttributes, AttributeError> {
    let [female, male, age] = match pred {
        [f, m, a, ..] => [*f, *m, *a],
        _ => {
            return Err(AttributeError::InferenceFailed(format!(
                "expected 3 outputs, got {}",
                pred.len()
            )))
        }
    };

    let (value, winning) = if male > female {
        (GenderValue::Male, male)
    } else {
        (GenderValue::Female, female)
    };

    // Scores are logits; report the softmax of the winner as confidence.
    let (e_f, e_m) = ((female - winning).exp(), (male - winning).exp());
    let confidence = 1.0 / (e_f + e_m);

    Ok(FaceAttributes {
        age: (age * GENDERAGE_AGE_SCALE).round().max(0.0) as u32,
        gender: Gender { value, confidence },
    })
}
