//! Face analysis routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use kinface_core::batch::{self, BatchMode, BatchOutcome};
use kinface_core::{
    compare, AnalysisError, BoundingBox, ComparisonResult, FaceRecord, FamilySimilarityResult, Gender,
    ParentSearchResult, Point,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use crate::response::{ApiError, Envelope};
use crate::state::AppState;

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

const MAX_FACES_LIMIT: usize = 50;
const MAX_AGE: u32 = 120;
const PARENT_CANDIDATES: (usize, usize) = (2, 10);
const BATCH_IMAGES: (usize, usize) = (2, 20);

fn default_compare_threshold() -> f32 {
    0.01
}
fn default_batch_threshold() -> f32 {
    0.6
}
fn default_max_faces() -> usize {
    10
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CompareFacesRequest {
    pub source_image: String,
    pub target_image: String,
    #[serde(default = "default_compare_threshold")]
    pub similarity_threshold: f32,
}

#[derive(Debug, Deserialize)]
pub struct DetectFacesRequest {
    pub image: String,
    #[serde(default)]
    pub include_landmarks: bool,
    #[serde(default = "default_true")]
    pub include_attributes: bool,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExtractEmbeddingRequest {
    pub image: String,
    #[serde(default)]
    pub face_id: usize,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchImage {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchAnalysisRequest {
    pub images: Vec<BatchImage>,
    pub analysis_type: BatchMode,
    #[serde(default = "default_batch_threshold")]
    pub similarity_threshold: f32,
}

#[derive(Debug, Deserialize)]
pub struct FamilyFacesRequest {
    pub parent_image: String,
    pub child_image: String,
    #[serde(default)]
    pub parent_age: Option<u32>,
    #[serde(default)]
    pub child_age: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct FindParentRequest {
    pub child_image: String,
    pub parent_images: Vec<String>,
    #[serde(default)]
    pub child_age: Option<u32>,
    #[serde(default = "default_true")]
    pub use_family_analysis: bool,
}

#[derive(Debug, Serialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<Point>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    pub embedding: Vec<f32>,
    /// L2 norm of the raw embedding.
    pub quality_score: f32,
}

#[derive(Debug, Serialize)]
pub struct DetectionData {
    pub faces: Vec<DetectedFace>,
    pub face_count: usize,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub landmarks: Vec<Point>,
}

#[derive(Debug, Serialize)]
pub struct AgedFace {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    /// Age reported by the attribute model, if any.
    pub age: Option<u32>,
}

impl AgedFace {
    fn of(face: &FaceRecord) -> Self {
        Self {
            bounding_box: face.bounding_box,
            confidence: face.detection_confidence,
            age: face.age,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FamilyData {
    #[serde(flatten)]
    pub result: FamilySimilarityResult,
    pub parent_face: AgedFace,
    pub child_face: AgedFace,
    /// Ages that went into the age compensation.
    pub parent_age_used: Option<u32>,
    pub child_age_used: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct BatchData {
    #[serde(flatten)]
    pub outcome: BatchOutcome,
    pub analyzed_images: usize,
    /// Ids whose image produced no usable face.
    pub skipped_images: Vec<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| ApiError::InvalidInput(rejection.body_text()))
}

fn check_range<T: PartialOrd + Display>(name: &str, value: T, min: T, max: T) -> Result<(), ApiError> {
    if value < min || value > max {
        return Err(ApiError::InvalidInput(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

fn check_age(name: &str, age: Option<u32>) -> Result<(), ApiError> {
    age.map_or(Ok(()), |a| check_range(name, a, 0, MAX_AGE))
}

fn decode(state: &AppState, field: &str, data: &str) -> Result<image::RgbImage, ApiError> {
    kinface_img::decode_data_url(data, state.config.max_image_size).map_err(|e| {
        tracing::warn!(field, hash = %kinface_img::image_hash(data), error = %e, "rejected image");
        ApiError::from(e)
    })
}

pub async fn compare_faces(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CompareFacesRequest>, JsonRejection>,
) -> ApiResult<ComparisonResult> {
    let started = Instant::now();
    let req = body(payload)?;
    check_range("similarity_threshold", req.similarity_threshold, 0.0, 1.0)?;
    let engine = state.engine()?;

    let source = decode(&state, "source_image", &req.source_image)?;
    let target = decode(&state, "target_image", &req.target_image)?;

    let source_faces = engine.detect(source).await?;
    let target_faces = engine.detect(target).await?;
    let result = compare(&source_faces, &target_faces, req.similarity_threshold)?;

    Ok(Envelope::ok(result, started, engine.model_version()))
}

pub async fn detect_faces(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DetectFacesRequest>, JsonRejection>,
) -> ApiResult<DetectionData> {
    let started = Instant::now();
    let req = body(payload)?;
    check_range("max_faces", req.max_faces, 1, MAX_FACES_LIMIT)?;
    let engine = state.engine()?;

    let image = decode(&state, "image", &req.image)?;
    let mut faces = engine.detect(image).await?;
    faces.truncate(req.max_faces);

    let faces: Vec<DetectedFace> = faces
        .into_iter()
        .map(|face| {
            let quality_score = face.embedding.norm();
            DetectedFace {
                bounding_box: face.bounding_box,
                confidence: face.detection_confidence,
                landmarks: req.include_landmarks.then_some(face.landmarks),
                age: face.age.filter(|_| req.include_attributes),
                gender: face.gender.filter(|_| req.include_attributes),
                embedding: face.embedding.values,
                quality_score,
            }
        })
        .collect();

    let face_count = faces.len();
    Ok(Envelope::ok(DetectionData { faces, face_count }, started, engine.model_version()))
}

pub async fn extract_embedding(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExtractEmbeddingRequest>, JsonRejection>,
) -> ApiResult<EmbeddingData> {
    let started = Instant::now();
    let req = body(payload)?;
    let engine = state.engine()?;

    let image = decode(&state, "image", &req.image)?;
    let mut faces = engine.detect(image).await?;
    if faces.is_empty() {
        return Err(AnalysisError::NoFace("input").into());
    }
    if req.face_id >= faces.len() {
        return Err(AnalysisError::FaceIndexOutOfRange {
            index: req.face_id,
            count: faces.len(),
        }
        .into());
    }

    let face = faces.swap_remove(req.face_id);
    let embedding = if req.normalize {
        face.embedding.normalized().map_err(AnalysisError::from)?
    } else {
        face.embedding
    };

    Ok(Envelope::ok(
        EmbeddingData {
            embedding: embedding.values,
            bounding_box: face.bounding_box,
            confidence: face.detection_confidence,
            landmarks: face.landmarks,
        },
        started,
        engine.model_version(),
    ))
}

pub async fn batch_analysis(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BatchAnalysisRequest>, JsonRejection>,
) -> ApiResult<BatchData> {
    let started = Instant::now();
    let req = body(payload)?;
    check_range("images", req.images.len(), BATCH_IMAGES.0, BATCH_IMAGES.1)?;
    check_range("similarity_threshold", req.similarity_threshold, 0.0, 1.0)?;
    if req.images.len() > state.config.max_batch_size {
        return Err(ApiError::InvalidInput(format!(
            "batch size exceeds the maximum of {} images",
            state.config.max_batch_size
        )));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = req.images.iter().find(|img| !seen.insert(img.id.as_str())) {
        return Err(ApiError::InvalidInput(format!("duplicate image id: {}", dup.id)));
    }
    let engine = state.engine()?;

    let images = req
        .images
        .iter()
        .map(|img| decode(&state, &img.id, &img.image))
        .collect::<Result<Vec<_>, _>>()?;
    let detections = engine.detect_many(images).await?;

    let mut entries = Vec::with_capacity(req.images.len());
    let mut skipped_images = Vec::new();
    for (img, detection) in req.images.iter().zip(detections) {
        match detection.map(|faces| faces.into_iter().next()) {
            Ok(Some(face)) => entries.push((img.id.clone(), face.embedding.values)),
            Ok(None) => {
                tracing::warn!(id = %img.id, name = ?img.name, "no face in batch image, skipping");
                skipped_images.push(img.id.clone());
            }
            Err(e) => {
                tracing::warn!(id = %img.id, name = ?img.name, error = %e, "batch image failed, skipping");
                skipped_images.push(img.id.clone());
            }
        }
    }

    let outcome = batch::analyze(req.analysis_type, &entries, req.similarity_threshold)?;

    Ok(Envelope::ok(
        BatchData {
            outcome,
            analyzed_images: entries.len(),
            skipped_images,
        },
        started,
        engine.model_version(),
    ))
}

pub async fn compare_family_faces(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FamilyFacesRequest>, JsonRejection>,
) -> ApiResult<FamilyData> {
    let started = Instant::now();
    let req = body(payload)?;
    check_age("parent_age", req.parent_age)?;
    check_age("child_age", req.child_age)?;
    let engine = state.engine()?;

    let parent_image = decode(&state, "parent_image", &req.parent_image)?;
    let child_image = decode(&state, "child_image", &req.child_image)?;

    let parent_faces = engine.detect(parent_image).await?;
    let child_faces = engine.detect(child_image).await?;
    let parent = parent_faces.first().ok_or(AnalysisError::NoFace("parent"))?;
    let child = child_faces.first().ok_or(AnalysisError::NoFace("child"))?;

    let parent_age = req.parent_age.or(parent.age);
    let child_age = req.child_age.or(child.age);
    tracing::info!(
        detected_parent_age = ?parent.age,
        detected_child_age = ?child.age,
        ?parent_age,
        ?child_age,
        "family comparison ages"
    );

    let result = state
        .analyzer
        .calculate_family_similarity(parent, child, parent_age, child_age)?;

    Ok(Envelope::ok(
        FamilyData {
            result,
            parent_face: AgedFace::of(parent),
            child_face: AgedFace::of(child),
            parent_age_used: parent_age,
            child_age_used: child_age,
        },
        started,
        engine.model_version(),
    ))
}

pub async fn find_most_similar_parent(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FindParentRequest>, JsonRejection>,
) -> ApiResult<ParentSearchResult> {
    let started = Instant::now();
    let req = body(payload)?;
    check_range("parent_images", req.parent_images.len(), PARENT_CANDIDATES.0, PARENT_CANDIDATES.1)?;
    check_age("child_age", req.child_age)?;
    let engine = state.engine()?;

    let child = decode(&state, "child_image", &req.child_image)?;
    let parents = req
        .parent_images
        .iter()
        .enumerate()
        .map(|(i, data)| decode(&state, &format!("parent_images[{i}]"), data))
        .collect::<Result<Vec<_>, _>>()?;

    let result = engine
        .find_most_similar_parent(child, parents, req.child_age, req.use_family_analysis)
        .await?;

    Ok(Envelope::ok(result, started, engine.model_version()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::testing::{keyed, stub_engine};
    use base64::Engine as _;
    use kinface_core::FamilyAnalyzer;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Config::default(),
            Some(stub_engine()),
            Arc::new(FamilyAnalyzer::default()),
        ))
    }

    fn data_url(key: u8) -> String {
        let mut png = std::io::Cursor::new(Vec::new());
        keyed(key).write_to(&mut png, image::ImageFormat::Png).unwrap();
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png.into_inner())
        )
    }

    #[tokio::test]
    async fn test_compare_faces() {
        let req = CompareFacesRequest {
            source_image: data_url(10),
            target_image: data_url(12),
            similarity_threshold: 0.5,
        };
        let Json(env) = compare_faces(State(state()), Ok(Json(req))).await.unwrap();
        assert!(env.success);
        assert_eq!(env.data.face_matches.len(), 1);
        assert!(env.data.similarity > 0.99);
        assert_eq!(env.metadata.model_version, "stub");
    }

    #[tokio::test]
    async fn test_compare_faces_without_target_face() {
        let req = CompareFacesRequest {
            source_image: data_url(10),
            target_image: data_url(0),
            similarity_threshold: 0.5,
        };
        let err = compare_faces(State(state()), Ok(Json(req))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_threshold_out_of_range() {
        let req = CompareFacesRequest {
            source_image: data_url(10),
            target_image: data_url(12),
            similarity_threshold: 1.5,
        };
        let err = compare_faces(State(state()), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_no_engine_is_unavailable() {
        let state = Arc::new(AppState::new(Config::default(), None, Arc::new(FamilyAnalyzer::default())));
        let req = DetectFacesRequest {
            image: data_url(10),
            include_landmarks: false,
            include_attributes: true,
            max_faces: 10,
        };
        let err = detect_faces(State(state), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::ModelUnavailable));
    }

    #[tokio::test]
    async fn test_detect_faces_attributes() {
        let req = DetectFacesRequest {
            image: data_url(30),
            include_landmarks: false,
            include_attributes: false,
            max_faces: 10,
        };
        let Json(env) = detect_faces(State(state()), Ok(Json(req))).await.unwrap();
        assert_eq!(env.data.face_count, 1);
        let face = &env.data.faces[0];
        assert!(face.age.is_none());
        assert!(face.landmarks.is_none());
        assert!((face.quality_score - 3.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_detect_rejects_bad_image() {
        let req = DetectFacesRequest {
            image: "data:image/gif;base64,AAAA".into(),
            include_landmarks: false,
            include_attributes: true,
            max_faces: 10,
        };
        let err = detect_faces(State(state()), Ok(Json(req))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_extract_embedding_normalizes() {
        let req = ExtractEmbeddingRequest {
            image: data_url(20),
            face_id: 0,
            normalize: true,
        };
        let Json(env) = extract_embedding(State(state()), Ok(Json(req))).await.unwrap();
        let norm: f32 = env.data.embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_extract_embedding_face_id_out_of_range() {
        let req = ExtractEmbeddingRequest {
            image: data_url(20),
            face_id: 3,
            normalize: true,
        };
        let err = extract_embedding(State(state()), Ok(Json(req))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    fn batch_image(id: &str, key: u8) -> BatchImage {
        BatchImage {
            id: id.into(),
            image: data_url(key),
            name: None,
        }
    }

    #[tokio::test]
    async fn test_batch_skips_faceless_images() {
        let req = BatchAnalysisRequest {
            images: vec![batch_image("a", 10), batch_image("b", 0), batch_image("c", 12)],
            analysis_type: BatchMode::SimilarityMatrix,
            similarity_threshold: 0.6,
        };
        let Json(env) = batch_analysis(State(state()), Ok(Json(req))).await.unwrap();
        assert_eq!(env.data.analyzed_images, 2);
        assert_eq!(env.data.skipped_images, vec!["b".to_string()]);
        match env.data.outcome {
            BatchOutcome::SimilarityMatrix(m) => assert_eq!(m.image_ids, vec!["a", "c"]),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_rejects_duplicate_ids() {
        let req = BatchAnalysisRequest {
            images: vec![batch_image("a", 10), batch_image("a", 12)],
            analysis_type: BatchMode::GroupSimilar,
            similarity_threshold: 0.6,
        };
        let err = batch_analysis(State(state()), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_batch_needs_two_faces() {
        let req = BatchAnalysisRequest {
            images: vec![batch_image("a", 10), batch_image("b", 255)],
            analysis_type: BatchMode::FindBestMatch,
            similarity_threshold: 0.6,
        };
        let err = batch_analysis(State(state()), Ok(Json(req))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_family_uses_detected_ages_as_fallback() {
        let req = FamilyFacesRequest {
            parent_image: data_url(40),
            child_image: data_url(35),
            parent_age: None,
            child_age: Some(8),
        };
        let Json(env) = compare_family_faces(State(state()), Ok(Json(req))).await.unwrap();
        assert_eq!(env.data.parent_age_used, Some(40));
        assert_eq!(env.data.child_age_used, Some(8));
        assert_eq!(env.data.child_face.age, Some(35));
        let v = serde_json::to_value(&env.data).unwrap();
        assert!(v["family_similarity"].is_number());
    }

    #[tokio::test]
    async fn test_family_rejects_bad_age() {
        let req = FamilyFacesRequest {
            parent_image: data_url(40),
            child_image: data_url(35),
            parent_age: Some(130),
            child_age: None,
        };
        let err = compare_family_faces(State(state()), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_find_parent_candidate_count() {
        let req = FindParentRequest {
            child_image: data_url(10),
            parent_images: vec![data_url(12)],
            child_age: None,
            use_family_analysis: true,
        };
        let err = find_most_similar_parent(State(state()), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));

        let req = FindParentRequest {
            child_image: data_url(10),
            parent_images: vec![data_url(90), data_url(12), data_url(255)],
            child_age: None,
            use_family_analysis: false,
        };
        let Json(env) = find_most_similar_parent(State(state()), Ok(Json(req))).await.unwrap();
        assert_eq!(env.data.matches.len(), 3);
        assert_eq!(env.data.best_match.unwrap().image_index, 1);
    }
}
