//! kinface-core: face analysis and family-similarity engine.
//!
//! SCRFD detection, ArcFace embeddings and genderage attributes run via ONNX
//! Runtime behind the [`EmbeddingProvider`] trait. The scoring modules work on
//! the resulting [`FaceRecord`]s and never touch the models directly.

pub mod alignment;
pub mod attributes;
pub mod batch;
pub mod compare;
pub mod detector;
pub mod error;
pub mod family;
pub mod geometry;
pub mod parent;
pub mod provider;
pub mod recognizer;
pub mod similarity;
pub mod types;

pub use batch::{BatchMode, BatchOutcome};
pub use compare::{compare, ComparisonResult, FaceSummary};
pub use error::AnalysisError;
pub use family::{FamilyAnalyzer, FamilySimilarityResult, FeatureWeights, SimilarityLevel};
pub use geometry::{FacialFeature, JitterMode};
pub use parent::{ParentSearchResult, ParentSelector};
pub use provider::{EmbeddingProvider, ModelPaths, OnnxFaceProvider, ProviderError};
pub use types::{BoundingBox, Embedding, FaceRecord, Gender, GenderValue, Point};
