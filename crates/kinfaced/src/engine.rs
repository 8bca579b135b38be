use image::RgbImage;
use kinface_core::{
    EmbeddingProvider, FaceRecord, FamilyAnalyzer, ParentSearchResult, ParentSelector, ProviderError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests the engine queue holds before senders wait.
const ENGINE_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: RgbImage,
        reply: oneshot::Sender<Result<Vec<FaceRecord>, ProviderError>>,
    },
    DetectMany {
        images: Vec<RgbImage>,
        reply: oneshot::Sender<Vec<Result<Vec<FaceRecord>, ProviderError>>>,
    },
    FindParent {
        child: RgbImage,
        parents: Vec<RgbImage>,
        child_age: Option<u32>,
        use_family_analysis: bool,
        reply: oneshot::Sender<ParentSearchResult>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    model_version: Arc<str>,
}

impl EngineHandle {
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Detect and embed every face in one image.
    pub async fn detect(&self, image: RgbImage) -> Result<Vec<FaceRecord>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Detect { image, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Detect faces in several images in one round-trip. Failures stay per image.
    pub async fn detect_many(
        &self,
        images: Vec<RgbImage>,
    ) -> Result<Vec<Result<Vec<FaceRecord>, ProviderError>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::DetectMany { images, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Rank candidate parents for a child on the engine thread.
    pub async fn find_most_similar_parent(
        &self,
        child: RgbImage,
        parents: Vec<RgbImage>,
        child_age: Option<u32>,
        use_family_analysis: bool,
    ) -> Result<ParentSearchResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::FindParent {
            child,
            parents,
            child_age,
            use_family_analysis,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread that owns `provider`.
///
/// ONNX sessions need `&mut` access, so every inference is serialized through
/// the request queue.
pub fn spawn_engine<P>(mut provider: P, analyzer: Arc<FamilyAnalyzer>) -> Result<EngineHandle, EngineError>
where
    P: EmbeddingProvider + Send + 'static,
{
    let model_version: Arc<str> = Arc::from(provider.model_version());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("kinface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        let result = provider.detect(&image);
                        if let Err(e) = &result {
                            tracing::error!(error = %e, "face detection failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::DetectMany { images, reply } => {
                        let results = images.iter().map(|image| provider.detect(image)).collect();
                        let _ = reply.send(results);
                    }
                    EngineRequest::FindParent {
                        child,
                        parents,
                        child_age,
                        use_family_analysis,
                        reply,
                    } => {
                        let result = ParentSelector::new(&analyzer).find_most_similar_parent(
                            &mut provider,
                            &child,
                            &parents,
                            child_age,
                            use_family_analysis,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, model_version })
}
