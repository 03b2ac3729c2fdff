use facegate_core::{
    Enrolled, IdentityRecord, IdentityRegistry, Outcome, Pipeline, PipelineError, RegistryError,
    ScrfdDetector, Verified,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] facegate_core::detector::DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] facegate_core::extractor::ExtractError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Outcome<Enrolled>, PipelineError>>,
    },
    Verify {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Outcome<Verified>, PipelineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<IdentityRecord>, RegistryError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<bool, RegistryError>>,
    },
    Count {
        reply: oneshot::Sender<Result<usize, RegistryError>>,
    },
}

impl EngineRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::Enroll { .. } => "enroll",
            Self::Verify { .. } => "verify",
            Self::List { .. } => "list",
            Self::Remove { .. } => "remove",
            Self::Count { .. } => "count",
        }
    }

    /// The caller stopped waiting, usually because its request timed out.
    fn abandoned(&self) -> bool {
        match self {
            Self::Enroll { reply, .. } => reply.is_closed(),
            Self::Verify { reply, .. } => reply.is_closed(),
            Self::List { reply } => reply.is_closed(),
            Self::Remove { reply, .. } => reply.is_closed(),
            Self::Count { reply } => reply.is_closed(),
        }
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T, E>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, E>>) -> EngineRequest,
    ) -> Result<T, EngineError>
    where
        EngineError: From<E>,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Enroll the single face in `image` unless it is already registered.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<Outcome<Enrolled>, EngineError> {
        self.call(|reply| EngineRequest::Enroll { image, reply }).await
    }

    /// Identify the single face in `image` against the registry.
    pub async fn verify(&self, image: Vec<u8>) -> Result<Outcome<Verified>, EngineError> {
        self.call(|reply| EngineRequest::Verify { image, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<IdentityRecord>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn remove(&self, id: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Remove { id, reply }).await
    }

    pub async fn count(&self) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Count { reply }).await
    }
}

/// Load the detector and the configured embedding backend.
///
/// Fails fast when a model file is missing or does not produce the
/// expected output shape.
pub fn load_pipeline(config: &Config) -> Result<Pipeline, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path, config.detector_confidence)?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let embedding_path = config.embedding_model_path();
    let extractor =
        facegate_core::extractor::load_extractor(config.profile.backend(), &embedding_path)?;
    tracing::info!(
        path = %embedding_path,
        backend = %config.profile.backend(),
        "embedding model loaded"
    );

    Ok(Pipeline::new(
        Box::new(detector),
        extractor,
        config.profile,
        config.pipeline,
    )?)
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and the registry and serves one request at
/// a time; ONNX sessions need exclusive access to run.
pub fn spawn_engine<R>(mut pipeline: Pipeline, registry: R) -> Result<EngineHandle, EngineError>
where
    R: IdentityRegistry + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.abandoned() {
                    tracing::warn!(request = req.kind(), "caller gone, request dropped");
                    continue;
                }
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let result = pipeline.enroll(&image, &registry);
                        // An identity nobody was told about must not stay enrolled.
                        if let Err(Ok(Outcome::Success(enrolled))) = reply.send(result) {
                            tracing::warn!(
                                identity = %enrolled.identity,
                                "enroll reply undeliverable, rolling back"
                            );
                            if let Err(e) = registry.remove(&enrolled.identity) {
                                tracing::error!(
                                    identity = %enrolled.identity,
                                    error = %e,
                                    "rollback failed"
                                );
                            }
                        }
                    }
                    EngineRequest::Verify { image, reply } => {
                        let _ = reply.send(pipeline.verify(&image, &registry));
                    }
                    EngineRequest::List { reply } => {
                        let _ = reply.send(registry.list_all());
                    }
                    EngineRequest::Remove { id, reply } => {
                        let _ = reply.send(registry.remove(&id));
                    }
                    EngineRequest::Count { reply } => {
                        let _ = reply.send(registry.count());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
