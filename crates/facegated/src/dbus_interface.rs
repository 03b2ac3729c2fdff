use std::time::Duration;

use facegate_core::{EmbeddingProfile, Enrolled, Outcome, ResponseClass, Verified};
use serde::Serialize;
use zbus::{fdo, interface};

use crate::engine::{EngineError, EngineHandle};

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Registry1
/// Object path: /org/facegate/Registry1
pub struct RegistryService {
    engine: EngineHandle,
    profile: EmbeddingProfile,
    return_embedding: bool,
    request_timeout: Duration,
}

impl RegistryService {
    pub fn new(
        engine: EngineHandle,
        profile: EmbeddingProfile,
        return_embedding: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            profile,
            return_embedding,
            request_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.request_timeout)),
        }
    }
}

#[derive(Serialize)]
struct EnrollReply {
    identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct VerifyReply {
    identity: String,
    score: f32,
    metric: &'static str,
    refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: &'a str,
    backend: &'static str,
    dimension: usize,
    created_at: &'a str,
    updated_at: &'a str,
}

#[interface(name = "org.facegate.Registry1")]
impl RegistryService {
    /// Enroll the single face in an encoded image. Returns the new identity as JSON.
    async fn enroll(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "enroll requested");
        let result = self.bounded(self.engine.enroll(image)).await;
        let return_embedding = self.return_embedding;
        respond("enroll", result, |e: Enrolled| EnrollReply {
            identity: e.identity,
            embedding: return_embedding.then_some(e.embedding.values),
        })
    }

    /// Identify the single face in an encoded image. Returns the match as JSON.
    async fn verify(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "verify requested");
        let result = self.bounded(self.engine.verify(image)).await;
        let return_embedding = self.return_embedding;
        respond("verify", result, |v: Verified| VerifyReply {
            identity: v.identity,
            score: v.score,
            metric: v.metric.as_str(),
            refreshed: v.refreshed,
            embedding: return_embedding.then_some(v.embedding.values),
        })
    }

    /// List enrolled identities (ids and timestamps, never embeddings).
    async fn list_identities(&self) -> fdo::Result<String> {
        let records = self
            .bounded(self.engine.list())
            .await
            .map_err(|e| internal("list", &e))?;
        let summaries: Vec<IdentitySummary<'_>> = records
            .iter()
            .map(|r| IdentitySummary {
                id: &r.id,
                backend: r.embedding.backend.as_str(),
                dimension: r.embedding.len(),
                created_at: &r.created_at,
                updated_at: &r.updated_at,
            })
            .collect();
        to_json("list", &summaries)
    }

    /// Remove an identity by id. Returns whether it existed.
    async fn remove_identity(&self, id: &str) -> fdo::Result<bool> {
        tracing::info!(identity = id, "remove requested");
        self.bounded(self.engine.remove(id.to_string()))
            .await
            .map_err(|e| internal("remove", &e))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let identities = self
            .bounded(self.engine.count())
            .await
            .map_err(|e| internal("status", &e))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": self.profile.backend().as_str(),
            "metric": self.profile.metric().as_str(),
            "threshold": self.profile.threshold(),
            "identities": identities,
        })
        .to_string())
    }
}

/// Map an engine result onto a D-Bus reply by response class.
fn respond<T, R: Serialize>(
    op: &'static str,
    result: Result<Outcome<T>, EngineError>,
    payload: impl FnOnce(T) -> R,
) -> fdo::Result<String> {
    match result {
        Ok(Outcome::Success(value)) => to_json(op, &payload(value)),
        Ok(Outcome::Rejected(rejection)) => {
            let message = format!("{}: {}", rejection.code(), rejection.public_message());
            tracing::info!(op, code = rejection.code(), "request rejected");
            match rejection.response_class() {
                ResponseClass::Unauthorized => Err(fdo::Error::AccessDenied(message)),
                _ => Err(fdo::Error::InvalidArgs(message)),
            }
        }
        Err(EngineError::Pipeline(err)) if err.response_class() == ResponseClass::ClientError => {
            tracing::info!(op, code = err.code(), "request refused");
            Err(fdo::Error::InvalidArgs(format!(
                "{}: {}",
                err.code(),
                err.public_message()
            )))
        }
        Err(err) => Err(internal(op, &err)),
    }
}

/// Log the full error and hand the caller an opaque failure.
fn internal(op: &'static str, err: &EngineError) -> fdo::Error {
    tracing::error!(op, error = %err, "request failed");
    fdo::Error::Failed("InternalFailure: internal failure".into())
}

fn to_json<T: Serialize + ?Sized>(op: &'static str, value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!(op, error = %e, "reply serialization failed");
        fdo::Error::Failed("InternalFailure: internal failure".into())
    })
}
