//! Enroll and verify orchestration.
//!
//! Each call is one linear pass: decode, detect, gate on exactly one face,
//! extract, then consult the registry. Nothing is retained between calls.

use crate::detector::{self, FaceDetector};
use crate::error::{Outcome, PipelineError, Rejection};
use crate::extractor::EmbeddingExtractor;
use crate::matcher::SimilarityMatcher;
use crate::preprocess;
use crate::profile::{EmbeddingProfile, Metric};
use crate::registry::{IdentityRegistry, InsertOutcome};
use crate::types::Embedding;
use serde::Serialize;

/// Successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrolled {
    pub identity: String,
    pub embedding: Embedding,
}

/// Successful verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verified {
    pub identity: String,
    /// Distance for Euclidean profiles, similarity for cosine profiles.
    pub score: f32,
    pub metric: Metric,
    /// Stored embedding, or the probe when the record was refreshed.
    pub embedding: Embedding,
    pub refreshed: bool,
}

/// Pipeline behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Overwrite a verified identity's embedding with the probe. Each
    /// refresh moves the stored vector, so later matches see a different
    /// reference than the one enrolled.
    pub refresh_on_verify: bool,
}

pub struct Pipeline {
    detector: Box<dyn FaceDetector + Send>,
    extractor: Box<dyn EmbeddingExtractor + Send>,
    matcher: SimilarityMatcher,
    options: PipelineOptions,
}

impl Pipeline {
    /// Assemble a pipeline. Fails when the extractor's backend differs from
    /// the profile's.
    pub fn new(
        detector: Box<dyn FaceDetector + Send>,
        extractor: Box<dyn EmbeddingExtractor + Send>,
        profile: EmbeddingProfile,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        if extractor.backend() != profile.backend() {
            return Err(PipelineError::Internal(format!(
                "extractor backend {} does not match profile backend {}",
                extractor.backend(),
                profile.backend()
            )));
        }

        Ok(Self {
            detector,
            extractor,
            matcher: SimilarityMatcher::new(profile),
            options,
        })
    }

    pub fn profile(&self) -> &EmbeddingProfile {
        self.matcher.profile()
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Decode, detect, gate and extract.
    pub fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, PipelineError> {
        let image = preprocess::decode_image(image_bytes)?;
        let regions = self.detector.detect(&image)?;
        let face = detector::single_face(regions)?;
        tracing::debug!(
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            confidence = face.confidence,
            "single face accepted"
        );
        Ok(self.extractor.extract(&image, &face)?)
    }

    /// Enroll a new identity unless the face already matches one.
    pub fn enroll<R>(
        &mut self,
        image_bytes: &[u8],
        registry: &R,
    ) -> Result<Outcome<Enrolled>, PipelineError>
    where
        R: IdentityRegistry + ?Sized,
    {
        let embedding = self.extract(image_bytes)?;
        let id = uuid::Uuid::new_v4().to_string();

        match registry.insert_if_absent(&id, &embedding, &self.matcher)? {
            InsertOutcome::Inserted(record) => {
                tracing::info!(identity = %record.id, "enrolled new identity");
                Ok(Outcome::Success(Enrolled {
                    identity: record.id,
                    embedding: record.embedding,
                }))
            }
            InsertOutcome::Duplicate(m) => {
                tracing::info!(
                    identity = %m.identity,
                    score = m.score,
                    "enrollment rejected: face already registered"
                );
                Ok(Outcome::Rejected(Rejection::DuplicateFace {
                    identity: m.identity,
                    score: m.score,
                }))
            }
        }
    }

    /// Identify the best-matching enrolled identity.
    pub fn verify<R>(
        &mut self,
        image_bytes: &[u8],
        registry: &R,
    ) -> Result<Outcome<Verified>, PipelineError>
    where
        R: IdentityRegistry + ?Sized,
    {
        let probe = self.extract(image_bytes)?;
        let gallery = registry.list_all()?;

        let Some(m) = self.matcher.best_match(&probe, &gallery)? else {
            tracing::info!(gallery = gallery.len(), "verification rejected: no match");
            return Ok(Outcome::Rejected(Rejection::NoMatch));
        };

        let (embedding, refreshed) = if self.options.refresh_on_verify {
            registry.update_embedding(&m.identity, &probe)?;
            tracing::info!(identity = %m.identity, "stored embedding refreshed from probe");
            (probe, true)
        } else {
            (gallery[m.index].embedding.clone(), false)
        };

        tracing::info!(identity = %m.identity, score = m.score, metric = %m.metric, "verified");
        Ok(Outcome::Success(Verified {
            identity: m.identity,
            score: m.score,
            metric: m.metric,
            embedding,
            refreshed,
        }))
    }
}
