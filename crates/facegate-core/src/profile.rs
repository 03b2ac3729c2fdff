//! Backend, metric and threshold, validated together.
//!
//! A Euclidean threshold tuned for unit vectors means nothing for raw
//! landmark-encoder output, so the three values only travel as one unit.

use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default Euclidean threshold for L2-normalized 512-d vectors (range 0.0–2.0).
pub const DEFAULT_CANONICAL_THRESHOLD: f32 = 1.0;
/// Default Euclidean threshold for 128-d landmark-encoder vectors.
pub const DEFAULT_LANDMARK_THRESHOLD: f32 = 0.6;
/// Default cosine similarity threshold for landmark-encoder vectors.
pub const DEFAULT_LANDMARK_COSINE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    #[error("metric {metric} is not admissible for backend {backend}")]
    MetricNotAllowed { backend: Backend, metric: Metric },
    #[error("threshold {threshold} out of range for {metric} ({range})")]
    ThresholdOutOfRange {
        metric: Metric,
        threshold: f32,
        range: &'static str,
    },
}

/// Distance or similarity measure used to compare embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// L2 distance. Smaller is more similar; match iff `distance <= threshold`.
    Euclidean,
    /// Cosine similarity. Larger is more similar; match iff `similarity >= threshold`.
    Cosine,
}

impl Metric {
    pub fn score(self, probe: &crate::Embedding, stored: &crate::Embedding) -> f32 {
        match self {
            Metric::Euclidean => probe.euclidean_distance(stored),
            Metric::Cosine => probe.similarity(stored),
        }
    }

    /// Strictly better: equal scores are never better, NaN is never better.
    pub fn is_better(self, candidate: f32, current: f32) -> bool {
        match self {
            Metric::Euclidean => candidate < current,
            Metric::Cosine => candidate > current,
        }
    }

    /// Inclusive threshold rule for both metrics.
    pub fn within(self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::Euclidean => score <= threshold,
            Metric::Cosine => score >= threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!(
                "unknown metric {other:?} (expected \"euclidean\" or \"cosine\")"
            )),
        }
    }
}

/// Process-wide (backend, metric, threshold) triple. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmbeddingProfile {
    backend: Backend,
    metric: Metric,
    threshold: f32,
}

impl EmbeddingProfile {
    pub fn new(backend: Backend, metric: Metric, threshold: f32) -> Result<Self, ProfileError> {
        if backend == Backend::CanonicalCrop && metric != Metric::Euclidean {
            return Err(ProfileError::MetricNotAllowed { backend, metric });
        }

        let valid = match metric {
            Metric::Euclidean if backend.unit_normalized() => {
                threshold > 0.0 && threshold <= 2.0
            }
            Metric::Euclidean => threshold > 0.0 && threshold.is_finite(),
            Metric::Cosine => (-1.0..=1.0).contains(&threshold),
        };
        if !valid {
            let range = match metric {
                Metric::Euclidean if backend.unit_normalized() => "(0, 2]",
                Metric::Euclidean => "(0, inf)",
                Metric::Cosine => "[-1, 1]",
            };
            return Err(ProfileError::ThresholdOutOfRange {
                metric,
                threshold,
                range,
            });
        }

        Ok(Self {
            backend,
            metric,
            threshold,
        })
    }

    /// Profile with the default metric and threshold for `backend`.
    pub fn default_for(backend: Backend) -> Self {
        match backend {
            Backend::CanonicalCrop => Self {
                backend,
                metric: Metric::Euclidean,
                threshold: DEFAULT_CANONICAL_THRESHOLD,
            },
            Backend::Landmark => Self {
                backend,
                metric: Metric::Euclidean,
                threshold: DEFAULT_LANDMARK_THRESHOLD,
            },
        }
    }

    /// Default threshold for a (backend, metric) pair.
    pub fn default_threshold(backend: Backend, metric: Metric) -> f32 {
        match (backend, metric) {
            (Backend::CanonicalCrop, _) => DEFAULT_CANONICAL_THRESHOLD,
            (Backend::Landmark, Metric::Euclidean) => DEFAULT_LANDMARK_THRESHOLD,
            (Backend::Landmark, Metric::Cosine) => DEFAULT_LANDMARK_COSINE_THRESHOLD,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_crop_rejects_cosine() {
        let err = EmbeddingProfile::new(Backend::CanonicalCrop, Metric::Cosine, 0.5).unwrap_err();
        assert!(matches!(err, ProfileError::MetricNotAllowed { .. }));
    }

    #[test]
    fn test_unit_norm_threshold_range() {
        assert!(EmbeddingProfile::new(Backend::CanonicalCrop, Metric::Euclidean, 2.0).is_ok());
        assert!(EmbeddingProfile::new(Backend::CanonicalCrop, Metric::Euclidean, 2.5).is_err());
        assert!(EmbeddingProfile::new(Backend::CanonicalCrop, Metric::Euclidean, 0.0).is_err());
        // Unnormalized vectors have no upper bound.
        assert!(EmbeddingProfile::new(Backend::Landmark, Metric::Euclidean, 7.0).is_ok());
    }

    #[test]
    fn test_cosine_threshold_range() {
        assert!(EmbeddingProfile::new(Backend::Landmark, Metric::Cosine, -1.0).is_ok());
        assert!(EmbeddingProfile::new(Backend::Landmark, Metric::Cosine, 1.01).is_err());
        assert!(EmbeddingProfile::new(Backend::Landmark, Metric::Cosine, f32::NAN).is_err());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(Metric::Euclidean.within(1.0, 1.0));
        assert!(!Metric::Euclidean.within(1.0001, 1.0));
        assert!(Metric::Cosine.within(0.5, 0.5));
        assert!(!Metric::Cosine.within(0.4999, 0.5));
    }

    #[test]
    fn test_is_better_is_strict() {
        assert!(!Metric::Euclidean.is_better(0.3, 0.3));
        assert!(Metric::Euclidean.is_better(0.2, 0.3));
        assert!(!Metric::Cosine.is_better(0.3, 0.3));
        assert!(Metric::Cosine.is_better(0.4, 0.3));
        assert!(!Metric::Euclidean.is_better(f32::NAN, 0.3));
    }

    #[test]
    fn test_defaults() {
        let p = EmbeddingProfile::default_for(Backend::CanonicalCrop);
        assert_eq!(p.metric(), Metric::Euclidean);
        assert_eq!(p.threshold(), 1.0);
        assert_eq!(
            EmbeddingProfile::default_threshold(Backend::Landmark, Metric::Cosine),
            DEFAULT_LANDMARK_COSINE_THRESHOLD
        );
    }
}
