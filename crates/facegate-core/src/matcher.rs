//! Best-match search of a probe embedding against the identity registry.

use crate::profile::{EmbeddingProfile, Metric};
use crate::types::{Backend, Embedding, IdentityRecord};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error(
        "identity {identity} holds a {stored_backend}/{stored_len} embedding, \
         probe is {probe_backend}/{probe_len}"
    )]
    Incompatible {
        identity: String,
        probe_backend: Backend,
        probe_len: usize,
        stored_backend: Backend,
        stored_len: usize,
    },
}

/// Best gallery entry within threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub identity: String,
    /// Distance for [`Metric::Euclidean`], similarity for [`Metric::Cosine`].
    pub score: f32,
    pub metric: Metric,
    /// Position of the matched record in the gallery.
    #[serde(skip)]
    pub index: usize,
}

/// Threshold matcher over a linear gallery scan.
///
/// Every gallery entry is scored, with no early exit, so timing does not
/// reveal where in the registry a match sits. Equal scores keep the earlier
/// entry.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    profile: EmbeddingProfile,
}

impl SimilarityMatcher {
    pub fn new(profile: EmbeddingProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &EmbeddingProfile {
        &self.profile
    }

    pub fn metric(&self) -> Metric {
        self.profile.metric()
    }

    pub fn threshold(&self) -> f32 {
        self.profile.threshold()
    }

    /// Return the single best identity within threshold, or `None`.
    pub fn best_match(
        &self,
        probe: &Embedding,
        gallery: &[IdentityRecord],
    ) -> Result<Option<Match>, MatchError> {
        let metric = self.profile.metric();
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            if !probe.is_comparable(&record.embedding) {
                return Err(MatchError::Incompatible {
                    identity: record.id.clone(),
                    probe_backend: probe.backend,
                    probe_len: probe.len(),
                    stored_backend: record.embedding.backend,
                    stored_len: record.embedding.len(),
                });
            }

            let score = metric.score(probe, &record.embedding);
            tracing::trace!(identity = %record.id, score, "scored gallery entry");

            let is_better = match best {
                None => !score.is_nan(),
                Some((_, current)) => metric.is_better(score, current),
            };
            if is_better {
                best = Some((i, score));
            }
        }

        let result = match best {
            Some((idx, score)) if metric.within(score, self.profile.threshold()) => Some(Match {
                identity: gallery[idx].id.clone(),
                score,
                metric,
                index: idx,
            }),
            _ => None,
        };

        tracing::debug!(
            gallery = gallery.len(),
            best_score = best.map(|(_, s)| s),
            threshold = self.profile.threshold(),
            %metric,
            matched = result.is_some(),
            "match decision"
        );

        Ok(result)
    }
}
