//! Terminal outcomes of a pipeline pass.
//!
//! Every pass ends in exactly one of: `Ok(Outcome::Success)`,
//! `Ok(Outcome::Rejected)` (a business rule, not a fault), or
//! `Err(PipelineError)`. Component failures convert 1:1 and are never folded
//! into another outcome.

use crate::detector::{DetectorError, FaceCountError};
use crate::extractor::ExtractError;
use crate::matcher::MatchError;
use crate::preprocess::PreprocessError;
use crate::registry::RegistryError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image format: {0}")]
    InvalidImageFormat(#[from] PreprocessError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); submit an image with a single face")]
    MultipleFacesDetected(usize),
    #[error("face encoding extraction failed: {0}")]
    EncodingExtractionFailed(String),
    /// Unexpected fault. The message is for logs, not for callers.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn response_class(&self) -> ResponseClass {
        match self {
            PipelineError::Internal(_) => ResponseClass::ServerError,
            _ => ResponseClass::ClientError,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidImageFormat(_) => "InvalidImageFormat",
            PipelineError::NoFaceDetected => "NoFaceDetected",
            PipelineError::MultipleFacesDetected(_) => "MultipleFacesDetected",
            PipelineError::EncodingExtractionFailed(_) => "EncodingExtractionFailed",
            PipelineError::Internal(_) => "InternalFailure",
        }
    }

    /// Message safe to hand to a caller. Internal details are withheld.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => "internal failure".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<FaceCountError> for PipelineError {
    fn from(err: FaceCountError) -> Self {
        match err {
            FaceCountError::NoFace => PipelineError::NoFaceDetected,
            FaceCountError::Multiple(n) => PipelineError::MultipleFacesDetected(n),
        }
    }
}

impl From<DetectorError> for PipelineError {
    fn from(err: DetectorError) -> Self {
        PipelineError::Internal(format!("detector: {err}"))
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Unusable(msg) => PipelineError::EncodingExtractionFailed(msg),
            other => PipelineError::Internal(format!("extractor: {other}")),
        }
    }
}

impl From<MatchError> for PipelineError {
    fn from(err: MatchError) -> Self {
        PipelineError::Internal(format!("matcher: {err}"))
    }
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        PipelineError::Internal(format!("registry: {err}"))
    }
}

/// Why a well-formed request was turned down.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason")]
pub enum Rejection {
    /// Enrollment refused: the face already belongs to `identity`.
    DuplicateFace { identity: String, score: f32 },
    /// Verification found no identity within threshold.
    NoMatch,
}

impl Rejection {
    pub fn response_class(&self) -> ResponseClass {
        match self {
            Rejection::DuplicateFace { .. } => ResponseClass::ClientError,
            Rejection::NoMatch => ResponseClass::Unauthorized,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Rejection::DuplicateFace { .. } => "DuplicateFace",
            Rejection::NoMatch => "NoMatch",
        }
    }

    /// Message safe to hand to a caller; never names the matched identity.
    pub fn public_message(&self) -> &'static str {
        match self {
            Rejection::DuplicateFace { .. } => "this face is already registered",
            Rejection::NoMatch => "authentication failed: face not recognized",
        }
    }
}

/// Non-failure terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn response_class(&self) -> ResponseClass {
        match self {
            Outcome::Success(_) => ResponseClass::Success,
            Outcome::Rejected(r) => r.response_class(),
        }
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            Outcome::Rejected(_) => None,
        }
    }
}

/// Transport-neutral response category a boundary maps onto its own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseClass {
    Success,
    ClientError,
    Unauthorized,
    ServerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_count_maps_verbatim() {
        assert!(matches!(
            PipelineError::from(FaceCountError::NoFace),
            PipelineError::NoFaceDetected
        ));
        assert!(matches!(
            PipelineError::from(FaceCountError::Multiple(3)),
            PipelineError::MultipleFacesDetected(3)
        ));
    }

    #[test]
    fn test_extract_errors_split_by_cause() {
        let unusable = PipelineError::from(ExtractError::Unusable("occluded".into()));
        assert!(matches!(unusable, PipelineError::EncodingExtractionFailed(_)));
        assert_eq!(unusable.response_class(), ResponseClass::ClientError);

        let dim = PipelineError::from(ExtractError::Dimension { expected: 512, actual: 3 });
        assert!(matches!(dim, PipelineError::Internal(_)));
        assert_eq!(dim.response_class(), ResponseClass::ServerError);
    }

    #[test]
    fn test_internal_message_is_opaque() {
        let err = PipelineError::Internal("sqlite: disk I/O error at /var/lib".into());
        assert_eq!(err.public_message(), "internal failure");
        assert_eq!(err.code(), "InternalFailure");
    }

    #[test]
    fn test_rejection_classes() {
        let dup = Rejection::DuplicateFace { identity: "x".into(), score: 0.1 };
        assert_eq!(dup.response_class(), ResponseClass::ClientError);
        assert!(!dup.public_message().contains('x'));
        assert_eq!(Rejection::NoMatch.response_class(), ResponseClass::Unauthorized);
        let outcome: Outcome<()> = Outcome::Success(());
        assert_eq!(outcome.response_class(), ResponseClass::Success);
    }
}
