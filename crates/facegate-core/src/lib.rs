//! facegate-core: Face enrollment and verification engine.
//!
//! Decodes uploaded images, detects faces with SCRFD, extracts embeddings
//! with one of two ONNX backends, and matches them against an identity
//! registry.

pub mod alignment;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod profile;
pub mod registry;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use error::{Outcome, PipelineError, Rejection, ResponseClass};
pub use extractor::{CanonicalCropEncoder, EmbeddingExtractor, EmbeddingNetwork, LandmarkEncoder};
pub use matcher::{Match, SimilarityMatcher};
pub use pipeline::{Enrolled, Pipeline, PipelineOptions, Verified};
pub use profile::{EmbeddingProfile, Metric};
pub use registry::{IdentityRegistry, InsertOutcome, MemoryRegistry, RegistryError};
pub use types::{Backend, Embedding, FaceRegion, IdentityRecord};

use std::path::PathBuf;

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// 512-d canonical crop embedding model file name.
pub const CANONICAL_MODEL_FILE: &str = "facenet512.onnx";
/// 128-d landmark encoder model file name.
pub const LANDMARK_MODEL_FILE: &str = "face_recognition_128.onnx";

/// Embedding model file name for a backend.
pub fn model_file(backend: Backend) -> &'static str {
    match backend {
        Backend::CanonicalCrop => CANONICAL_MODEL_FILE,
        Backend::Landmark => LANDMARK_MODEL_FILE,
    }
}

/// Default directory searched for ONNX models.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}
