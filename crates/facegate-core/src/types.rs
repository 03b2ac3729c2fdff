use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Detected face region, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Eyes, nose tip, mouth corners (left before right), in image pixels.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    /// Integer pixel rectangle `(left, top, width, height)` clamped to an image
    /// of the given size. Width or height may be zero when the region lies
    /// outside the image.
    pub fn clamped_rect(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_finite() {
                v.round().clamp(0.0, max as f32) as u32
            } else {
                0
            }
        };
        let left = clamp(self.x, image_width);
        let top = clamp(self.y, image_height);
        let right = clamp(self.x + self.width, image_width);
        let bottom = clamp(self.y + self.height, image_height);
        (
            left,
            top,
            right.saturating_sub(left),
            bottom.saturating_sub(top),
        )
    }
}

/// Extraction backend that produced an embedding.
///
/// Embeddings from different backends live in different spaces and are never
/// compared against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Landmark-aligned 112×112 crop, 128-dimensional, unnormalized output.
    Landmark,
    /// Tight 160×160 whitened crop, 512-dimensional, L2-normalized output.
    CanonicalCrop,
}

impl Backend {
    pub fn dimension(self) -> usize {
        match self {
            Backend::Landmark => 128,
            Backend::CanonicalCrop => 512,
        }
    }

    /// Whether every valid embedding of this backend has unit Euclidean norm.
    pub fn unit_normalized(self) -> bool {
        matches!(self, Backend::CanonicalCrop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Landmark => "landmark",
            Backend::CanonicalCrop => "canonical-crop",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "landmark" => Ok(Backend::Landmark),
            "canonical-crop" | "canonical" | "facenet" => Ok(Backend::CanonicalCrop),
            other => Err(format!(
                "unknown backend {other:?} (expected \"canonical-crop\" or \"landmark\")"
            )),
        }
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub backend: Backend,
}

impl Embedding {
    pub fn new(values: Vec<f32>, backend: Backend) -> Self {
        Self { values, backend }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Whether `other` lives in the same embedding space (backend and length).
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        self.backend == other.backend && self.values.len() == other.values.len()
    }

    /// Cosine of the angle between the two vectors, in [-1, 1].
    /// Zero when either vector has no length. Every component is visited.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, self_sq, other_sq) = self
            .values
            .iter()
            .zip(&other.values)
            .fold((0.0f32, 0.0f32, 0.0f32), |(d, s, o), (a, b)| {
                (d + a * b, s + a * a, o + b * b)
            });

        let scale = (self_sq * other_sq).sqrt();
        if scale > 0.0 {
            dot / scale
        } else {
            0.0
        }
    }

    /// Straight-line distance between the two vectors.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| {
                let d = a - b;
                d * d
            })
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian f32 encoding used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` when the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8], backend: Backend) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values, backend })
    }
}

/// A stored identity: a stable id plus exactly one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub embedding: Embedding,
    pub created_at: String,
    pub updated_at: String,
}
