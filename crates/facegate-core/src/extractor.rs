//! Face embedding extraction.
//!
//! Two interchangeable backends, selected once per process:
//!
//! * [`LandmarkEncoder`]: five-point alignment to a 112×112 template, 128-d
//!   output used as-is.
//! * [`CanonicalCropEncoder`]: tight crop, 160×160 resize, whitening with the
//!   crop's own statistics, 512-d output projected onto the unit sphere. This is
//!   the pipeline independently built mobile clients reproduce, so every step
//!   is fixed.
//!
//! Both are deterministic: the same region always yields the same bits.

use crate::alignment;
use crate::types::{Backend, Embedding, FaceRegion};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_MEAN: f32 = 127.5;
const LANDMARK_STD: f32 = 127.5;

const CANONICAL_INPUT_SIZE: u32 = 160;
/// Smallest crop side accepted before resizing.
const MIN_CROP_SIDE: u32 = 2;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The region cannot yield a usable vector (bad geometry, missing
    /// landmarks, degenerate output). The caller should resubmit.
    #[error("unusable face region: {0}")]
    Unusable(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Fixed-size embedding model: one input tensor in, one flat vector out.
pub trait EmbeddingNetwork {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractError>;
}

/// ONNX Runtime session wrapper for embedding models.
pub struct OnnxNetwork {
    session: Session,
}

impl OnnxNetwork {
    pub fn load(model_path: &str) -> Result<Self, ExtractError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }
}

impl EmbeddingNetwork for OnnxNetwork {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding output: {e}")))?;
        Ok(raw.to_vec())
    }
}

/// Maps one detected face to an embedding.
pub trait EmbeddingExtractor {
    fn backend(&self) -> Backend;

    fn extract(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Embedding, ExtractError>;
}

/// Landmark-aligned 128-d encoder. No post-normalization.
pub struct LandmarkEncoder<N> {
    network: N,
}

impl<N: EmbeddingNetwork> LandmarkEncoder<N> {
    pub fn new(network: N) -> Self {
        Self { network }
    }

    /// 112×112 aligned RGB crop into an NCHW tensor in [-1, 1].
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let (w, h) = aligned.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - LANDMARK_MEAN) / LANDMARK_STD;
            }
        }
        tensor
    }
}

impl<N: EmbeddingNetwork> EmbeddingExtractor for LandmarkEncoder<N> {
    fn backend(&self) -> Backend {
        Backend::Landmark
    }

    fn extract(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Embedding, ExtractError> {
        let landmarks = face
            .landmarks
            .as_ref()
            .ok_or_else(|| ExtractError::Unusable("face has no landmarks".into()))?;

        let aligned = alignment::align_face(image, landmarks).ok_or_else(|| {
            ExtractError::Unusable("landmarks do not determine an alignment".into())
        })?;

        let raw = self.network.infer(&Self::preprocess(&aligned))?;
        let values = check_output(raw, Backend::Landmark)?;
        if values.iter().all(|v| *v == 0.0) {
            return Err(ExtractError::Unusable("model produced a zero vector".into()));
        }

        Ok(Embedding::new(values, Backend::Landmark))
    }
}

/// Tight-crop, whitened, L2-normalized 512-d encoder.
pub struct CanonicalCropEncoder<N> {
    network: N,
}

impl<N: EmbeddingNetwork> CanonicalCropEncoder<N> {
    pub fn new(network: N) -> Self {
        Self { network }
    }

    /// Crop `face` out of `image` and resize to 160×160 (bilinear).
    pub fn crop(image: &RgbImage, face: &FaceRegion) -> Result<RgbImage, ExtractError> {
        let (left, top, width, height) = face.clamped_rect(image.width(), image.height());
        if width < MIN_CROP_SIDE || height < MIN_CROP_SIDE {
            return Err(ExtractError::Unusable(format!(
                "face crop is {width}x{height} after clamping to the image"
            )));
        }

        let cropped = image::imageops::crop_imm(image, left, top, width, height).to_image();
        Ok(alignment::resize_bilinear(
            &cropped,
            CANONICAL_INPUT_SIZE,
            CANONICAL_INPUT_SIZE,
        ))
    }
}

/// Whiten a crop into an NHWC `[1, H, W, 3]` tensor: `(p - mean) / std`.
///
/// Mean and population standard deviation span every pixel and channel;
/// the deviation is floored at `1 / sqrt(element_count)` so flat crops do not
/// divide by zero.
pub fn whiten(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = crop.dimensions();
    let raw = crop.as_raw();
    let n = raw.len() as f64;

    let mean = raw.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = raw.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt().max(1.0 / n.sqrt());

    let (mean, std) = (mean as f32, std as f32);
    let mut tensor = Array4::<f32>::zeros((1, h as usize, w as usize, 3));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Divide by the Euclidean norm. `None` for a zero or non-finite norm.
pub fn l2_normalize(values: &[f32]) -> Option<Vec<f32>> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(values.iter().map(|x| x / norm).collect())
    } else {
        None
    }
}

impl<N: EmbeddingNetwork> EmbeddingExtractor for CanonicalCropEncoder<N> {
    fn backend(&self) -> Backend {
        Backend::CanonicalCrop
    }

    fn extract(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Embedding, ExtractError> {
        let crop = Self::crop(image, face)?;
        let raw = self.network.infer(&whiten(&crop))?;
        let raw = check_output(raw, Backend::CanonicalCrop)?;

        let values = l2_normalize(&raw)
            .ok_or_else(|| ExtractError::Unusable("embedding has zero norm".into()))?;

        Ok(Embedding::new(values, Backend::CanonicalCrop))
    }
}

/// Load the ONNX model for `backend` and wrap it in its extractor.
pub fn load_extractor(
    backend: Backend,
    model_path: &str,
) -> Result<Box<dyn EmbeddingExtractor + Send>, ExtractError> {
    let network = OnnxNetwork::load(model_path)?;
    tracing::info!(%backend, dimension = backend.dimension(), "embedding backend selected");
    Ok(match backend {
        Backend::Landmark => Box::new(LandmarkEncoder::new(network)),
        Backend::CanonicalCrop => Box::new(CanonicalCropEncoder::new(network)),
    })
}

/// Dimension and finiteness checks shared by both backends.
fn check_output(raw: Vec<f32>, backend: Backend) -> Result<Vec<f32>, ExtractError> {
    if raw.len() != backend.dimension() {
        return Err(ExtractError::Dimension {
            expected: backend.dimension(),
            actual: raw.len(),
        });
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ExtractError::Unusable("model produced non-finite values".into()));
    }
    Ok(raw)
}
