//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing,
//! plus the single-face gate every enrollment and verification passes through.

use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const SCRFD_DEFAULT_CONFIDENCE: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Outcome of the exactly-one-face rule.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FaceCountError {
    #[error("no face detected")]
    NoFace,
    #[error("{0} faces detected, expected exactly one")]
    Multiple(usize),
}

/// Locates faces in a decoded image.
pub trait FaceDetector {
    /// Detected regions, highest confidence first. May be empty.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Accept exactly one face region.
pub fn single_face(mut regions: Vec<FaceRegion>) -> Result<FaceRegion, FaceCountError> {
    match regions.len() {
        0 => Err(FaceCountError::NoFace),
        1 => Ok(regions.remove(0)),
        n => Err(FaceCountError::Multiple(n)),
    }
}

/// Scale and padding applied when the image was fitted into the model input.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    /// Model-input coordinates back to source image pixels.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Positions of one stride's score, box and keypoint tensors in the model
/// outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: usize,
}

pub struct ScrfdDetector {
    session: Session,
    confidence_threshold: f32,
    heads: [StrideHead; 3],
}

impl ScrfdDetector {
    /// Open the SCRFD model. Detections scoring at or below
    /// `confidence_threshold` are discarded.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if names.len() < 3 * SCRFD_STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "detector exposes {} outputs; score, bbox and kps per stride need {}",
                names.len(),
                3 * SCRFD_STRIDES.len()
            )));
        }

        let heads = resolve_heads(&names);
        tracing::info!(
            path = model_path,
            outputs = ?names,
            ?heads,
            confidence_threshold,
            "SCRFD detector ready"
        );

        Ok(Self {
            session,
            confidence_threshold,
            heads,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let tensor = |index: usize, what: &str, stride: usize| {
            outputs[index]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| {
                    DetectorError::InferenceFailed(format!("{what} @ stride {stride}: {e}"))
                })
        };

        let mut candidates = Vec::new();
        for head in &self.heads {
            let scores = tensor(head.score, "score", head.stride)?;
            let boxes = tensor(head.bbox, "bbox", head.stride)?;
            let points = tensor(head.kps, "kps", head.stride)?;
            candidates.extend(decode_stride(
                head.stride,
                scores,
                boxes,
                points,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let candidate_count = candidates.len();
        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(
            candidates = candidate_count,
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "detection finished"
        );
        Ok(faces)
    }
}

/// Letterbox an RGB image into the 640×640 NCHW SCRFD input.
///
/// Padding is filled with the mean so it normalizes to 0.0.
fn letterbox_tensor(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let x0 = pad_x.floor() as usize;
    let y0 = pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y0 + y as usize, x0 + x as usize]] =
                (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map each stride to its output tensors.
///
/// Exports either name heads `score_8`, `bbox_16`, `kps_32`, ... or use
/// opaque names in the fixed order scores, boxes, keypoints (strides
/// ascending within each group).
fn resolve_heads(names: &[String]) -> [StrideHead; 3] {
    let index_of = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHead {
                stride,
                score: index_of("score", stride)?,
                bbox: index_of("bbox", stride)?,
                kps: index_of("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::info!(?names, "unnamed detector outputs, assuming positional layout");
            std::array::from_fn(|i| StrideHead {
                stride: SCRFD_STRIDES[i],
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Turn one stride's raw head outputs into candidate regions.
///
/// Each grid cell carries two anchors centred on the cell's top-left corner;
/// box and keypoint values are offsets in units of the stride.
fn decode_stride(
    stride: usize,
    scores: &[f32],
    boxes: &[f32],
    points: &[f32],
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<FaceRegion> {
    let cells = SCRFD_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .take(cells * cells * SCRFD_ANCHORS_PER_CELL)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % cells) as f32 * step;
            let cy = (cell / cells) as f32 * step;

            let d = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (left, top) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (right, bottom) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = points.get(anchor * 10..anchor * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.unmap(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)
                })
            });

            Some(FaceRegion {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, strongest first.
fn nms(mut candidates: Vec<FaceRegion>, max_overlap: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.into_iter().fold(Vec::new(), |mut kept, region| {
        if kept.iter().all(|k| iou(k, &region) <= max_overlap) {
            kept.push(region);
        }
        kept
    })
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let shared = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - shared;
    if union > 0.0 {
        shared / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn region(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> FaceRegion {
        FaceRegion {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_single_face_gate() {
        assert_eq!(single_face(vec![]), Err(FaceCountError::NoFace));

        let one = region(0.0, 0.0, 10.0, 10.0, 0.9);
        assert_eq!(single_face(vec![one.clone()]), Ok(one.clone()));

        let two = vec![one.clone(), region(50.0, 50.0, 10.0, 10.0, 0.8)];
        assert_eq!(single_face(two), Err(FaceCountError::Multiple(2)));
    }

    #[test]
    fn test_iou() {
        let a = region(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &region(30.0, 0.0, 10.0, 10.0, 1.0)), 0.0);
        // Half-width shift: 50 shared over 150 total.
        let shifted = region(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &shifted) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou(&region(0.0, 0.0, 0.0, 0.0, 1.0), &region(0.0, 0.0, 0.0, 0.0, 1.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_strongest_of_each_cluster() {
        let kept = nms(
            vec![
                region(300.0, 40.0, 60.0, 60.0, 0.55),
                region(4.0, 4.0, 100.0, 100.0, 0.81),
                region(0.0, 0.0, 100.0, 100.0, 0.93),
                region(302.0, 42.0, 60.0, 60.0, 0.62),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        let confidences: Vec<f32> = kept.iter().map(|r| r.confidence).collect();
        assert_eq!(confidences, vec![0.93, 0.62]);
        assert!(nms(Vec::new(), SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_to_image_space() {
        // One confident anchor at grid cell (1, 1) of stride 32.
        let grid = 640 / 32;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; n];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; n * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0f32; n * 10];

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let dets = decode_stride(32, &scores, &bboxes, &kps, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);

        let d = &dets[0];
        // Anchor centre (32, 32) in letterbox space, box ±16.
        assert!((d.x - 8.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - (-32.0)).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 16.0).abs() < 1e-4);
        assert!((d.height - 16.0).abs() < 1e-4);
        let lms = d.landmarks.unwrap();
        assert!((lms[0].0 - 16.0).abs() < 1e-4);
        assert!((lms[0].1 - (-24.0)).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_tensor_padding_and_placement() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 0, 128]));
        let (tensor, lb) = letterbox_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);

        // Padding normalizes to zero.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // Content rows carry the normalized RGB values in channel order.
        let r = tensor[[0, 0, 320, 320]];
        let g = tensor[[0, 1, 320, 320]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn layout(heads: [StrideHead; 3]) -> Vec<(usize, usize, usize, usize)> {
        heads.iter().map(|h| (h.stride, h.score, h.bbox, h.kps)).collect()
    }

    #[test]
    fn test_resolve_heads() {
        let positional = vec![(8, 0, 3, 6), (16, 1, 4, 7), (32, 2, 5, 8)];

        let grouped = names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]);
        assert_eq!(layout(resolve_heads(&grouped)), positional);

        let interleaved = names(&[
            "kps_32", "bbox_32", "score_32", "kps_16", "bbox_16", "score_16", "kps_8", "bbox_8",
            "score_8",
        ]);
        assert_eq!(
            layout(resolve_heads(&interleaved)),
            vec![(8, 8, 7, 6), (16, 5, 4, 3), (32, 2, 1, 0)]
        );

        let opaque: Vec<String> = (440..449).map(|i| format!("onnx::Sigmoid_{i}")).collect();
        assert_eq!(layout(resolve_heads(&opaque)), positional);

        // One missing head disables name matching entirely.
        let partial = names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "landmarks_32",
        ]);
        assert_eq!(layout(resolve_heads(&partial)), positional);
    }

    #[test]
    fn test_decode_stride_drops_scores_at_threshold() {
        let n = 20 * 20 * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; n];
        scores[0] = 0.5;
        scores[1] = 0.51;
        let boxes = vec![1.0f32; n * 4];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(32, &scores, &boxes, &[], &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.51);
        assert!(dets[0].landmarks.is_none());
    }
}
