//! Five-point face alignment for the landmark encoder.
//!
//! Fits a similarity transform from detected landmarks onto a fixed
//! 112×112 template and resamples the face bilinearly.

use image::{Rgb, RgbImage};

/// Reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Affine matrix `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub type SimilarityTransform = [f32; 6];

/// Least-squares similarity transform (scale, rotation, translation) from
/// `src` to `dst`. Returns `None` when the source points coincide.
///
/// Closed form over the centred point sets: with `p` and `q` the centred
/// source and destination, `a = Σ p·q / Σ |p|²` and
/// `b = Σ p×q / Σ |p|²`.
pub fn estimate_similarity_transform(
    src: &[(f32, f32); 5],
    dst: &[(f32, f32); 5],
) -> Option<SimilarityTransform> {
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts
            .iter()
            .fold((0.0f64, 0.0f64), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
        (sx / 5.0, sy / 5.0)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let (mut dot, mut cross, mut spread) = (0.0f64, 0.0f64, 0.0f64);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (px, py) = (sx as f64 - scx, sy as f64 - scy);
        let (qx, qy) = (dx as f64 - dcx, dy as f64 - dcy);
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        spread += px * px + py * py;
    }
    if spread < 1e-9 {
        return None;
    }

    let a = dot / spread;
    let b = cross / spread;
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);

    let m = [a, -b, tx, b, a, ty].map(|v| v as f32);
    (m.iter().all(|v| v.is_finite()) && a * a + b * b > 1e-12).then_some(m)
}

/// What samples past the image border read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Border {
    Black,
    Clamp,
}

/// Bilinear sample at `(sx, sy)` in pixel-centre coordinates.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32, border: Border) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
        return Rgb([0, 0, 0]);
    }
    let texel = |x: i64, y: i64, c: usize| -> f32 {
        match border {
            Border::Clamp => {
                image.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32)[c] as f32
            }
            Border::Black if (0..w).contains(&x) && (0..h).contains(&y) => {
                image.get_pixel(x as u32, y as u32)[c] as f32
            }
            Border::Black => 0.0,
        }
    };

    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let val = texel(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
            + texel(x0 + 1, y0, c) * fx * (1.0 - fy)
            + texel(x0, y0 + 1, c) * (1.0 - fx) * fy
            + texel(x0 + 1, y0 + 1, c) * fx * fy;
        *slot = val.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `image` through `matrix` into an `out_size`×`out_size` crop.
///
/// Bilinear interpolation; samples outside the source are black.
pub fn warp_affine(image: &RgbImage, matrix: &SimilarityTransform, out_size: u32) -> RgbImage {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);

    // Inverse of [[a, -b], [b, a]] is [[a, b], [-b, a]] / (a^2 + b^2).
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        sample_bilinear(image, ia * dx + ib * dy, -ib * dx + ia * dy, Border::Black)
    })
}

/// Resize with bilinear interpolation over half-pixel centres, clamping
/// at the edges: output pixel `d` samples source `(d + 0.5) * in / out - 0.5`.
///
/// The kernel stays 2×2 when shrinking.
pub fn resize_bilinear(image: &RgbImage, out_width: u32, out_height: u32) -> RgbImage {
    let scale_x = image.width() as f32 / out_width.max(1) as f32;
    let scale_y = image.height() as f32 / out_height.max(1) as f32;
    RgbImage::from_fn(out_width, out_height, |ox, oy| {
        let sx = (ox as f32 + 0.5) * scale_x - 0.5;
        let sy = (oy as f32 + 0.5) * scale_y - 0.5;
        sample_bilinear(image, sx, sy, Border::Clamp)
    })
}

/// Align a face to the canonical 112×112 template.
///
/// Returns `None` when the landmarks do not determine a transform.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(warp_affine(image, &matrix, ALIGNED_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &SimilarityTransform, (x, y): (f32, f32)) -> (f32, f32) {
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    #[test]
    fn test_reference_maps_onto_itself() {
        let m = estimate_similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112)
            .unwrap();
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{m:?}");
        }
    }

    #[test]
    fn test_recovers_exact_similarity() {
        // Rotate 90°, scale by 3, shift by (200, -40).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (200.0 - 3.0 * y, -40.0 + 3.0 * x));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112) {
            let (x, y) = apply(&m, *s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2, "{s:?} -> ({x}, {y})");
        }
        // Scale 1/3 with a quarter turn back: a = 0, b = -1/3.
        assert!(m[0].abs() < 1e-4);
        assert!((m[3] + 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_coincident_landmarks_have_no_transform() {
        let collapsed = [(31.0, 17.0); 5];
        assert!(estimate_similarity_transform(&collapsed, &REFERENCE_LANDMARKS_112).is_none());
        assert!(align_face(&RgbImage::new(64, 64), &collapsed).is_none());
    }

    #[test]
    fn test_warp_fills_outside_with_black() {
        let image = RgbImage::from_pixel(8, 8, Rgb([200, 90, 10]));
        // Shift the source 4px right and down: the top-left corner has no source.
        let out = warp_affine(&image, &[1.0, 0.0, 4.0, 0.0, 1.0, 4.0], 16);
        assert_eq!(out.get_pixel(1, 1), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(7, 7), &Rgb([200, 90, 10]));
        assert_eq!(out.get_pixel(15, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_resize_samples_single_source_column_at_integer_ratio() {
        // At 3x, output column d lands exactly on source column 3d + 1.
        let image = RgbImage::from_fn(480, 480, |x, _| {
            if x % 3 == 1 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let out = resize_bilinear(&image, 160, 160);
        assert_eq!(out.dimensions(), (160, 160));
        assert_eq!(out.get_pixel(80, 80), &Rgb([255, 255, 255]));
        assert!(out.pixels().all(|p| p == &Rgb([255, 255, 255])));
    }

    #[test]
    fn test_resize_clamps_at_edges() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        image.put_pixel(0, 0, Rgb([240, 120, 60]));
        let out = resize_bilinear(&image, 4, 4);
        // (0.5 * 0.5 - 0.5) = -0.25 clamps onto the first column and row.
        assert_eq!(out.get_pixel(0, 0), &Rgb([240, 120, 60]));
        assert_eq!(out.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_aligned_crop_puts_eye_on_template() {
        // Template scaled by 2 and shifted; left eye lands at (176.6, 123.4).
        let landmarks = REFERENCE_LANDMARKS_112.map(|(x, y)| (2.0 * x + 100.0, 2.0 * y + 20.0));
        let mut image = RgbImage::from_pixel(400, 320, Rgb([20, 20, 20]));
        for y in 117..=129 {
            for x in 171..=183 {
                image.put_pixel(x, y, Rgb([20, 240, 20]));
            }
        }

        let aligned = align_face(&image, &landmarks).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));

        let (ex, ey) = REFERENCE_LANDMARKS_112[0];
        let eye = aligned.get_pixel(ex.round() as u32, ey.round() as u32);
        assert!(eye[1] > 200, "left eye landed on {eye:?}");
        let nose = REFERENCE_LANDMARKS_112[2];
        assert_eq!(
            aligned.get_pixel(nose.0.round() as u32, nose.1.round() as u32),
            &Rgb([20, 20, 20])
        );
    }
}
