//! Uploaded bytes to an RGB8 pixel buffer.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("empty image payload")]
    Empty,
    #[error("unrecognized or unsupported image encoding")]
    UnknownFormat,
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero size ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },
}

/// Decode an image of any supported encoding (at least JPEG and PNG).
///
/// The encoding is sniffed from the content, never from a file name.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Empty);
    }

    let format = image::guess_format(bytes).map_err(|_| PreprocessError::UnknownFormat)?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;

    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(PreprocessError::ZeroSize { width, height });
    }

    tracing::debug!(?format, width, height, "decoded image");
    Ok(decoded.to_rgb8())
}
