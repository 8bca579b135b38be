//! Data-URL decoding and validation.

use base64::Engine;
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:image/";
const HASH_HEX_CHARS: usize = 16;

/// Formats accepted in the data-URL header.
pub const SUPPORTED_FORMATS: [&str; 5] = ["jpeg", "jpg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum ImageInputError {
    #[error("image must be a data:image/<format>;base64, URL")]
    NotDataUrl,
    #[error("unsupported image format: {0} (supported: jpeg, jpg, png, bmp, webp)")]
    UnsupportedFormat(String),
    #[error("image is too large: ~{size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// A split `data:image/<format>;base64,<payload>` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUrl<'a> {
    pub format: &'a str,
    pub payload: &'a str,
}

impl<'a> DataUrl<'a> {
    pub fn parse(input: &'a str) -> Result<Self, ImageInputError> {
        let rest = input.strip_prefix(DATA_URL_PREFIX).ok_or(ImageInputError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(ImageInputError::NotDataUrl)?;
        let format = header.split(';').next().unwrap_or_default();

        if !SUPPORTED_FORMATS.contains(&format.to_ascii_lowercase().as_str()) {
            return Err(ImageInputError::UnsupportedFormat(format.to_string()));
        }

        Ok(Self { format, payload })
    }

    /// Decoded size estimated from the base64 length (3 bytes per 4 chars).
    pub fn estimated_size(&self) -> usize {
        self.payload.len() * 3 / 4
    }
}

/// Validate and decode a data URL into an RGB image.
///
/// The size limit is checked on the estimate before any decoding happens.
pub fn decode_data_url(input: &str, max_size: usize) -> Result<RgbImage, ImageInputError> {
    let url = DataUrl::parse(input)?;

    let size = url.estimated_size();
    if size > max_size {
        return Err(ImageInputError::TooLarge { size, limit: max_size });
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(url.payload.trim())?;
    let image = image::load_from_memory(&bytes)?.to_rgb8();

    tracing::debug!(
        format = url.format,
        width = image.width(),
        height = image.height(),
        hash = %image_hash(input),
        "decoded image"
    );

    Ok(image)
}

/// Short SHA-256 of the base64 payload, safe to log in place of the image.
pub fn image_hash(input: &str) -> String {
    let payload = match DataUrl::parse(input) {
        Ok(url) => url.payload,
        Err(_) => input.split_once(',').map_or(input, |(_, p)| p),
    };
    let digest = Sha256::digest(payload.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(HASH_HEX_CHARS);
    hex
}

/// Read an image file from disk as RGB.
pub fn load_file(path: &Path) -> Result<RgbImage, ImageInputError> {
    Ok(image::open(path)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_data_url(width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(buf.into_inner());
        format!("data:image/png;base64,{b64}")
    }

    #[test]
    fn test_parse_data_url() {
        let url = DataUrl::parse("data:image/jpeg;base64,QUJD").unwrap();
        assert_eq!(url.format, "jpeg");
        assert_eq!(url.payload, "QUJD");
        assert_eq!(url.estimated_size(), 3);
    }

    #[test]
    fn test_parse_rejects_plain_base64() {
        assert!(matches!(DataUrl::parse("QUJD"), Err(ImageInputError::NotDataUrl)));
        assert!(matches!(DataUrl::parse("data:image/png;base64"), Err(ImageInputError::NotDataUrl)));
    }

    #[test]
    fn test_parse_rejects_unsupported_format() {
        assert!(matches!(
            DataUrl::parse("data:image/gif;base64,QUJD"),
            Err(ImageInputError::UnsupportedFormat(f)) if f == "gif"
        ));
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = decode_data_url(&png_data_url(8, 6), 1 << 20).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
        assert_eq!(img.get_pixel(3, 3), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_decode_enforces_size_limit() {
        let err = decode_data_url(&png_data_url(8, 6), 10).unwrap_err();
        assert!(matches!(err, ImageInputError::TooLarge { limit: 10, .. }));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode_data_url("data:image/png;base64,@@@@", 1 << 20),
            Err(ImageInputError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_image_bytes() {
        // "hello world" is valid base64 but not an image.
        assert!(matches!(
            decode_data_url("data:image/png;base64,aGVsbG8gd29ybGQ=", 1 << 20),
            Err(ImageInputError::Decode(_))
        ));
    }

    #[test]
    fn test_image_hash_ignores_header() {
        let a = image_hash("data:image/png;base64,QUJD");
        let b = image_hash("data:image/jpeg;base64,QUJD");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, image_hash("data:image/png;base64,QUJE"));
    }
}
