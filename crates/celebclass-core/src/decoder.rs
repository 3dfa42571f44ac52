//! Image input decoding: data-URI/base64 payloads and image files.

use crate::types::PixelGrid;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no image supplied: payload and file path are both empty")]
    EmptySource,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image data: {0}")]
    Image(#[from] image::ImageError),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A data URI (`data:image/jpeg;base64,...`) or a bare base64 string.
    Encoded(String),
    /// A file on disk.
    Path(PathBuf),
}

impl ImageSource {
    /// Pick the meaningful input out of an optional payload and an optional path.
    ///
    /// A non-empty path wins over the payload.
    pub fn from_parts(image_data: Option<&str>, file_path: Option<&Path>) -> Result<Self, DecodeError> {
        if let Some(path) = file_path.filter(|p| !p.as_os_str().is_empty()) {
            return Ok(Self::Path(path.to_path_buf()));
        }
        match image_data.map(str::trim) {
            Some(data) if !data.is_empty() => Ok(Self::Encoded(data.to_string())),
            _ => Err(DecodeError::EmptySource),
        }
    }

    /// Short form for log lines: the path, or the first 100 characters of the payload.
    pub fn preview(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Encoded(data) => data.chars().take(100).collect(),
        }
    }
}

/// Decode any supported source into a BGR pixel grid.
pub fn decode(source: &ImageSource) -> Result<PixelGrid, DecodeError> {
    match source {
        ImageSource::Encoded(payload) => decode_payload(payload),
        ImageSource::Path(path) => decode_file(path),
    }
}

/// Decode a data URI or bare base64 string.
///
/// Everything up to and including the first comma is the scheme header and is
/// discarded. ASCII whitespace inside the payload is ignored.
pub fn decode_payload(payload: &str) -> Result<PixelGrid, DecodeError> {
    let encoded = strip_scheme(payload);
    let bytes = if encoded.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD.decode(compact)?
    } else {
        STANDARD.decode(encoded)?
    };
    decode_bytes(&bytes)
}

/// Read and decode an image file.
pub fn decode_file(path: &Path) -> Result<PixelGrid, DecodeError> {
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decode_bytes(&bytes)
}

/// Decode an encoded container (PNG, JPEG, ...) into a BGR grid.
pub fn decode_bytes(bytes: &[u8]) -> Result<PixelGrid, DecodeError> {
    let image = image::load_from_memory(bytes)?;
    let rgb = image.to_rgb8();
    tracing::debug!(width = rgb.width(), height = rgb.height(), "decoded image");
    Ok(PixelGrid::from_rgb_image(&rgb))
}

fn strip_scheme(payload: &str) -> &str {
    match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("data:image/png;base64,QUJD"), "QUJD");
        assert_eq!(strip_scheme("QUJD"), "QUJD");
        assert_eq!(strip_scheme("a,b,c"), "b,c");
    }

    #[test]
    fn test_decode_data_uri_to_bgr() {
        let payload = format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(3, 2, [200, 100, 50])));
        let grid = decode_payload(&payload).unwrap();
        assert_eq!((grid.width(), grid.height()), (3, 2));
        assert_eq!(grid.pixel(2, 1), [50, 100, 200]);
    }

    #[test]
    fn test_decode_bare_base64_with_newlines() {
        let encoded = STANDARD.encode(png_bytes(2, 2, [1, 2, 3]));
        let (head, tail) = encoded.split_at(10);
        let payload = format!("{head}\n{tail}\n");
        let grid = decode_payload(&payload).unwrap();
        assert_eq!(grid.pixel(0, 0), [3, 2, 1]);
    }

    #[test]
    fn test_malformed_base64() {
        let err = decode_payload("data:image/png;base64,!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)), "got {err:?}");
    }

    #[test]
    fn test_not_an_image() {
        let payload = format!("data:image/png;base64,{}", STANDARD.encode(b"definitely not a png"));
        let err = decode_payload(&payload).unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)), "got {err:?}");
    }

    #[test]
    fn test_missing_file() {
        let err = decode_file(Path::new("/nonexistent/celebclass/face.jpg")).unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }), "got {err:?}");
    }

    #[test]
    fn test_decode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, png_bytes(4, 4, [9, 8, 7])).unwrap();
        let grid = decode(&ImageSource::Path(path)).unwrap();
        assert_eq!(grid.pixel(3, 3), [7, 8, 9]);
    }

    #[test]
    fn test_from_parts_prefers_path() {
        let src = ImageSource::from_parts(Some("QUJD"), Some(Path::new("a.jpg"))).unwrap();
        assert_eq!(src, ImageSource::Path(PathBuf::from("a.jpg")));
    }

    #[test]
    fn test_from_parts_payload() {
        let src = ImageSource::from_parts(Some("QUJD"), None).unwrap();
        assert_eq!(src, ImageSource::Encoded("QUJD".into()));
        let src = ImageSource::from_parts(Some("QUJD"), Some(Path::new(""))).unwrap();
        assert_eq!(src, ImageSource::Encoded("QUJD".into()));
    }

    #[test]
    fn test_from_parts_empty() {
        assert!(matches!(ImageSource::from_parts(None, None), Err(DecodeError::EmptySource)));
        assert!(matches!(ImageSource::from_parts(Some("  "), None), Err(DecodeError::EmptySource)));
    }

    #[test]
    fn test_preview_truncates() {
        let src = ImageSource::Encoded("x".repeat(500));
        assert_eq!(src.preview().len(), 100);
    }
}
