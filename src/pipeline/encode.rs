//! Image encoding: rendered PNG file → base64 `ImageData`.
//!
//! Vision APIs accept images as base64 data embedded in the JSON request
//! body. The rasteriser already wrote lossless PNG, so the file bytes are
//! encoded as-is; re-decoding would only cost time.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// Load a rendered page and wrap it for a vision request.
///
/// `detail: "high"` lets GPT-4-class models tile the image at full
/// resolution; with `"low"` the fine print of a handbook page is lost.
pub async fn encode_page_file(path: &Path) -> std::io::Result<ImageData> {
    let bytes = tokio::fs::read(path).await?;
    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());
    Ok(ImageData::new(b64, mime_for(path)).with_detail("high"))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[tokio::test]
    async fn encode_rendered_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page-0001.png");
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();

        let data = encode_page_file(&path).await.expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, std::fs::read(&path).unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(encode_page_file(&dir.path().join("nope.png")).await.is_err());
    }

    #[test]
    fn jpeg_mime() {
        assert_eq!(mime_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.png")), "image/png");
    }
}
