//! Frame arithmetic and JPEG re-encoding for evidence snapshots.

use atrium_core::FrameError;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

/// Frame rate used when the container does not report one.
pub const FALLBACK_FPS: f64 = 25.0;
pub const EVIDENCE_JPEG_QUALITY: u8 = 85;

/// Parse an ffprobe rate such as `"30/1"`, `"30000/1001"` or `"25"`.
/// Zero or non-finite rates are rejected.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Nearest frame to `timestamp_ms` at `fps`.
pub fn frame_index(timestamp_ms: u64, fps: f64) -> u64 {
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        FALLBACK_FPS
    };
    (timestamp_ms as f64 / 1000.0 * fps).round() as u64
}

/// Decode any supported image and re-encode it as JPEG.
pub fn encode_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, FrameError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());

    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("N/A"), None);
        assert_eq!(parse_frame_rate(""), None);
    }

    #[test]
    fn test_frame_index_rounds() {
        assert_eq!(frame_index(0, 25.0), 0);
        assert_eq!(frame_index(1000, 25.0), 25);
        assert_eq!(frame_index(1500, 25.0), 38); // 37.5 rounds up
        assert_eq!(frame_index(1500, 29.97), 45);
    }

    #[test]
    fn test_frame_index_bad_fps_falls_back() {
        assert_eq!(frame_index(2000, 0.0), 50);
        assert_eq!(frame_index(2000, f64::NAN), 50);
    }

    #[test]
    fn test_encode_jpeg_from_png_with_alpha() {
        let img = RgbaImage::from_pixel(8, 6, Rgba([200, 10, 10, 128]));
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let jpeg = encode_jpeg(&png, EVIDENCE_JPEG_QUALITY).unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let back = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((back.width(), back.height()), (8, 6));
    }

    #[test]
    fn test_encode_jpeg_rejects_garbage() {
        assert!(matches!(
            encode_jpeg(b"not an image", 85),
            Err(FrameError::Decode(_))
        ));
    }
}
