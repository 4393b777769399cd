//! JPEG encoding for cached preview frames.

use anyhow::{Context, Result};
use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};

/// Encode a packed RGB buffer (3 bytes per pixel) at the given quality
/// (1..=100).
pub fn encode_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * 3;
    anyhow::ensure!(
        rgb.len() == expected,
        "RGB buffer is {} bytes, expected {expected} for {width}x{height}",
        rgb.len()
    );

    let mut out = Vec::with_capacity(rgb.len() / 8);
    let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .write_image(rgb, width, height, ExtendedColorType::Rgb8)
        .with_context(|| format!("encoding {width}x{height} JPEG"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_valid_jpeg() {
        let rgb = vec![96u8; 16 * 16 * 3];
        let jpeg = encode_rgb(&rgb, 16, 16, 75).unwrap();
        // SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(jpeg.len() > 100);
    }

    #[test]
    fn higher_quality_produces_no_smaller_output() {
        let mut rgb = vec![0u8; 32 * 32 * 3];
        for (i, v) in rgb.iter_mut().enumerate() {
            *v = (i % 251) as u8;
        }
        let low = encode_rgb(&rgb, 32, 32, 10).unwrap();
        let high = encode_rgb(&rgb, 32, 32, 95).unwrap();
        assert!(high.len() >= low.len());
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        assert!(encode_rgb(&[0u8; 10], 16, 16, 75).is_err());
    }
}
