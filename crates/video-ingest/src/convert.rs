//! NV12 → RGB conversion and resizing.
//!
//! On target hardware this work runs on a dedicated 2D engine; the
//! [`PixelConvert`] trait is the seam for that collaborator. The bundled
//! [`SoftwareConverter`] is a nearest-neighbour CPU fallback good enough for
//! tests and low-rate deployments.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid dimensions {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("NV12 buffer too short: got {got} bytes, need {need}")]
    ShortBuffer { got: usize, need: usize },
}

/// Colour conversion + resize collaborator.
///
/// Output is packed RGB, 3 bytes per pixel. Destination dimensions are
/// rounded up to even values, matching the alignment the hardware engine
/// requires.
pub trait PixelConvert: Send + Sync {
    fn nv12_to_rgb_resize(
        &self,
        nv12: &[u8],
        src_w: u32,
        src_h: u32,
        dst_w: u32,
        dst_h: u32,
    ) -> Result<Vec<u8>, ConvertError>;
}

/// Height that preserves the source aspect ratio at `target_w`, rounded up
/// to the next even value.
pub fn calc_proportional_height(src_w: u32, src_h: u32, target_w: u32) -> u32 {
    if src_w == 0 || src_h == 0 || target_w == 0 {
        return 0;
    }
    let h = (target_w as u64 * src_h as u64).div_ceil(src_w as u64) as u32;
    h.next_multiple_of(2)
}

/// Pure-CPU converter: nearest-neighbour sampling, BT.601 YUV → RGB.
#[derive(Debug, Default)]
pub struct SoftwareConverter;

impl PixelConvert for SoftwareConverter {
    fn nv12_to_rgb_resize(
        &self,
        nv12: &[u8],
        src_w: u32,
        src_h: u32,
        dst_w: u32,
        dst_h: u32,
    ) -> Result<Vec<u8>, ConvertError> {
        if src_w == 0 || src_h == 0 {
            return Err(ConvertError::BadDimensions {
                width: src_w,
                height: src_h,
            });
        }
        let dst_w = dst_w.next_multiple_of(2);
        let dst_h = dst_h.next_multiple_of(2);
        if dst_w == 0 || dst_h == 0 {
            return Err(ConvertError::BadDimensions {
                width: dst_w,
                height: dst_h,
            });
        }

        let need = crate::nv12_buffer_len(src_w, src_h);
        if nv12.len() < need {
            return Err(ConvertError::ShortBuffer {
                got: nv12.len(),
                need,
            });
        }

        let (sw, sh) = (src_w as usize, src_h as usize);
        let (dw, dh) = (dst_w as usize, dst_h as usize);
        let y_plane = &nv12[..sw * sh];
        let uv_plane = &nv12[sw * sh..need];

        let mut rgb = vec![0u8; dw * dh * 3];
        for dy in 0..dh {
            let sy = (dy * sh) / dh;
            for dx in 0..dw {
                let sx = (dx * sw) / dw;
                let y = y_plane[sy * sw + sx] as f32;
                let uv_off = (sy / 2) * sw + (sx / 2) * 2;
                let u = uv_plane[uv_off] as f32 - 128.0;
                let v = uv_plane[uv_off + 1] as f32 - 128.0;

                let r = y + 1.402 * v;
                let g = y - 0.344_136 * u - 0.714_136 * v;
                let b = y + 1.772 * u;

                let out = (dy * dw + dx) * 3;
                rgb[out] = r.clamp(0.0, 255.0) as u8;
                rgb[out + 1] = g.clamp(0.0, 255.0) as u8;
                rgb[out + 2] = b.clamp(0.0, 255.0) as u8;
            }
        }
        Ok(rgb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_height_keeps_ratio_and_evenness() {
        // 1920x1080 at width 640 -> 360, already even.
        assert_eq!(calc_proportional_height(1920, 1080, 640), 360);
        // 1280x719 at width 640 -> 359.5, rounds up then aligns to 360.
        assert_eq!(calc_proportional_height(1280, 719, 640), 360);
        assert_eq!(calc_proportional_height(0, 1080, 640), 0);
    }

    #[test]
    fn converter_produces_packed_rgb_of_even_size() {
        let conv = SoftwareConverter;
        let nv12 = vec![128u8; crate::nv12_buffer_len(8, 8)];
        let rgb = conv.nv12_to_rgb_resize(&nv12, 8, 8, 5, 3).unwrap();
        // 5x3 is padded up to 6x4.
        assert_eq!(rgb.len(), 6 * 4 * 3);
    }

    #[test]
    fn neutral_chroma_yields_grey() {
        let conv = SoftwareConverter;
        let mut nv12 = vec![0u8; crate::nv12_buffer_len(4, 4)];
        nv12[..16].fill(200); // Y plane
        nv12[16..].fill(128); // neutral UV
        let rgb = conv.nv12_to_rgb_resize(&nv12, 4, 4, 4, 4).unwrap();
        for px in rgb.chunks(3) {
            assert_eq!(px, &[200, 200, 200]);
        }
    }

    #[test]
    fn short_buffer_is_rejected() {
        let conv = SoftwareConverter;
        let err = conv.nv12_to_rgb_resize(&[0u8; 10], 8, 8, 4, 4).unwrap_err();
        assert!(matches!(err, ConvertError::ShortBuffer { .. }));
    }
}
