use anyhow::{anyhow, Result};

use crate::frame::PixelFormat;

/// Pixel layouts a capture device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeviceFormat {
    Rgb24,
    Yuyv,
    Nv12,
}

impl DeviceFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(DeviceFormat::Rgb24),
            b"YUYV" => Some(DeviceFormat::Yuyv),
            b"NV12" => Some(DeviceFormat::Nv12),
            _ => None,
        }
    }
}

/// Convert a device buffer into packed pixels of `target` layout.
pub(crate) fn normalize(
    pixels: &[u8],
    width: u32,
    height: u32,
    device: DeviceFormat,
    target: PixelFormat,
) -> Result<Vec<u8>> {
    let rgb = match device {
        DeviceFormat::Rgb24 => {
            let expected = PixelFormat::Rgb24.buffer_len(width, height)?;
            // Some drivers pad the final buffer.
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            pixels[..expected].to_vec()
        }
        DeviceFormat::Yuyv => yuyv_to_rgb(pixels, width, height)?,
        DeviceFormat::Nv12 => nv12_to_rgb(pixels, width, height)?,
    };
    Ok(pack(rgb, target))
}

fn pack(rgb: Vec<u8>, target: PixelFormat) -> Vec<u8> {
    match target {
        PixelFormat::Rgb24 => rgb,
        PixelFormat::Bgra32 => rgb
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0], u8::MAX])
            .collect(),
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    let expected = pixel_count * 2;
    if pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in pixels[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
        }
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }

    Ok(rgb)
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402_f32 * v),
        clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v),
        clamp_to_u8(y + 1.772_f32 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = normalize(&nv12, 2, 2, DeviceFormat::Nv12, PixelFormat::Rgb24)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_conversion_packs_bgra() -> Result<()> {
        let yuyv = [200u8, 128, 50, 128];
        let bgra = normalize(&yuyv, 2, 1, DeviceFormat::Yuyv, PixelFormat::Bgra32)?;
        assert_eq!(bgra, vec![200, 200, 200, 255, 50, 50, 50, 255]);
        Ok(())
    }

    #[test]
    fn short_rgb_buffer_is_rejected() {
        let pixels = vec![1u8; 8];
        assert!(normalize(&pixels, 1, 3, DeviceFormat::Rgb24, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(DeviceFormat::from_fourcc(b"YUYV"), Some(DeviceFormat::Yuyv));
        assert_eq!(DeviceFormat::from_fourcc(b"MJPG"), None);
    }
}
