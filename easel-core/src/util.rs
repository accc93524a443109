use std::io::Cursor;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU(metal) build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Resizes an image to (width, height) and converts it into a (1, 3, h, w)
/// f32 tensor scaled to [-1, 1], on the CPU.
pub fn image_to_tensor(img: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
    let pixels = img
        .resize_exact(width as u32, height as u32, FilterType::Lanczos3)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(pixels, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Filename-safe fragment of a prompt: first `max_chars` characters, only
/// alphanumerics, space, `-` and `_`, trailing whitespace trimmed, spaces
/// turned into underscores, lower-cased.
pub fn sanitize_fragment(text: &str, max_chars: usize) -> String {
    let kept: String = text
        .chars()
        .take(max_chars)
        .filter(|c| c.is_alphanumeric() || matches!(*c, ' ' | '-' | '_'))
        .collect();
    kept.trim_end().replace(' ', "_").to_lowercase()
}

/// Scales (width, height) by `factor`, shrinks proportionally so the longer
/// side is at most `max_side`, and floors both to a multiple of `stride`
/// (never below `min_side`).
pub fn fit_dimensions(
    width: u32,
    height: u32,
    factor: f64,
    min_side: usize,
    max_side: usize,
    stride: usize,
) -> (usize, usize) {
    let mut w = width as f64 * factor;
    let mut h = height as f64 * factor;
    let longest = w.max(h);
    if longest > max_side as f64 {
        let shrink = max_side as f64 / longest;
        w *= shrink;
        h *= shrink;
    }
    let floor = |v: f64| {
        let v = (v as usize / stride) * stride;
        v.clamp(min_side, max_side)
    };
    (floor(w), floor(h))
}
