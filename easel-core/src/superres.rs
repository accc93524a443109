use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use crate::config::SuperResolutionConfig;
use crate::upscale::SuperResolution;

pub struct OnnxSuperResolution {
    name: String,
    session: Mutex<Session>,
    scale: u32,
    input_name: String,
    output_name: String,
}

impl OnnxSuperResolution {
    pub fn load(config: &SuperResolutionConfig) -> Result<Self> {
        if config.scale == 0 {
            bail!("super-resolution scale must be at least 1");
        }
        let path = &config.model_path;
        let session = Session::builder()
            .map_err(|e| anyhow!("onnx session: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("onnx session: {e}"))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("loading {}: {e}", path.display()))?;

        let input_name = match &config.input_name {
            Some(name) => name.clone(),
            None => session
                .inputs
                .first()
                .map(|input| input.name.clone())
                .context("network has no inputs")?,
        };
        let output_name = match &config.output_name {
            Some(name) => name.clone(),
            None => session
                .outputs
                .first()
                .map(|output| output.name.clone())
                .context("network has no outputs")?,
        };
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        info!(model = %name, scale = config.scale, input = %input_name, output = %output_name, "super-resolution network loaded");

        Ok(Self {
            name,
            session: Mutex::new(session),
            scale: config.scale,
            input_name,
            output_name,
        })
    }
}

impl SuperResolution for OnnxSuperResolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn upscale(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let rgb = image.to_rgb8();
        let (w, h) = (rgb.width() as usize, rgb.height() as usize);
        let input = Tensor::from_array(to_nchw(&rgb))?;

        let output = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("super-resolution session poisoned"))?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned()
                .into_dimensionality::<ndarray::Ix4>()?
        };
        debug!(from = ?(w, h), to = ?output.shape(), "super-resolution pass");

        let scale = self.scale as usize;
        let expected = [1, 3, h * scale, w * scale];
        if output.shape() != expected {
            bail!(
                "network produced {:?}, expected {:?} for scale {}",
                output.shape(),
                expected,
                self.scale
            );
        }
        Ok(DynamicImage::ImageRgb8(from_nchw(&output)?))
    }
}

/// Interleaved RGB to planar `[1, 3, H, W]` in [0, 1].
fn to_nchw(rgb: &RgbImage) -> Array4<f32> {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            nchw[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
        }
    }
    nchw
}

fn from_nchw(nchw: &Array4<f32>) -> Result<RgbImage> {
    let (h, w) = (nchw.shape()[2], nchw.shape()[3]);
    let mut raw = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                raw.push((nchw[[0, c, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    RgbImage::from_raw(w as u32, h as u32, raw).context("output buffer size mismatch")
}
