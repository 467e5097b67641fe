use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::Nv21Image;

/// Still-image compressor used for the snapshot stream.
pub trait StillImageCodec: Send + Sync {
    /// Compress one image. `quality` is 1..=100.
    fn compress(&self, image: &Nv21Image, quality: u8) -> Result<Vec<u8>>;
}

/// Baseline JPEG via the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegCodec;

impl StillImageCodec for JpegCodec {
    fn compress(&self, image: &Nv21Image, quality: u8) -> Result<Vec<u8>> {
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("jpeg quality {} out of range 1..=100", quality));
        }
        let rgb = image.to_rgb()?;
        let mut out = Vec::with_capacity(rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, image.width, image.height, ExtendedColorType::Rgb8)
            .context("encode jpeg snapshot")?;
        Ok(out)
    }
}
