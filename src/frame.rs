//! Raw pixel buffers handed over by capture sources.
//!
//! - `PlanarFrame`: full-resolution luma plus 2x2 sub-sampled chroma planes.
//!   Every plane carries its own row stride and pixel stride, so semi-planar
//!   layouts (chroma planes aliasing one interleaved buffer) and padded rows
//!   are described without copying.
//! - `Nv21Image`: tightly packed luma followed by interleaved V/U samples, the
//!   layout the still-image codec consumes.

use anyhow::{anyhow, Result};

/// One image plane.
#[derive(Clone, Debug)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Bytes between two horizontally adjacent samples.
    pub pixel_stride: usize,
}

impl Plane {
    /// Tightly packed plane (`pixel_stride == 1`).
    pub fn packed(data: Vec<u8>, width: usize) -> Self {
        Self {
            data,
            row_stride: width,
            pixel_stride: 1,
        }
    }

    fn copy_row(&self, row: usize, samples: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = row * self.row_stride;
        if self.pixel_stride == 1 {
            let src = self
                .data
                .get(start..start + samples)
                .ok_or_else(|| anyhow!("plane row {} is out of bounds", row))?;
            out.extend_from_slice(src);
            return Ok(());
        }
        for col in 0..samples {
            out.push(self.sample(start + col * self.pixel_stride, row)?);
        }
        Ok(())
    }

    fn sample(&self, index: usize, row: usize) -> Result<u8> {
        self.data
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("plane sample in row {} is out of bounds", row))
    }
}

/// Planar 4:2:0 frame (Y, U, V).
#[derive(Clone, Debug)]
pub struct PlanarFrame {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
}

impl PlanarFrame {
    /// Build a tightly packed I420 frame from a contiguous buffer.
    pub fn from_i420(data: &[u8], width: u32, height: u32) -> Result<Self> {
        let w = width as usize;
        let h = height as usize;
        let (cw, ch) = chroma_dims(width, height);
        let luma = w
            .checked_mul(h)
            .ok_or_else(|| anyhow!("I420 frame dimensions overflow"))?;
        let chroma = cw * ch;
        let expected = luma + 2 * chroma;
        if data.len() != expected {
            return Err(anyhow!(
                "I420 frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            y: Plane::packed(data[..luma].to_vec(), w),
            u: Plane::packed(data[luma..luma + chroma].to_vec(), cw),
            v: Plane::packed(data[luma + chroma..].to_vec(), cw),
        })
    }

    /// Repack into NV21, reading every plane through its own strides.
    pub fn to_nv21(&self) -> Result<Nv21Image> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("frame has zero dimensions"));
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let (cw, ch) = chroma_dims(self.width, self.height);

        let mut data = Vec::with_capacity(w * h + 2 * cw * ch);
        for row in 0..h {
            self.y.copy_row(row, w, &mut data)?;
        }
        for row in 0..ch {
            let v_start = row * self.v.row_stride;
            let u_start = row * self.u.row_stride;
            for col in 0..cw {
                data.push(self.v.sample(v_start + col * self.v.pixel_stride, row)?);
                data.push(self.u.sample(u_start + col * self.u.pixel_stride, row)?);
            }
        }

        Ok(Nv21Image {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// Semi-planar 4:2:0 image: `width * height` luma bytes, then V/U pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nv21Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Nv21Image {
    /// Convert to packed RGB24 (BT.601 full range).
    pub fn to_rgb(&self) -> Result<Vec<u8>> {
        let w = self.width as usize;
        let h = self.height as usize;
        let (cw, ch) = chroma_dims(self.width, self.height);
        let y_plane = w * h;
        let expected = y_plane + 2 * cw * ch;
        if self.data.len() != expected {
            return Err(anyhow!(
                "NV21 frame length mismatch: expected {}, got {}",
                expected,
                self.data.len()
            ));
        }

        let mut rgb = vec![0u8; y_plane * 3];
        for j in 0..h {
            for i in 0..w {
                let y = self.data[j * w + i] as f32;
                let vu_index = y_plane + ((j / 2) * cw + i / 2) * 2;
                let v = self.data[vu_index] as f32 - 128.0;
                let u = self.data[vu_index + 1] as f32 - 128.0;

                let r = y + 1.402_f32 * v;
                let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
                let b = y + 1.772_f32 * u;

                let offset = (j * w + i) * 3;
                rgb[offset] = clamp_to_u8(r);
                rgb[offset + 1] = clamp_to_u8(g);
                rgb[offset + 2] = clamp_to_u8(b);
            }
        }
        Ok(rgb)
    }
}

fn chroma_dims(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
