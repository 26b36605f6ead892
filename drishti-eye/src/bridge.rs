//! Numeric bridge between the enhancer and detector domains.
//!
//! The enhancer consumes RGB floats in `[-1, 1]` at its native resolution and
//! produces the same range. The detector consumes RGB floats in `[0, 1]` at a
//! different native resolution. The affine maps here are fixed by the deployed
//! models: changing them shows up as black or saturated output, not as an error.

use drishti_core::{ChannelOrder, ModelConfig, PixelBuffer};
use image::imageops::{self, FilterType};
use image::{Rgb, Rgb32FImage, RgbImage};
use std::fmt;

/// HWC RGB float image used on both sides of the bridge.
pub type Tensor = Rgb32FImage;

/// Byte `[0, 255]` to enhancer range `[-1, 1]`.
#[inline]
pub fn to_signed_unit(v: u8) -> f32 {
    (f32::from(v) - 127.5) / 127.5
}

/// Enhancer range `[-1, 1]` to detector range `[0, 1]`.
#[inline]
pub fn signed_to_unit(x: f32) -> f32 {
    ((x + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Enhancer range `[-1, 1]` back to a display byte.
#[inline]
pub fn signed_to_byte(x: f32) -> u8 {
    ((x + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
}

/// Reason a frame was refused by the validity gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRejection {
    pub reason: String,
}

impl FrameRejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for FrameRejection {}

/// Validity gate. Fails closed on anything that is not an `H x W x 3` buffer.
pub fn check_frame(pixels: Option<&PixelBuffer>) -> Result<&PixelBuffer, FrameRejection> {
    let pixels = pixels.ok_or_else(|| FrameRejection::new("frame has no pixel data"))?;

    if pixels.is_empty() || pixels.shape().iter().any(|d| *d == 0) {
        return Err(FrameRejection::new("frame is empty"));
    }

    let dims = pixels.shape().len();
    if dims < 3 {
        return Err(FrameRejection::new(format!(
            "expected 3 dimensions (H, W, C), got {}",
            dims
        )));
    }

    let channels = pixels.shape()[2];
    if channels != 3 {
        return Err(FrameRejection::new(format!(
            "expected 3 channels, got {}",
            channels
        )));
    }

    // Trailing singleton dims are tolerated, anything else is not a plain image.
    if pixels.shape()[3..].iter().any(|d| *d != 1) {
        return Err(FrameRejection::new(format!(
            "unsupported frame shape {:?}",
            pixels.shape()
        )));
    }

    Ok(pixels)
}

/// Copy a validated buffer into an RGB image, swapping channels when needed.
pub fn to_rgb_image(pixels: &PixelBuffer) -> Result<RgbImage, FrameRejection> {
    let pixels = check_frame(Some(pixels))?;
    let (height, width) = (pixels.shape()[0], pixels.shape()[1]);
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(FrameRejection::new("frame dimensions exceed u32")),
    };

    let mut data = pixels.data().to_vec();
    if pixels.order() == ChannelOrder::Bgr {
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
    }

    RgbImage::from_raw(w, h, data).ok_or_else(|| FrameRejection::new("frame buffer size mismatch"))
}

/// Transform between the two model domains. Stateless per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizationBridge {
    enhancer_size: (u32, u32),
    detector_size: (u32, u32),
}

impl NormalizationBridge {
    /// Sizes are `(width, height)`.
    pub fn new(enhancer_size: (u32, u32), detector_size: (u32, u32)) -> Self {
        Self {
            enhancer_size,
            detector_size,
        }
    }

    pub fn from_config(models: &ModelConfig) -> Self {
        let [ew, eh] = models.enhancer_resolution;
        let [dw, dh] = models.detector_resolution;
        Self::new((ew, eh), (dw, dh))
    }

    pub fn enhancer_size(&self) -> (u32, u32) {
        self.enhancer_size
    }

    pub fn detector_size(&self) -> (u32, u32) {
        self.detector_size
    }

    /// Gate, reorder to RGB, resize to the enhancer resolution, map to `[-1, 1]`.
    pub fn to_enhancer_domain(&self, pixels: Option<&PixelBuffer>) -> Result<Tensor, FrameRejection> {
        let rgb = to_rgb_image(check_frame(pixels)?)?;
        let (w, h) = self.enhancer_size;
        let resized = if rgb.dimensions() == (w, h) {
            rgb
        } else {
            imageops::resize(&rgb, w, h, FilterType::Triangle)
        };

        let mut out = Tensor::new(w, h);
        for (dst, src) in out.pixels_mut().zip(resized.pixels()) {
            *dst = Rgb([to_signed_unit(src[0]), to_signed_unit(src[1]), to_signed_unit(src[2])]);
        }
        Ok(out)
    }

    /// Map enhancer output to `[0, 1]` and resize bilinearly (half-pixel
    /// centres) to the detector resolution.
    pub fn to_detector_domain(&self, enhanced: &Tensor) -> Tensor {
        let mut unit = Tensor::new(enhanced.width(), enhanced.height());
        for (dst, src) in unit.pixels_mut().zip(enhanced.pixels()) {
            *dst = Rgb([signed_to_unit(src[0]), signed_to_unit(src[1]), signed_to_unit(src[2])]);
        }

        let (w, h) = self.detector_size;
        if unit.dimensions() == (w, h) {
            unit
        } else {
            imageops::resize(&unit, w, h, FilterType::Triangle)
        }
    }

    /// Enhancer output as a displayable RGB buffer at the enhancer's resolution.
    pub fn to_display(&self, enhanced: &Tensor) -> drishti_core::Result<PixelBuffer> {
        let data: Vec<u8> = enhanced.as_raw().iter().map(|x| signed_to_byte(*x)).collect();
        PixelBuffer::from_hwc(
            enhanced.height() as usize,
            enhanced.width() as usize,
            data,
            ChannelOrder::Rgb,
        )
    }
}

impl Default for NormalizationBridge {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default())
    }
}
