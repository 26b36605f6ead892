// Wire image encoding: JPEG, then standard base64
// Uploads go the other way: base64 JPEG back to RGB pixels

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};

use crate::error::{Result, TransportError};
use drishti_core::{ChannelOrder, PixelBuffer};
use drishti_eye::bridge::to_rgb_image;

/// Encodes frames for `RAW_FRAME.image` and `payload.image_data`.
#[derive(Debug, Clone, Copy)]
pub struct ImageEncoder {
    quality: u8,
}

impl ImageEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode_rgb(&self, image: &RgbImage) -> Result<String> {
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
        encoder.encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;
        Ok(STANDARD.encode(jpeg))
    }

    /// Channel order is normalised to RGB before encoding.
    pub fn encode_pixels(&self, pixels: &PixelBuffer) -> Result<String> {
        let image = to_rgb_image(pixels).map_err(|e| TransportError::Encode(e.reason))?;
        self.encode_rgb(&image)
    }
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(80)
    }
}

/// Decode a compressed image (JPEG in practice) into RGB pixels.
pub fn decode_image(bytes: &[u8]) -> Result<PixelBuffer> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| TransportError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    PixelBuffer::from_hwc(
        height as usize,
        width as usize,
        image.into_raw(),
        ChannelOrder::Rgb,
    )
    .map_err(|e| TransportError::Decode(e.to_string()))
}

/// Decode a base64 JPEG as sent by the upload socket.
pub fn decode_base64_image(encoded: &str) -> Result<PixelBuffer> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TransportError::Decode(format!("invalid base64: {}", e)))?;
    decode_image(&bytes)
}
