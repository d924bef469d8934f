//! Lossy texture codec
//!
//! Textures are stored as raw square pixel buffers. Their dimensions are not
//! persisted: width = height = sqrt(byte count / channel count), recovered from
//! the uncompressed length recorded next to the payload.

use super::compress::{check_length, empty_payload};
use crate::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use serde::{Deserialize, Serialize};

/// Quality-tunable JPEG codec for square texture tiles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JpegCodec {
    /// 1 (worst) to 100 (best)
    pub quality: u8,
    /// 1 (luma) or 3 (RGB)
    pub channels: u8,
}

impl Default for JpegCodec {
    fn default() -> Self {
        JpegCodec {
            quality: 85,
            channels: 3,
        }
    }
}

/// Side length of a square texture holding `byte_count` bytes
pub fn texture_side(byte_count: usize, channels: usize) -> Result<u32> {
    if channels == 0 || byte_count % channels != 0 {
        return Err(Error::Unsupported(format!(
            "Texture of {} bytes is not a whole number of {}-channel pixels",
            byte_count, channels
        )));
    }
    let pixels = byte_count / channels;
    let side = (pixels as f64).sqrt().round() as usize;
    if side * side != pixels || side > u32::MAX as usize {
        return Err(Error::Unsupported(format!(
            "Texture of {} pixels is not square",
            pixels
        )));
    }
    Ok(side as u32)
}

impl JpegCodec {
    pub fn new(quality: u8, channels: u8) -> Self {
        JpegCodec { quality, channels }
    }

    fn color_type(&self) -> Result<ExtendedColorType> {
        match self.channels {
            1 => Ok(ExtendedColorType::L8),
            3 => Ok(ExtendedColorType::Rgb8),
            other => Err(Error::Unsupported(format!(
                "JPEG textures need 1 or 3 channels, got {}",
                other
            ))),
        }
    }

    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let color = self.color_type()?;
        let side = texture_side(raw.len(), self.channels as usize)?;
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality.clamp(1, 100));
        encoder.encode(raw, side, side, color)?;
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if data.is_empty() {
            return empty_payload(expected_len);
        }
        self.color_type()?;
        let side = texture_side(expected_len, self.channels as usize)?;
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?;
        if image.width() != side || image.height() != side {
            return Err(Error::Corrupt(format!(
                "Texture decoded as {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                side,
                side
            )));
        }
        let raw = if self.channels == 1 {
            image.into_luma8().into_raw()
        } else {
            image.into_rgb8().into_raw()
        };
        check_length(raw, expected_len)
    }
}
