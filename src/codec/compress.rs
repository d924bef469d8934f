//! Compression adapter for stored payloads
//!
//! The compressed stream does not carry the original length; callers persist
//! it next to the payload and hand it back on decompression, where it is
//! checked against what the codec produced.

use super::texture::JpegCodec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lossless byte-stream codec for generic payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec { level: 3 }
    }
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }

    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::encode_all(raw, self.level)?)
    }

    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if data.is_empty() {
            return empty_payload(expected_len);
        }
        let raw = zstd::decode_all(data)?;
        check_length(raw, expected_len)
    }
}

/// Codec bound to a blob table
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PayloadCodec {
    Zstd(ZstdCodec),
    Jpeg(JpegCodec),
}

impl Default for PayloadCodec {
    fn default() -> Self {
        PayloadCodec::Zstd(ZstdCodec::default())
    }
}

impl PayloadCodec {
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Zstd(codec) => codec.compress(raw),
            PayloadCodec::Jpeg(codec) => codec.compress(raw),
        }
    }

    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Zstd(codec) => codec.decompress(data, expected_len),
            PayloadCodec::Jpeg(codec) => codec.decompress(data, expected_len),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PayloadCodec::Zstd(_) => "zstd",
            PayloadCodec::Jpeg(_) => "jpeg",
        }
    }
}

pub(super) fn empty_payload(expected_len: usize) -> Result<Vec<u8>> {
    if expected_len == 0 {
        Ok(Vec::new())
    } else {
        Err(Error::Corrupt(format!(
            "Empty payload declared {} uncompressed bytes",
            expected_len
        )))
    }
}

pub(super) fn check_length(raw: Vec<u8>, expected_len: usize) -> Result<Vec<u8>> {
    if raw.len() != expected_len {
        return Err(Error::Corrupt(format!(
            "Decompressed {} bytes, expected {}",
            raw.len(),
            expected_len
        )));
    }
    Ok(raw)
}
