//! Options shared by the relational stores
//!
//! Stored as pretty JSON next to the index when persisted, with environment
//! overrides for deployments that cannot ship a config file.

use crate::codec::{JpegCodec, PayloadCodec, ZstdCodec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How a store reacts when another connection holds the file lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail immediately with [`Error::Busy`]
    FailFast,
    /// Retry for up to `millis`, then fail with [`Error::Busy`]
    Timeout { millis: u64 },
    /// Retry until the lock is released. Only suitable for a single writer
    /// on a desktop; a service must use a timeout.
    RetryForever,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Timeout { millis: 5_000 }
    }
}

impl BusyPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            BusyPolicy::FailFast => Some(Duration::ZERO),
            BusyPolicy::Timeout { millis } => Some(Duration::from_millis(*millis)),
            BusyPolicy::RetryForever => None,
        }
    }
}

/// Options for the relational tile stores
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(default)]
    pub busy: BusyPolicy,
    /// zstd level for generic payloads
    pub compression_level: i32,
    /// JPEG quality for textures
    pub texture_quality: u8,
    /// Channels per texture pixel (1 or 3)
    pub texture_channels: u8,
    /// Diffset writes buffered before a commit
    pub diffset_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            busy: BusyPolicy::default(),
            compression_level: 3,
            texture_quality: 85,
            texture_channels: 3,
            diffset_batch_size: 64,
        }
    }
}

impl StoreOptions {
    /// Load options from a JSON file, defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let options: StoreOptions = serde_json::from_str(&content)?;
            options.validate()?;
            Ok(options)
        } else {
            Ok(Self::default())
        }
    }

    /// Save options as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `SMSTORE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(level) = env_parse("SMSTORE_COMPRESSION_LEVEL")? {
            options.compression_level = level;
        }
        if let Some(quality) = env_parse("SMSTORE_TEXTURE_QUALITY")? {
            options.texture_quality = quality;
        }
        if let Some(batch) = env_parse("SMSTORE_DIFFSET_BATCH")? {
            options.diffset_batch_size = batch;
        }
        if let Some(millis) = env_parse::<u64>("SMSTORE_BUSY_TIMEOUT_MS")? {
            options.busy = BusyPolicy::Timeout { millis };
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.texture_quality) {
            return Err(Error::Config(format!(
                "texture_quality must be within 1..=100, got {}",
                self.texture_quality
            )));
        }
        if !matches!(self.texture_channels, 1 | 3) {
            return Err(Error::Config(format!(
                "texture_channels must be 1 or 3, got {}",
                self.texture_channels
            )));
        }
        if self.diffset_batch_size == 0 {
            return Err(Error::Config("diffset_batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn payload_codec(&self) -> PayloadCodec {
        PayloadCodec::Zstd(ZstdCodec::new(self.compression_level))
    }

    pub fn texture_codec(&self) -> PayloadCodec {
        PayloadCodec::Jpeg(JpegCodec::new(self.texture_quality, self.texture_channels))
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
