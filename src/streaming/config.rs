//! Streaming store configuration

use crate::config::env_parse;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Credentials sent with HTTP requests
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Auth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `x-api-key: <key>`
    ApiKey(String),
    #[default]
    None,
}

/// Where the group, master and point files live
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// A local or mounted directory
    FileSystem { root: PathBuf },
    /// A plain HTTP endpoint accepting GET/PUT/DELETE under `base_url`
    Http {
        base_url: String,
        #[serde(default)]
        auth: Auth,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default = "default_retries")]
        retries: u32,
    },
    /// A cloud blob container addressed with a shared-access signature
    CloudBlob {
        container_url: String,
        sas_token: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default = "default_retries")]
        retries: u32,
    },
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

/// Rules deciding when the current group is sealed
///
/// A node joins the open group unless adding it would break one of these
/// limits; a group always holds at least one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Serialized size of one group file
    pub max_group_bytes: usize,
    /// Nodes per group
    pub max_members: usize,
    /// Difference between the deepest and shallowest level in one group
    pub max_depth_span: u64,
    /// Levels between any member and the common ancestor of the group
    #[serde(default)]
    pub max_ancestor_distance: Option<u64>,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        GroupingConfig {
            max_group_bytes: 1 << 20,
            max_members: 512,
            max_depth_span: 3,
            max_ancestor_distance: None,
        }
    }
}

/// Configuration of a [`StreamingGroupStore`](super::StreamingGroupStore)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    /// Decoded groups kept in memory
    #[serde(default = "default_cache_groups")]
    pub cache_groups: usize,
    /// zstd level for point files
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_cache_groups() -> usize {
    64
}

fn default_compression_level() -> i32 {
    3
}

impl StreamingConfig {
    /// Store rooted in a local directory, default grouping
    pub fn file_system(root: impl Into<PathBuf>) -> Self {
        StreamingConfig {
            transport: TransportConfig::FileSystem { root: root.into() },
            grouping: GroupingConfig::default(),
            cache_groups: default_cache_groups(),
            compression_level: default_compression_level(),
        }
    }

    pub fn with_grouping(mut self, grouping: GroupingConfig) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StreamingConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build from `SMSTORE_STREAM_*` environment variables
    ///
    /// `SMSTORE_STREAM_SAS` selects a cloud container at `SMSTORE_STREAM_URL`,
    /// a bare URL selects plain HTTP (with `SMSTORE_STREAM_TOKEN` as bearer
    /// token), otherwise `SMSTORE_STREAM_ROOT` names a directory.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SMSTORE_STREAM_URL").ok();
        let transport = match (url, std::env::var("SMSTORE_STREAM_SAS").ok()) {
            (Some(container_url), Some(sas_token)) => TransportConfig::CloudBlob {
                container_url,
                sas_token,
                timeout_secs: env_parse("SMSTORE_STREAM_TIMEOUT_SECS")?
                    .unwrap_or_else(default_timeout_secs),
                retries: default_retries(),
            },
            (Some(base_url), None) => TransportConfig::Http {
                base_url,
                auth: std::env::var("SMSTORE_STREAM_TOKEN")
                    .map(Auth::Bearer)
                    .unwrap_or_default(),
                timeout_secs: env_parse("SMSTORE_STREAM_TIMEOUT_SECS")?
                    .unwrap_or_else(default_timeout_secs),
                retries: default_retries(),
            },
            (None, _) => {
                let root = std::env::var("SMSTORE_STREAM_ROOT").map_err(|_| {
                    Error::Config(
                        "Set SMSTORE_STREAM_ROOT or SMSTORE_STREAM_URL to locate the store".into(),
                    )
                })?;
                TransportConfig::FileSystem { root: root.into() }
            }
        };

        let mut config = StreamingConfig {
            transport,
            ..Self::file_system(PathBuf::new())
        };
        if let Some(bytes) = env_parse("SMSTORE_GROUP_BYTES")? {
            config.grouping.max_group_bytes = bytes;
        }
        if let Some(members) = env_parse("SMSTORE_GROUP_MEMBERS")? {
            config.grouping.max_members = members;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grouping.max_members == 0 {
            return Err(Error::Config("max_members must be positive".into()));
        }
        if self.grouping.max_group_bytes == 0 {
            return Err(Error::Config("max_group_bytes must be positive".into()));
        }
        if self.cache_groups == 0 {
            return Err(Error::Config("cache_groups must be positive".into()));
        }
        match &self.transport {
            TransportConfig::Http { base_url: url, .. }
            | TransportConfig::CloudBlob {
                container_url: url, ..
            } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(Error::Config(format!("Not an http(s) URL: {}", url)))
            }
            _ => Ok(()),
        }
    }
}
