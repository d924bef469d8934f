//! Byte transports for streaming store files
//!
//! Files are addressed by key:
//! ```text
//! master.bin            index header and group catalog
//! groups/<id>.bin       one node group
//! points/<id>.bin       one node's points
//! ```

use super::config::TransportConfig;
#[cfg(feature = "http")]
use super::config::Auth;
use crate::model::BlockId;
use crate::{Error, Result};
use bytes::Bytes;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

pub const MASTER_KEY: &str = "master.bin";

pub fn group_key(group: u64) -> String {
    format!("groups/{}.bin", group)
}

pub fn points_key(node: BlockId) -> String {
    format!("points/{}.bin", node.raw())
}

/// Keyed byte storage behind a streaming store
pub trait Transport: Send + Sync {
    /// Contents under `key`, `None` when nothing is stored there
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Replace the contents under `key`
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Remove `key`; `false` when it did not exist
    fn delete(&self, key: &str) -> Result<bool>;

    /// Human-readable location for logs
    fn describe(&self) -> String;

    fn read_master(&self) -> Result<Option<Bytes>> {
        self.get(MASTER_KEY)
    }

    fn write_master(&self, data: &[u8]) -> Result<()> {
        self.put(MASTER_KEY, data)
    }

    /// A group file; absence is an error since the catalog lists it
    fn read_group(&self, group: u64) -> Result<Bytes> {
        let key = group_key(group);
        self.get(&key)?
            .ok_or_else(|| Error::NotFound(format!("{} in {}", key, self.describe())))
    }

    fn write_group(&self, group: u64, data: &[u8]) -> Result<()> {
        self.put(&group_key(group), data)
    }

    fn read_points(&self, node: BlockId) -> Result<Option<Bytes>> {
        self.get(&points_key(node))
    }

    fn write_points(&self, node: BlockId, data: &[u8]) -> Result<()> {
        self.put(&points_key(node), data)
    }

    fn delete_points(&self, node: BlockId) -> Result<bool> {
        self.delete(&points_key(node))
    }
}

/// Build the transport described by `config`
pub fn connect(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config {
        TransportConfig::FileSystem { root } => Ok(Box::new(FileTransport::new(root)?)),
        #[cfg(feature = "http")]
        TransportConfig::Http {
            base_url,
            auth,
            timeout_secs,
            retries,
        } => Ok(Box::new(HttpTransport::new(
            base_url,
            auth.clone(),
            *timeout_secs,
            *retries,
        )?)),
        #[cfg(feature = "http")]
        TransportConfig::CloudBlob {
            container_url,
            sas_token,
            timeout_secs,
            retries,
        } => Ok(Box::new(HttpTransport::cloud_blob(
            container_url,
            sas_token,
            *timeout_secs,
            *retries,
        )?)),
        #[cfg(not(feature = "http"))]
        _ => Err(Error::Unsupported(
            "HTTP transports need the `http` feature".into(),
        )),
    }
}

/// Files under a local directory
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileTransport { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Transport for FileTransport {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        trace!(key, bytes = data.len(), "file_transport.put");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::blocking::{Client, RequestBuilder, Response};
    use reqwest::StatusCode;
    use std::time::Duration;
    use tracing::{debug, warn};

    /// Files behind an HTTP endpoint or cloud blob container
    pub struct HttpTransport {
        base_url: String,
        /// Appended to every URL (shared-access signature)
        query: Option<String>,
        auth: Auth,
        /// Sent with uploads, e.g. the blob type of a cloud container
        upload_headers: Vec<(&'static str, &'static str)>,
        retries: u32,
        client: Client,
    }

    impl HttpTransport {
        pub fn new(base_url: &str, auth: Auth, timeout_secs: u64, retries: u32) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?;
            Ok(HttpTransport {
                base_url: base_url.trim_end_matches('/').to_string(),
                query: None,
                auth,
                upload_headers: Vec::new(),
                retries,
                client,
            })
        }

        /// A blob container authorized by a shared-access signature
        pub fn cloud_blob(
            container_url: &str,
            sas_token: &str,
            timeout_secs: u64,
            retries: u32,
        ) -> Result<Self> {
            let mut transport = Self::new(container_url, Auth::None, timeout_secs, retries)?;
            transport.query = Some(sas_token.trim_start_matches('?').to_string());
            transport.upload_headers = vec![("x-ms-blob-type", "BlockBlob")];
            Ok(transport)
        }

        fn url(&self, key: &str) -> String {
            match &self.query {
                Some(query) => format!("{}/{}?{}", self.base_url, key, query),
                None => format!("{}/{}", self.base_url, key),
            }
        }

        fn add_auth(&self, builder: RequestBuilder) -> RequestBuilder {
            match &self.auth {
                Auth::Bearer(token) => builder.header("Authorization", format!("Bearer {}", token)),
                Auth::ApiKey(key) => builder.header("x-api-key", key),
                Auth::None => builder,
            }
        }

        /// Send a request, retrying connection failures and server errors
        fn send(&self, key: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
            let mut attempt = 0;
            loop {
                let outcome = self.add_auth(build()).send();
                let retryable = match &outcome {
                    Ok(resp) => resp.status().is_server_error(),
                    Err(err) => err.is_connect() || err.is_timeout(),
                };
                if !retryable || attempt >= self.retries {
                    return outcome.map_err(|e| Error::Transport(format!("{}: {}", key, e)));
                }
                attempt += 1;
                let backoff = Duration::from_millis(100 << attempt.min(6));
                warn!(key, attempt, backoff_ms = backoff.as_millis() as u64, "http_transport.retry");
                std::thread::sleep(backoff);
            }
        }

        fn failure(key: &str, resp: Response) -> Error {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            Error::Transport(format!("{}: HTTP {}: {}", key, status, text))
        }
    }

    impl Transport for HttpTransport {
        fn get(&self, key: &str) -> Result<Option<Bytes>> {
            let url = self.url(key);
            let resp = self.send(key, || self.client.get(&url))?;
            match resp.status() {
                status if status.is_success() => {
                    let data = resp
                        .bytes()
                        .map_err(|e| Error::Transport(format!("{}: {}", key, e)))?;
                    debug!(key, bytes = data.len(), "http_transport.get");
                    Ok(Some(data))
                }
                StatusCode::NOT_FOUND => Ok(None),
                _ => Err(Self::failure(key, resp)),
            }
        }

        fn put(&self, key: &str, data: &[u8]) -> Result<()> {
            let url = self.url(key);
            let resp = self.send(key, || {
                let mut builder = self.client.put(&url).body(data.to_vec());
                for (name, value) in &self.upload_headers {
                    builder = builder.header(*name, *value);
                }
                builder
            })?;
            if resp.status().is_success() {
                debug!(key, bytes = data.len(), "http_transport.put");
                Ok(())
            } else {
                Err(Self::failure(key, resp))
            }
        }

        fn delete(&self, key: &str) -> Result<bool> {
            let url = self.url(key);
            let resp = self.send(key, || self.client.delete(&url))?;
            match resp.status() {
                status if status.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                _ => Err(Self::failure(key, resp)),
            }
        }

        fn describe(&self) -> String {
            self.base_url.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_cloud_urls_carry_signature() {
            let transport = HttpTransport::cloud_blob(
                "https://acct.blob.core.windows.net/mesh/",
                "?sv=2024&sig=x",
                5,
                0,
            )
            .unwrap();
            assert_eq!(
                transport.url(&group_key(4)),
                "https://acct.blob.core.windows.net/mesh/groups/4.bin?sv=2024&sig=x"
            );
            assert_eq!(transport.describe(), "https://acct.blob.core.windows.net/mesh");
        }

        #[test]
        fn test_unreachable_host_is_transport_error() {
            let transport = HttpTransport::new("http://127.0.0.1:9", Auth::None, 1, 0).unwrap();
            assert!(matches!(
                transport.get(MASTER_KEY),
                Err(Error::Transport(_))
            ));
        }
    }
}
