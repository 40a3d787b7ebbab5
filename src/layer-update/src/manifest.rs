//! Update manifest retrieval and validation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{UpdateError, UpdateResult};
use crate::version::Version;

/// Description of the currently published update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Published version of the target package
    pub version: Version,
    /// Absolute URL of the payload
    pub download_url: String,
    /// Lowercase hex SHA256 of the payload
    pub expected_checksum: String,
    /// Payload size in bytes
    pub payload_size: u64,
    /// Oldest installed version this payload can upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_compatible_version: Option<Version>,
}

/// Manifest document as served by the endpoint.
#[derive(Debug, Deserialize)]
struct WireManifest {
    version: Option<Value>,
    url: Option<String>,
    checksum: Option<String>,
    size: Option<Value>,
    #[serde(rename = "minCompatibleVersion", alias = "min_compatible_version")]
    min_compatible_version: Option<Value>,
}

fn malformed(message: impl Into<String>) -> UpdateError {
    UpdateError::MalformedManifest {
        message: message.into(),
    }
}

impl UpdateManifest {
    /// Parse and validate a manifest document.
    ///
    /// A relative `url` is resolved against `base`, the URL the manifest
    /// was fetched from.
    pub fn from_json(body: &str, base: Option<&Url>) -> UpdateResult<Self> {
        let wire: WireManifest =
            serde_json::from_str(body).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        let version = parse_version_field(
            wire.version
                .as_ref()
                .ok_or_else(|| malformed("missing field `version`"))?,
            "version",
        )?;

        let min_compatible_version = match &wire.min_compatible_version {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_version_field(value, "minCompatibleVersion")?),
        };

        let url = wire.url.ok_or_else(|| malformed("missing field `url`"))?;
        let download_url = resolve_url(url.trim(), base)?;

        let checksum = wire
            .checksum
            .ok_or_else(|| malformed("missing field `checksum`"))?;
        let expected_checksum = normalize_checksum(&checksum)
            .ok_or_else(|| malformed(format!("checksum is not a SHA256 hex digest: {}", checksum)))?;

        let payload_size = wire
            .size
            .as_ref()
            .ok_or_else(|| malformed("missing field `size`"))?
            .as_u64()
            .filter(|size| *size > 0)
            .ok_or_else(|| malformed("`size` must be a positive integer"))?;

        Ok(Self {
            version,
            download_url,
            expected_checksum,
            payload_size,
            min_compatible_version,
        })
    }
}

/// Versions may be published as strings or as bare integer version codes.
fn parse_version_field(value: &Value, field: &str) -> UpdateResult<Version> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        other => return Err(malformed(format!("invalid `{}`: {}", field, other))),
    };
    Version::parse(&text).map_err(|_| malformed(format!("invalid `{}`: {}", field, text)))
}

fn resolve_url(url: &str, base: Option<&Url>) -> UpdateResult<String> {
    let parsed = match (Url::parse(url), base) {
        (Ok(parsed), _) => parsed,
        (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => base
            .join(url)
            .map_err(|e| malformed(format!("invalid `url` {}: {}", url, e)))?,
        (Err(e), _) => return Err(malformed(format!("invalid `url` {}: {}", url, e))),
    };
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.into()),
        scheme => Err(malformed(format!("unsupported URL scheme: {}", scheme))),
    }
}

/// Lowercase a 64-character hex digest, accepting an optional `sha256:` prefix.
fn normalize_checksum(checksum: &str) -> Option<String> {
    let trimmed = checksum.trim();
    let digest = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    (digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| digest.to_ascii_lowercase())
}

/// Source of the current update manifest.
///
/// Implementations apply their own request timeout and never retry; retry
/// policy belongs to the orchestrator.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self) -> UpdateResult<UpdateManifest>;
}

/// Fetches the manifest with a single HTTP GET.
#[derive(Clone)]
pub struct HttpManifestFetcher {
    client: Client,
    manifest_url: Url,
    timeout: Duration,
}

impl HttpManifestFetcher {
    pub fn new(client: Client, manifest_url: &str, timeout: Duration) -> UpdateResult<Self> {
        let manifest_url = Url::parse(manifest_url).map_err(|e| UpdateError::ConfigError {
            message: format!("invalid manifest URL {}: {}", manifest_url, e),
        })?;
        Ok(Self {
            client,
            manifest_url,
            timeout,
        })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self) -> UpdateResult<UpdateManifest> {
        debug!(url = %self.manifest_url, "Fetching update manifest");

        let response = self
            .client
            .get(self.manifest_url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpdateError::Timeout {
                        operation: "Manifest request",
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    UpdateError::ConnectionFailed {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpdateError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        UpdateManifest::from_json(&body, Some(&self.manifest_url))
    }
}
