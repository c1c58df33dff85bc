/// Repository configuration derived from the storage-integration relation.
///
/// The relation hands over a flat string map; this module validates the
/// required parameters, applies defaults for the optional ones, and
/// normalizes everything before the values are used as object-key prefixes.
/// Extra slash symbols are cleaned up to avoid issues on 3rd-party storages
/// like Ceph Object Gateway (RadosGW).
use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{EngineError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const DEFAULT_URI_STYLE: &str = "host";
pub const DEFAULT_RETENTION_DAYS: u64 = 9_999_999;

const REQUIRED_PARAMETERS: [&str; 3] = ["bucket", "access-key", "secret-key"];

/// Connection parameters for one S3-compatible repository.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Endpoint URL, right-stripped of `/`.
    pub endpoint: String,
    pub region: String,
    /// Key prefix inside the bucket, normalized to `/<inner>`.
    pub path: String,
    /// `host` or `path` URI addressing.
    pub uri_style: String,
    /// Retention horizon, enforced by external tooling.
    pub delete_older_than_days: u64,
    /// Optional PEM-encoded CA chain for the endpoint.
    pub tls_ca_chain: Option<String>,
}

impl RepositoryConfig {
    /// Build a configuration from the relation's connection data.
    ///
    /// Fails with [`EngineError::MissingConfiguration`] naming the absent
    /// required parameters. A required parameter that is present but blank
    /// counts as absent.
    pub fn from_connection_info(info: &BTreeMap<String, String>) -> Result<Self> {
        let missing: Vec<String> = REQUIRED_PARAMETERS
            .iter()
            .filter(|key| info.get(**key).is_none_or(|v| v.trim().is_empty()))
            .map(|key| (*key).to_string())
            .collect();
        if !missing.is_empty() {
            warn!(
                missing = ?missing,
                "missing required S3 parameters in relation with S3 integrator"
            );
            return Err(EngineError::MissingConfiguration(missing));
        }

        let trimmed = |key: &str| info.get(key).map(|v| v.trim().to_string());

        let endpoint = trimmed("endpoint")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();
        let path = format!(
            "/{}",
            trimmed("path").unwrap_or_default().trim_matches('/')
        );
        let bucket = trimmed("bucket")
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();
        let delete_older_than_days = trimmed("delete-older-than-days")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let tls_ca_chain = trimmed("tls-ca-chain").filter(|v| !v.is_empty());

        Ok(Self {
            bucket,
            access_key: trimmed("access-key").unwrap_or_default(),
            secret_key: trimmed("secret-key").unwrap_or_default(),
            endpoint,
            region: trimmed("region").unwrap_or_default(),
            path,
            uri_style: trimmed("s3-uri-style")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_URI_STYLE.to_string()),
            delete_older_than_days,
            tls_ca_chain,
        })
    }

    /// Join `suffix` onto the configured path prefix, yielding a bucket-
    /// relative object key with no leading slash.
    pub fn object_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), suffix)
            .trim_start_matches('/')
            .to_string()
    }

    pub fn path_style(&self) -> bool {
        self.uri_style == "path"
    }
}
