//! Access to the object store build artifacts are uploaded to.
//!
//! The store is described by a COSI `BucketInfo.json`, only S3 buckets with
//! key authentication are supported.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

#[cfg(test)]
pub mod memory;
pub mod s3;

/// Lifetime of the download URLs handed out for build artifacts.
pub const PRESIGNED_URL_EXPIRY: Duration = Duration::from_secs(5 * 24 * 60 * 60);

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to read bucket description from {}", path.display()))]
    ReadBucketInfo {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse bucket description"))]
    ParseBucketInfo { source: serde_json::Error },

    #[snafu(display("bucket protocols {protocols:?} do not include s3"))]
    UnsupportedProtocol { protocols: Vec<String> },

    #[snafu(display("bucket authentication type [{authentication_type}] is not supported"))]
    UnsupportedAuthenticationType { authentication_type: String },

    #[snafu(display("bucket description has no secretS3"))]
    MissingS3Secret,

    #[snafu(display("failed to {operation} object [{key}]"))]
    Request {
        source: Box<dyn std::error::Error + Send + Sync>,
        operation: &'static str,
        key: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `path` of `size` bytes under `key`.
    async fn put(&self, key: &str, path: &Path, size: u64) -> Result<()>;

    /// Downloads `key` into a new file at `path` and returns the number of
    /// bytes written.
    async fn get(&self, key: &str, path: &Path) -> Result<u64>;

    /// Returns `None` if there is no object under `key`.
    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// A URL granting read access to `key` for `expiry`.
    async fn presigned_url(&self, key: &str, expiry: Duration) -> Result<String>;
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BucketInfo {
    pub spec: BucketInfoSpec,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfoSpec {
    pub bucket_name: String,
    #[serde(default)]
    pub authentication_type: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub secret_s3: Option<S3Secret>,
}

#[derive(Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Secret {
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub access_secret_key: String,
}

impl std::fmt::Debug for S3Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Secret")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl BucketInfo {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context(ParseBucketInfoSnafu)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).context(ReadBucketInfoSnafu { path })?;
        Self::from_slice(&raw)
    }

    /// The S3 settings, if the bucket is usable by us.
    pub fn s3(&self) -> Result<&S3Secret> {
        let spec = &self.spec;
        ensure!(
            spec.protocols.iter().any(|p| p.eq_ignore_ascii_case("s3")),
            UnsupportedProtocolSnafu {
                protocols: spec.protocols.clone(),
            }
        );
        ensure!(
            spec.authentication_type.eq_ignore_ascii_case("key"),
            UnsupportedAuthenticationTypeSnafu {
                authentication_type: spec.authentication_type.clone(),
            }
        );
        spec.secret_s3.as_ref().context(MissingS3SecretSnafu)
    }
}

/// Opens the store described by `info`.
pub fn connect(info: &BucketInfo) -> Result<Box<dyn ObjectStore>> {
    let secret = info.s3()?;
    tracing::debug!(
        bucket = info.spec.bucket_name,
        endpoint = secret.endpoint,
        "connecting to S3 bucket"
    );
    Ok(Box::new(s3::S3Store::new(&info.spec.bucket_name, secret)))
}
