use std::{path::Path, time::Duration};

use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Builder, Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
};
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use super::{ObjectInfo, ObjectStore, RequestSnafu, Result, S3Secret};

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(bucket: &str, secret: &S3Secret) -> Self {
        let credentials = Credentials::new(
            &secret.access_key_id,
            &secret.access_secret_key,
            None,
            None,
            "BucketInfo",
        );
        let region = if secret.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            secret.region.clone()
        };

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .endpoint_url(endpoint_url(&secret.endpoint))
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }
}

/// COSI endpoints may omit the scheme, those are reached via HTTPS.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, path: &Path, size: u64) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "read",
                key,
            })?;

        tracing::debug!(key, size, bucket = self.bucket, "uploading object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(i64::try_from(size).unwrap_or(i64::MAX))
            .body(body)
            .send()
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "upload",
                key,
            })?;
        Ok(())
    }

    async fn get(&self, key: &str, path: &Path) -> Result<u64> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "download",
                key,
            })?;

        let mut file = tokio::fs::File::create(path)
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "write",
                key,
            })?;
        let mut body = output.body.into_async_read();
        let written = tokio::io::copy(&mut body, &mut file)
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "download",
                key,
            })?;
        file.flush().await.boxed().context(RequestSnafu {
            operation: "write",
            key,
        })?;

        tracing::debug!(key, size = written, bucket = self.bucket, "downloaded object");
        Ok(written)
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectInfo {
                size: output
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok()),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(err).boxed().context(RequestSnafu {
                operation: "stat",
                key,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "delete",
                key,
            })?;
        Ok(())
    }

    async fn presigned_url(&self, key: &str, expiry: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expiry)
            .boxed()
            .context(RequestSnafu {
                operation: "presign",
                key,
            })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "presign",
                key,
            })?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("minio.minio.svc:9000", "https://minio.minio.svc:9000")]
    #[case("http://localhost:9000", "http://localhost:9000")]
    #[case("https://s3.eu-central-1.amazonaws.com", "https://s3.eu-central-1.amazonaws.com")]
    fn test_endpoint_url(#[case] endpoint: &str, #[case] expected: &str) {
        assert_eq!(endpoint_url(endpoint), expected);
    }
}
