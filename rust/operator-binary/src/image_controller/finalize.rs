//! Cleanup of everything an Image owns outside of Kubernetes.
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::core::v1::Secret,
    kube::{
        ResourceExt,
        api::{Api, DeleteParams, Patch, PatchParams},
    },
};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{IMAGE_CONTROLLER_NAME, lifecycle};
use crate::{
    crd::{BUCKET_INFO_KEY, v1alpha1},
    output_record::{self, OutputRecord},
    storage::{self, ObjectStore},
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to update finalizers of Image [{name}]"))]
    PatchFinalizers {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to get Secret [{name}]"))]
    GetSecret {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to read the output record from Secret [{name}]"))]
    ReadOutputRecord {
        source: output_record::Error,
        name: String,
    },

    #[snafu(display("bucket credentials Secret [{name}] does not exist"))]
    MissingBucketCredentials { name: String },

    #[snafu(display("bucket credentials Secret [{name}] has no {BUCKET_INFO_KEY}"))]
    MissingBucketInfo { name: String },

    #[snafu(display("failed to open the output bucket"))]
    OpenStorage { source: storage::Error },

    #[snafu(display("failed to delete objects {keys:?} from the output bucket"))]
    PurgeIncomplete { keys: Vec<String> },

    #[snafu(display("failed to delete result Secret [{name}]"))]
    DeleteResultSecret {
        source: stackable_operator::kube::Error,
        name: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of deleting a set of objects.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    /// Keys that did not exist (anymore).
    pub missing: Vec<String>,
    pub failed: Vec<(String, storage::Error)>,
}

impl PurgeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|(key, _)| key.clone()).collect()
    }
}

/// Deletes every object in `keys`. A failure for one key does not stop the
/// others from being attempted.
pub async fn purge_objects<'a>(
    store: &dyn ObjectStore,
    keys: impl IntoIterator<Item = &'a str>,
) -> PurgeReport {
    let mut report = PurgeReport::default();

    for key in keys {
        let result = match store.stat(key).await {
            Ok(None) => {
                tracing::debug!(key, "object is already gone");
                report.missing.push(key.to_string());
                continue;
            }
            Ok(Some(info)) => {
                tracing::debug!(key, size = info.size, "deleting object");
                store.delete(key).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                tracing::info!(key, "deleted object");
                report.deleted.push(key.to_string());
            }
            Err(err) => {
                tracing::warn!(
                    key,
                    error = &err as &dyn std::error::Error,
                    "failed to delete object"
                );
                report.failed.push((key.to_string(), err));
            }
        }
    }

    report
}

pub async fn add_finalizer(client: &Client, image: &v1alpha1::Image) -> Result<()> {
    patch_finalizers(client, image, lifecycle::finalizers_with(image)).await
}

pub async fn remove_finalizer(client: &Client, image: &v1alpha1::Image) -> Result<()> {
    patch_finalizers(client, image, lifecycle::finalizers_without(image)).await
}

async fn patch_finalizers(
    client: &Client,
    image: &v1alpha1::Image,
    finalizers: Vec<String>,
) -> Result<()> {
    let namespace = image.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    Api::<v1alpha1::Image>::namespaced(client.as_kube_client(), &namespace)
        .patch(
            &image.name_any(),
            &PatchParams::apply(IMAGE_CONTROLLER_NAME),
            &Patch::Merge(&patch),
        )
        .await
        .with_context(|_| PatchFinalizersSnafu {
            name: image.name_any(),
        })?;
    Ok(())
}

/// Deletes every object recorded in the result Secret of `image`, then the
/// Secret itself.
///
/// Succeeds if nothing is left to delete, so the finalizer can be removed.
/// The Secret is kept as long as any recorded object could not be deleted.
pub async fn purge_outputs(client: &Client, image: &v1alpha1::Image) -> Result<()> {
    let namespace = image.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let result_secret = image.result_secret_name();

    let Some(secret) = client
        .get_opt::<Secret>(&result_secret, &namespace)
        .await
        .context(GetSecretSnafu {
            name: &result_secret,
        })?
    else {
        tracing::debug!(secret = result_secret, "no result Secret, nothing to delete");
        return Ok(());
    };
    let record = OutputRecord::from_secret(&secret).context(ReadOutputRecordSnafu {
        name: &result_secret,
    })?;

    if !record.is_empty() {
        let pending = record.keys().filter(|key| record.is_pending(key)).count();
        tracing::info!(objects = record.len(), pending, "deleting recorded outputs");

        let store = connect(client, image, &namespace).await?;
        let report = purge_objects(store.as_ref(), record.keys()).await;
        tracing::info!(
            deleted = report.deleted.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "purged recorded outputs"
        );

        snafu::ensure!(
            report.is_complete(),
            PurgeIncompleteSnafu {
                keys: report.failed_keys(),
            }
        );
    }

    delete_result_secret(client, &result_secret, &namespace).await
}

async fn delete_result_secret(client: &Client, name: &str, namespace: &str) -> Result<()> {
    tracing::info!(secret = name, "deleting result Secret");
    match Api::<Secret>::namespaced(client.as_kube_client(), namespace)
        .delete(name, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(stackable_operator::kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err).context(DeleteResultSecretSnafu { name }),
    }
}

async fn connect(
    client: &Client,
    image: &v1alpha1::Image,
    namespace: &str,
) -> Result<Box<dyn ObjectStore>> {
    let name = &image.spec.bucket_credentials_secret;
    let secret = client
        .get_opt::<Secret>(name, namespace)
        .await
        .context(GetSecretSnafu { name })?
        .context(MissingBucketCredentialsSnafu { name })?;

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(BUCKET_INFO_KEY))
        .map(|value| value.0.clone())
        .context(MissingBucketInfoSnafu { name })?;

    let info = storage::BucketInfo::from_slice(&raw).context(OpenStorageSnafu)?;
    storage::connect(&info).context(OpenStorageSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn test_purge_deletes_all_keys() {
        let store = MemoryStore::with_objects(["ns/img/tar/a", "ns/img/tar/b"]);

        let report = purge_objects(&store, ["ns/img/tar/a", "ns/img/tar/b"]).await;

        assert!(report.is_complete());
        assert_eq!(report.deleted, vec!["ns/img/tar/a", "ns/img/tar/b"]);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let store = MemoryStore::with_objects(["ns/img/tar/a"]);

        let first = purge_objects(&store, ["ns/img/tar/a", "ns/img/tar/gone"]).await;
        assert!(first.is_complete());
        assert_eq!(first.missing, vec!["ns/img/tar/gone"]);

        let second = purge_objects(&store, ["ns/img/tar/a", "ns/img/tar/gone"]).await;
        assert!(second.is_complete());
        assert!(second.deleted.is_empty());
        assert_eq!(second.missing.len(), 2);
    }

    #[tokio::test]
    async fn test_purge_attempts_every_key() {
        let store = MemoryStore::with_objects(["ns/img/tar/a", "ns/img/tar/b", "ns/img/tar/c"])
            .failing_on("ns/img/tar/b");

        let report =
            purge_objects(&store, ["ns/img/tar/a", "ns/img/tar/b", "ns/img/tar/c"]).await;

        assert!(!report.is_complete());
        assert_eq!(report.failed_keys(), vec!["ns/img/tar/b"]);
        assert_eq!(report.deleted, vec!["ns/img/tar/a", "ns/img/tar/c"]);
        assert_eq!(store.keys(), vec!["ns/img/tar/b"]);
    }

    #[tokio::test]
    async fn test_pending_keys_are_purged() {
        let store = MemoryStore::with_objects(["ns/img/tar/a", "ns/img/tar/b"]);
        let mut record = OutputRecord::default();
        record.insert("ns/img/tar/a", "https://example.com/a");
        record.insert_pending("ns/img/tar/b");
        record.insert_pending("ns/img/tar/never-written");

        let report = purge_objects(&store, record.keys()).await;

        assert!(report.is_complete());
        assert_eq!(report.deleted, vec!["ns/img/tar/a", "ns/img/tar/b"]);
        assert_eq!(report.missing, vec!["ns/img/tar/never-written"]);
        assert!(store.keys().is_empty());
    }
}
