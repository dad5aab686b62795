//! The `build` subcommand, run inside the builder container of the Job.
//!
//! Builds the image with LinuxKit, uploads every artifact to the object store
//! and records the download URLs in the result Secret of the Image.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu, ensure};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{Api, Patch, PatchParams},
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    crd::ImageFormat,
    naming,
    output_record::{self, OutputRecord},
    storage::{self, BucketInfo, ObjectStore, PRESIGNED_URL_EXPIRY},
};

pub mod linuxkit;

const FIELD_MANAGER: &str = "image-builder";

#[derive(clap::Args, Debug)]
pub struct BuildArgs {
    /// Output format passed to `linuxkit build`.
    #[arg(long, env = "LINUXKIT_FORMAT")]
    pub format: ImageFormat,

    /// Path of the LinuxKit configuration.
    #[arg(long, env = "LINUXKIT_CONFIG")]
    pub config: PathBuf,

    /// Path of the `BucketInfo.json` describing the output bucket.
    #[arg(long, env = "STORAGE_CREDENTIALS")]
    pub storage_credentials: PathBuf,

    /// Name of the Secret the output record is written to.
    #[arg(long, env = "K8S_SECRET_NAME")]
    pub secret_name: String,

    /// Name of the Image being built.
    #[arg(long, env = "IMAGE_NAME")]
    pub image_name: String,

    #[arg(long, env = "K8S_NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "LINUXKIT_BIN", default_value = "linuxkit")]
    pub linuxkit: PathBuf,

    /// Verbosity set on the container. Log levels themselves are configured
    /// through the telemetry arguments.
    #[arg(long = "v", default_value_t = crate::crd::DEFAULT_VERBOSITY)]
    pub verbosity: u8,
}

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to open the output bucket"))]
    OpenStorage { source: storage::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to get result Secret [{name}]"))]
    GetResultSecret { source: kube::Error, name: String },

    #[snafu(display("failed to read the output record from Secret [{name}]"))]
    ReadRecord {
        source: output_record::Error,
        name: String,
    },

    #[snafu(display("failed to prepare output directory"))]
    CreateOutputDir { source: std::io::Error },

    #[snafu(display("failed to build image"))]
    Build { source: linuxkit::Error },

    #[snafu(display("failed to upload artifact [{key}]"))]
    Upload { source: storage::Error, key: String },

    #[snafu(display("failed to presign artifact [{key}]"))]
    Presign { source: storage::Error, key: String },

    #[snafu(display("upload was cancelled"))]
    Cancelled,

    #[snafu(display("failed to encode the output record"))]
    EncodeRecord { source: output_record::Error },

    #[snafu(display("failed to persist the output record"))]
    PersistRecord { source: kube::Error },

    #[snafu(display(
        "{failure}; additionally failed to persist the partial output record: {persist}"
    ))]
    PersistAfterFailure {
        failure: Box<Error>,
        persist: Box<Error>,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Where the output record ends up.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist(&self, record: &OutputRecord) -> Result<()>;
}

/// The result Secret holding `record`.
///
/// It has no owner reference: the record has to outlive the Image until its
/// finalizer has deleted the recorded objects, and the finalizer then deletes
/// the Secret itself.
pub fn result_secret(namespace: &str, name: &str, record: &OutputRecord) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMetaBuilder::new()
            .name(name)
            .namespace(namespace)
            .build(),
        data: Some(record.to_secret_data().context(EncodeRecordSnafu)?),
        ..Secret::default()
    })
}

pub struct SecretSink {
    api: Api<Secret>,
    namespace: String,
    secret_name: String,
}

#[async_trait]
impl RecordSink for SecretSink {
    async fn persist(&self, record: &OutputRecord) -> Result<()> {
        let secret = result_secret(&self.namespace, &self.secret_name, record)?;

        tracing::debug!(
            secret = self.secret_name,
            objects = record.len(),
            "persisting output record"
        );
        self.api
            .patch(
                &self.secret_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .context(PersistRecordSnafu)?;
        Ok(())
    }
}

pub async fn run(args: BuildArgs, cancel: CancellationToken) -> Result<()> {
    tracing::info!(
        image = args.image_name,
        namespace = args.namespace,
        format = %args.format,
        verbosity = args.verbosity,
        "starting build"
    );

    let bucket = BucketInfo::from_path(&args.storage_credentials).context(OpenStorageSnafu)?;
    let store = storage::connect(&bucket).context(OpenStorageSnafu)?;

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let secrets = Api::<Secret>::namespaced(client, &args.namespace);

    // Entries of earlier builds stay, the finalizer still has to delete them.
    let previous = match secrets
        .get_opt(&args.secret_name)
        .await
        .context(GetResultSecretSnafu {
            name: &args.secret_name,
        })? {
        Some(secret) => OutputRecord::from_secret(&secret).context(ReadRecordSnafu {
            name: &args.secret_name,
        })?,
        None => OutputRecord::default(),
    };
    tracing::debug!(objects = previous.len(), "read previous output record");

    let sink = SecretSink {
        api: secrets,
        namespace: args.namespace.clone(),
        secret_name: args.secret_name.clone(),
    };

    let output_dir = tempfile::tempdir().context(CreateOutputDirSnafu)?;
    let artifacts = linuxkit::build(
        &args.linuxkit,
        args.format,
        &args.config,
        output_dir.path(),
        &cancel,
    )
    .await
    .context(BuildSnafu)?;
    tracing::info!(artifacts = artifacts.len(), "build finished");

    let record = publish(
        store.as_ref(),
        &sink,
        previous,
        &artifacts,
        |file| naming::object_key(&args.namespace, &args.image_name, &args.format.to_string(), file),
        &cancel,
    )
    .await?;

    tracing::info!(
        objects = record.len(),
        secret = args.secret_name,
        "build published"
    );
    Ok(())
}

/// Uploads every artifact on top of the `previous` record.
///
/// Each key is persisted before its object is written and persisted again
/// with the download URL once the upload is done. If publishing fails after
/// the record changed, it is persisted once more so no written object is lost
/// track of.
pub async fn publish(
    store: &dyn ObjectStore,
    sink: &dyn RecordSink,
    previous: OutputRecord,
    artifacts: &[linuxkit::Artifact],
    object_key: impl Fn(&str) -> String,
    cancel: &CancellationToken,
) -> Result<OutputRecord> {
    let mut record = previous.clone();

    match publish_all(store, sink, artifacts, &object_key, cancel, &mut record).await {
        Ok(()) => Ok(record),
        Err(failure) if record == previous => Err(failure),
        Err(failure) => match sink.persist(&record).await {
            Ok(()) => Err(failure),
            Err(persist) => PersistAfterFailureSnafu {
                failure: Box::new(failure),
                persist: Box::new(persist),
            }
            .fail(),
        },
    }
}

async fn publish_all(
    store: &dyn ObjectStore,
    sink: &dyn RecordSink,
    artifacts: &[linuxkit::Artifact],
    object_key: &impl Fn(&str) -> String,
    cancel: &CancellationToken,
    record: &mut OutputRecord,
) -> Result<()> {
    for artifact in artifacts {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);

        let key = object_key(&artifact.name);
        record.insert_pending(key.clone());
        sink.persist(record).await?;

        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
            url = upload(store, &key, &artifact.path, artifact.size) => url?,
        };
        record.insert(key, url);
        sink.persist(record).await?;
    }
    Ok(())
}

async fn upload(store: &dyn ObjectStore, key: &str, path: &Path, size: u64) -> Result<String> {
    tracing::info!(key, size, "uploading artifact");
    store
        .put(key, path, size)
        .await
        .context(UploadSnafu { key })?;
    store
        .presigned_url(key, PRESIGNED_URL_EXPIRY)
        .await
        .context(PresignSnafu { key })
}
