use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu, ensure};
use stackable_operator::{
    k8s_openapi::api::core::v1::{
        Affinity, ConfigMapVolumeSource, ImageVolumeSource, KeyToPath,
        PersistentVolumeClaimVolumeSource, ResourceRequirements, SecretVolumeSource,
    },
    kube::{CustomResource, ResourceExt},
    kvp::ObjectLabels,
    schemars::{self, JsonSchema},
};
use strum::{AsRefStr, Display, EnumIter, EnumString};

pub const APP_NAME: &str = "image-builder";
pub const OPERATOR_NAME: &str = "image-builder.stackable.tech";
pub const FINALIZER_NAME: &str = "image-builder.stackable.tech/finalizer";
pub const TEMPLATE_HASH_ANNOTATION: &str = "image-builder.stackable.tech/template-hash";

pub const DEFAULT_IMAGE_REPOSITORY: &str = "oci.stackable.tech/sdp";
pub const DEFAULT_VERBOSITY: u8 = 4;
pub const MAX_VERBOSITY: u8 = 10;

/// Key of the COSI bucket description inside a bucket credentials Secret.
pub const BUCKET_INFO_KEY: &str = "BucketInfo.json";
/// Key of the output record inside the result Secret.
pub const OUTPUT_RECORD_KEY: &str = "objects.json";
pub const CONFIGURATION_KEY: &str = "image.yaml";
pub const FETCHER_CONFIG_KEY: &str = "fetcher.json";

pub const CREDENTIALS_DIR: &str = "/credentials";
pub const CONFIG_DIR: &str = "/config";
pub const TEMP_DIR: &str = "/tmp";
pub const FETCHER_CONFIG_DIR: &str = "/etc/fetcher";
pub const OBJ_FETCHER_DIR: &str = "/etc/objfetcher";
pub const GIT_FETCHER_DIR: &str = "/etc/gitfetcher";

pub const DEFAULT_GIT_REF: &str = "main";
pub const DEFAULT_ITEM_MODE: i32 = 0o755;

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("additionalData [{name}] declares no data source"))]
    NoDataSource { name: String },

    #[snafu(display(
        "additionalData [{name}] declares more than one data source: {sources:?}"
    ))]
    MultipleDataSources {
        name: String,
        sources: Vec<&'static str>,
    },

    #[snafu(display("bucket data source of additionalData [{name}] has no credentials"))]
    MissingBucketCredentials { name: String },

    #[snafu(display("additionalData name [{name}] is used more than once"))]
    DuplicateDataName { name: String },

    #[snafu(display("verbosity {verbosity} of the {stage} container exceeds {MAX_VERBOSITY}"))]
    VerbosityOutOfRange { stage: &'static str, verbosity: u8 },

    #[snafu(display("bucketCredentialsSecret must not be empty"))]
    MissingOutputCredentials,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Output formats supported by `linuxkit build`.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ImageFormat {
    #[serde(rename = "aws")]
    #[strum(serialize = "aws")]
    Aws,
    #[serde(rename = "docker")]
    #[strum(serialize = "docker")]
    Docker,
    #[serde(rename = "dynamic-vhd")]
    #[strum(serialize = "dynamic-vhd")]
    DynamicVhd,
    #[serde(rename = "gcp")]
    #[strum(serialize = "gcp")]
    Gcp,
    #[serde(rename = "iso-bios")]
    #[strum(serialize = "iso-bios")]
    IsoBios,
    #[serde(rename = "iso-efi")]
    #[strum(serialize = "iso-efi")]
    IsoEfi,
    #[serde(rename = "iso-efi-initrd")]
    #[strum(serialize = "iso-efi-initrd")]
    IsoEfiInitrd,
    #[serde(rename = "kernel+initrd")]
    #[strum(serialize = "kernel+initrd")]
    KernelInitrd,
    #[serde(rename = "kernel+iso")]
    #[strum(serialize = "kernel+iso")]
    KernelIso,
    #[serde(rename = "kernel+squashfs")]
    #[strum(serialize = "kernel+squashfs")]
    KernelSquashfs,
    #[serde(rename = "qcow2-bios")]
    #[strum(serialize = "qcow2-bios")]
    Qcow2Bios,
    #[serde(rename = "qcow2-efi")]
    #[strum(serialize = "qcow2-efi")]
    Qcow2Efi,
    #[serde(rename = "raw-bios")]
    #[strum(serialize = "raw-bios")]
    RawBios,
    #[serde(rename = "raw-efi")]
    #[strum(serialize = "raw-efi")]
    RawEfi,
    #[serde(rename = "rpi3")]
    #[strum(serialize = "rpi3")]
    Rpi3,
    #[serde(rename = "tar")]
    #[strum(serialize = "tar")]
    Tar,
    #[serde(rename = "tar-kernel-initrd")]
    #[strum(serialize = "tar-kernel-initrd")]
    TarKernelInitrd,
    #[serde(rename = "vhd")]
    #[strum(serialize = "vhd")]
    Vhd,
    #[serde(rename = "vmdk")]
    #[strum(serialize = "vmdk")]
    Vmdk,
}

pub mod v1alpha1 {
    use super::*;

    /// A LinuxKit image build. This resource is managed by the Stackable operator for image builds.
    ///
    /// The operator runs a one-shot Job that fetches the declared additional data, builds the
    /// image in the requested format and uploads the artifacts into the bucket referenced by
    /// `bucketCredentialsSecret`.
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[kube(
        group = "image-builder.stackable.tech",
        version = "v1alpha1",
        kind = "Image",
        plural = "images",
        status = "ImageStatus",
        namespaced,
        printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
        crates(
            kube_core = "stackable_operator::kube::core",
            k8s_openapi = "stackable_operator::k8s_openapi",
            schemars = "stackable_operator::schemars"
        )
    )]
    #[serde(rename_all = "camelCase")]
    pub struct ImageSpec {
        /// Settings of the container running `linuxkit build`.
        #[serde(default)]
        pub builder: ContainerConfig,

        /// Settings of the init container fetching object store data.
        #[serde(default)]
        pub obj_fetcher: ContainerConfig,

        /// Settings of the init container cloning git repositories.
        #[serde(default)]
        pub git_fetcher: ContainerConfig,

        /// Scheduling constraints of the build Pod, applied as is.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub affinity: Option<Affinity>,

        /// The output format of the image.
        pub format: ImageFormat,

        /// The LinuxKit configuration (YAML) describing the image.
        pub configuration: String,

        /// Name of the Secret the build writes its output record into.
        /// Defaults to the name of the Image.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub result_secret: Option<String>,

        /// Name of the Secret containing the `BucketInfo.json` of the bucket the
        /// artifacts are uploaded to.
        pub bucket_credentials_secret: String,

        /// Additional data made available to the build.
        #[serde(default)]
        pub additional_data: Vec<AdditionalData>,
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Whether the image has been built successfully at least once.
    #[serde(default)]
    pub ready: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// The container image to use. Defaults to the image shipped with the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Log verbosity of the container, between 0 and 10.
    #[serde(default = "ContainerConfig::default_verbosity")]
    pub verbosity: u8,

    /// Compute resources of the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl ContainerConfig {
    fn default_verbosity() -> u8 {
        DEFAULT_VERBOSITY
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: None,
            verbosity: DEFAULT_VERBOSITY,
            resources: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalData {
    /// Unique name of the data, also used as the Volume name.
    pub name: String,

    /// Where the data is mounted inside the builder container.
    pub volume_mount_point: String,

    /// Exactly one data source must be set.
    #[serde(flatten)]
    pub source: DataSourceSpec,
}

/// The available sources for additional data.
///
/// ConfigMaps, Secrets, images and PersistentVolumeClaims are mounted directly.
/// Buckets and git repositories are fetched by an init container into an
/// emptyDir shared with the builder.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<PersistentVolumeClaimVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketDataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepository>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketDataSource {
    /// Name of the Secret containing the `BucketInfo.json` of the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    /// Objects to fetch, by key, and the path relative to the mount point they are written to.
    #[serde(default)]
    pub items: Vec<KeyToPath>,

    /// Name of a Secret listing additional object keys, one `key` or `key = <presigned URL>`
    /// per line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_secret: Option<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    /// URL of the repository.
    pub repository: String,

    /// Branch, tag or commit to check out. Defaults to `main`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Name of a Secret holding credentials for the repository, either of type
    /// `kubernetes.io/basic-auth`, `kubernetes.io/ssh-auth` or `Opaque` with a `gitconfig` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

/// A validated data source, exactly one per [`AdditionalData`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DataSource<'a> {
    ConfigMap(&'a ConfigMapVolumeSource),
    Secret(&'a SecretVolumeSource),
    Image(&'a ImageVolumeSource),
    Volume(&'a PersistentVolumeClaimVolumeSource),
    Bucket {
        credentials_secret: &'a str,
        items: &'a [KeyToPath],
        items_secret: Option<&'a str>,
    },
    GitRepository(&'a GitRepository),
}

impl AdditionalData {
    pub fn data_source(&self) -> Result<DataSource<'_>> {
        let spec = &self.source;
        let mut sources = Vec::new();

        if let Some(cm) = &spec.config_map {
            sources.push(("configMap", DataSource::ConfigMap(cm)));
        }
        if let Some(secret) = &spec.secret {
            sources.push(("secret", DataSource::Secret(secret)));
        }
        if let Some(image) = &spec.image {
            sources.push(("image", DataSource::Image(image)));
        }
        if let Some(volume) = &spec.volume {
            sources.push(("volume", DataSource::Volume(volume)));
        }
        if let Some(bucket) = &spec.bucket {
            let credentials_secret = bucket
                .credentials_secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .with_context(|| MissingBucketCredentialsSnafu {
                    name: self.name.clone(),
                })?;
            sources.push((
                "bucket",
                DataSource::Bucket {
                    credentials_secret,
                    items: &bucket.items,
                    items_secret: bucket.items_secret.as_deref(),
                },
            ));
        }
        if let Some(git) = &spec.git_repository {
            sources.push(("gitRepository", DataSource::GitRepository(git)));
        }

        ensure!(
            sources.len() <= 1,
            MultipleDataSourcesSnafu {
                name: self.name.clone(),
                sources: sources.iter().map(|(kind, _)| *kind).collect::<Vec<_>>(),
            }
        );
        sources
            .pop()
            .map(|(_, source)| source)
            .context(NoDataSourceSnafu {
                name: self.name.clone(),
            })
    }
}

impl v1alpha1::Image {
    /// Name of the Secret holding the output record of the build.
    pub fn result_secret_name(&self) -> String {
        self.spec
            .result_secret
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// Checks everything about the spec that the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.spec.bucket_credentials_secret.is_empty(),
            MissingOutputCredentialsSnafu
        );

        for (stage, config) in [
            ("builder", &self.spec.builder),
            ("objFetcher", &self.spec.obj_fetcher),
            ("gitFetcher", &self.spec.git_fetcher),
        ] {
            ensure!(
                config.verbosity <= MAX_VERBOSITY,
                VerbosityOutOfRangeSnafu {
                    stage,
                    verbosity: config.verbosity,
                }
            );
        }

        let mut names = std::collections::BTreeSet::new();
        for data in &self.spec.additional_data {
            ensure!(
                names.insert(data.name.as_str()),
                DuplicateDataNameSnafu {
                    name: data.name.clone(),
                }
            );
            data.data_source()?;
        }
        Ok(())
    }
}

/// Creates recommended `ObjectLabels` to be used in deployed resources
pub fn build_recommended_labels<'a, T>(
    owner: &'a T,
    controller_name: &'a str,
    app_version: &'a str,
    role: &'a str,
    role_group: &'a str,
) -> ObjectLabels<'a, T> {
    ObjectLabels {
        owner,
        app_name: APP_NAME,
        app_version,
        operator_name: OPERATOR_NAME,
        controller_name,
        role,
        role_group,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use indoc::indoc;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    fn parse(input: &str) -> v1alpha1::Image {
        let deserializer = serde_yaml::Deserializer::from_str(input);
        serde_yaml::with::singleton_map_recursive::deserialize(deserializer).unwrap()
    }

    fn additional_data(input: &str) -> AdditionalData {
        serde_yaml::from_str(input).unwrap()
    }

    #[test]
    fn test_image_defaults() {
        let image = parse(indoc! {"
            apiVersion: image-builder.stackable.tech/v1alpha1
            kind: Image
            metadata:
              name: simple
              namespace: default
            spec:
              format: iso-efi
              configuration: 'a: 1'
              bucketCredentialsSecret: bucket
        "});

        assert_eq!(image.spec.format, ImageFormat::IsoEfi);
        assert_eq!(image.spec.builder, ContainerConfig::default());
        assert_eq!(image.spec.builder.verbosity, DEFAULT_VERBOSITY);
        assert_eq!(image.spec.git_fetcher.image, None);
        assert!(image.spec.additional_data.is_empty());
        assert_eq!(image.result_secret_name(), "simple");
        assert_eq!(image.status, None);
        assert_eq!(image.validate(), Ok(()));
    }

    #[test]
    fn test_result_secret_override() {
        let image = parse(indoc! {"
            apiVersion: image-builder.stackable.tech/v1alpha1
            kind: Image
            metadata:
              name: simple
            spec:
              format: tar
              configuration: ''
              resultSecret: downloads
              bucketCredentialsSecret: bucket
            status:
              ready: true
        "});

        assert_eq!(image.result_secret_name(), "downloads");
        assert_eq!(image.status, Some(ImageStatus { ready: true }));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let result = serde_yaml::from_str::<v1alpha1::ImageSpec>(indoc! {"
            format: floppy
            configuration: ''
            bucketCredentialsSecret: bucket
        "});
        assert!(result.is_err());
    }

    #[test]
    fn test_format_names_round_trip() {
        assert_eq!(ImageFormat::iter().count(), 19);
        for format in ImageFormat::iter() {
            let json = serde_json::to_string(&format).unwrap();
            assert_eq!(json, format!("\"{format}\""));
            assert_eq!(ImageFormat::from_str(format.as_ref()), Ok(format));
        }
        assert_eq!(ImageFormat::KernelInitrd.to_string(), "kernel+initrd");
        assert_eq!(ImageFormat::Qcow2Efi.to_string(), "qcow2-efi");
    }

    #[test]
    fn test_bucket_data_source() {
        let data = additional_data(indoc! {"
            name: firmware
            volumeMountPoint: /firmware
            bucket:
              credentialsSecret: firmware-bucket
              items:
                - key: blobs/fw.bin
                  path: fw.bin
        "});

        match data.data_source().unwrap() {
            DataSource::Bucket {
                credentials_secret,
                items,
                items_secret,
            } => {
                assert_eq!(credentials_secret, "firmware-bucket");
                assert_eq!(items.len(), 1);
                assert_eq!(items_secret, None);
            }
            other => panic!("expected a bucket, got {other:?}"),
        }
    }

    #[test]
    fn test_git_data_source() {
        let data = additional_data(indoc! {"
            name: sources
            volumeMountPoint: /src
            gitRepository:
              repository: https://github.com/linuxkit/linuxkit
              ref: v1.5.0
        "});

        let DataSource::GitRepository(git) = data.data_source().unwrap() else {
            panic!("expected a git repository");
        };
        assert_eq!(git.reference.as_deref(), Some("v1.5.0"));
        assert_eq!(git.credentials_secret, None);
    }

    #[rstest]
    #[case(
        "name: empty\nvolumeMountPoint: /empty\n",
        Error::NoDataSource { name: "empty".to_string() }
    )]
    #[case(
        "name: both\nvolumeMountPoint: /both\nsecret:\n  secretName: s\ngitRepository:\n  repository: https://example.com/repo.git\n",
        Error::MultipleDataSources { name: "both".to_string(), sources: vec!["secret", "gitRepository"] }
    )]
    #[case(
        "name: anonymous\nvolumeMountPoint: /data\nbucket: {}\n",
        Error::MissingBucketCredentials { name: "anonymous".to_string() }
    )]
    fn test_invalid_data_sources(#[case] input: &str, #[case] expected: Error) {
        assert_eq!(additional_data(input).data_source(), Err(expected));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let image = parse(indoc! {"
            apiVersion: image-builder.stackable.tech/v1alpha1
            kind: Image
            metadata:
              name: simple
            spec:
              format: raw-efi
              configuration: ''
              bucketCredentialsSecret: bucket
              additionalData:
                - name: data
                  volumeMountPoint: /a
                  secret:
                    secretName: a
                - name: data
                  volumeMountPoint: /b
                  secret:
                    secretName: b
        "});

        assert_eq!(
            image.validate(),
            Err(Error::DuplicateDataName {
                name: "data".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_excessive_verbosity() {
        let image = parse(indoc! {"
            apiVersion: image-builder.stackable.tech/v1alpha1
            kind: Image
            metadata:
              name: simple
            spec:
              format: raw-efi
              configuration: ''
              bucketCredentialsSecret: bucket
              gitFetcher:
                verbosity: 11
        "});

        assert_eq!(
            image.validate(),
            Err(Error::VerbosityOutOfRange {
                stage: "gitFetcher",
                verbosity: 11
            })
        );
    }
}
