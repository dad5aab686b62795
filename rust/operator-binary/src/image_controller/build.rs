//! Composes the desired child resources of an [`v1alpha1::Image`].
//!
//! Nothing in here talks to the Kubernetes API, the same Image always
//! yields the same resources.
use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::{configmap::ConfigMapBuilder, meta::ObjectMetaBuilder, pod::volume::VolumeBuilder},
    k8s_openapi::api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMap, Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec,
            SecretVolumeSource, ServiceAccount, Volume, VolumeMount,
        },
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    kube::{
        ResourceExt,
        api::ObjectMeta,
    },
};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{
    IMAGE_CONTROLLER_NAME,
    data_source::{FetchStage, translate},
    types::DesiredResources,
};
use crate::{
    crd::{
        self, BUCKET_INFO_KEY, CONFIG_DIR, CONFIGURATION_KEY, CREDENTIALS_DIR, ContainerConfig,
        DEFAULT_IMAGE_REPOSITORY, FETCHER_CONFIG_DIR, FETCHER_CONFIG_KEY, TEMP_DIR,
        TEMPLATE_HASH_ANNOTATION, build_recommended_labels, v1alpha1,
    },
    fetcher_config::{self, FetchConfig},
    naming,
    util::{env_var, env_var_from_field},
};

pub const BUILDER_ROLE: &str = "builder";
pub const ROLE_GROUP: &str = "default";

pub const BUILDER_CONTAINER_NAME: &str = "builder";
pub const GIT_FETCHER_CONTAINER_NAME: &str = "init-gitfetcher";
pub const OBJ_FETCHER_CONTAINER_NAME: &str = "init-objfetcher";

pub const BUCKET_CREDENTIALS_VOLUME_NAME: &str = "bucket-credentials";
pub const CONFIG_VOLUME_NAME: &str = "config";
pub const TEMP_VOLUME_NAME: &str = "temp";

const VERSION_LABEL: &str = "app.kubernetes.io/version";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Image spec is invalid"))]
    InvalidSpec { source: crd::Error },

    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build object meta data"))]
    ObjectMeta {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build ConfigMap [{name}]"))]
    BuildConfigMap {
        source: stackable_operator::builder::configmap::Error,
        name: String,
    },

    #[snafu(display("failed to render the fetcher configuration"))]
    RenderFetcherConfig { source: fetcher_config::Error },

    #[snafu(display("failed to serialize the Pod template"))]
    SerializePodTemplate { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub fn build_resources(image: &v1alpha1::Image) -> Result<DesiredResources> {
    image.validate().context(InvalidSpecSnafu)?;

    let name = image.name_any();
    let namespace = image.namespace().context(ObjectHasNoNamespaceSnafu)?;

    let service_account = ServiceAccount {
        metadata: child_metadata(image, &name)?,
        ..ServiceAccount::default()
    };
    let role = build_role(image, &name)?;
    let role_binding = build_role_binding(image, &name, &namespace)?;

    let config_name = naming::content_addressed_name(&name, image.spec.configuration.as_bytes());
    let mut config_maps = vec![build_config_map(
        image,
        &config_name,
        CONFIGURATION_KEY,
        image.spec.configuration.clone(),
    )?];

    let mut volumes = vec![
        Volume {
            name: BUCKET_CREDENTIALS_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(image.spec.bucket_credentials_secret.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        VolumeBuilder::new(CONFIG_VOLUME_NAME)
            .with_config_map(&config_name)
            .build(),
        VolumeBuilder::new(TEMP_VOLUME_NAME)
            .empty_dir(EmptyDirVolumeSource::default())
            .build(),
    ];
    let mut builder_mounts = vec![
        mount(BUCKET_CREDENTIALS_VOLUME_NAME, CREDENTIALS_DIR),
        mount(CONFIG_VOLUME_NAME, CONFIG_DIR),
        mount(TEMP_VOLUME_NAME, TEMP_DIR),
    ];
    let mut git_fetcher_mounts = Vec::new();
    let mut obj_fetcher_mounts = Vec::new();
    let mut fetch_config = FetchConfig::default();

    for data in &image.spec.additional_data {
        let translated = translate(data).context(InvalidSpecSnafu)?;
        volumes.extend(translated.volumes);
        builder_mounts.push(translated.main_mount);
        match translated.fetch_stage {
            Some(FetchStage::Git) => git_fetcher_mounts.extend(translated.fetch_mounts),
            Some(FetchStage::Obj) => obj_fetcher_mounts.extend(translated.fetch_mounts),
            None => {}
        }
        fetch_config.fetchers.extend(translated.fetch_entry);
    }

    if !fetch_config.is_empty() {
        let rendered = fetch_config.to_json().context(RenderFetcherConfigSnafu)?;
        let fetch_config_name = naming::content_addressed_name(&name, rendered.as_bytes());
        config_maps.push(build_config_map(
            image,
            &fetch_config_name,
            FETCHER_CONFIG_KEY,
            rendered,
        )?);

        volumes.push(
            VolumeBuilder::new(&fetch_config_name)
                .with_config_map(&fetch_config_name)
                .build(),
        );
        let fetch_config_mount = VolumeMount {
            read_only: Some(true),
            ..mount(&fetch_config_name, FETCHER_CONFIG_DIR)
        };
        git_fetcher_mounts.push(fetch_config_mount.clone());
        obj_fetcher_mounts.push(fetch_config_mount);
    }

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(image, &name)?),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![
                fetcher_container(
                    GIT_FETCHER_CONTAINER_NAME,
                    "gitfetcher",
                    &image.spec.git_fetcher,
                    git_fetcher_mounts,
                ),
                fetcher_container(
                    OBJ_FETCHER_CONTAINER_NAME,
                    "objfetcher",
                    &image.spec.obj_fetcher,
                    obj_fetcher_mounts,
                ),
            ]),
            containers: vec![builder_container(image, builder_mounts)],
            volumes: Some(volumes),
            affinity: image.spec.affinity.clone(),
            service_account_name: Some(name.clone()),
            restart_policy: Some("Never".to_string()),
            ..PodSpec::default()
        }),
    };

    let template_hash = naming::content_digest(
        &serde_json::to_vec(&pod_template).context(SerializePodTemplateSnafu)?,
    );

    let mut job_metadata = child_metadata(image, &name)?;
    job_metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_HASH_ANNOTATION.to_string(), template_hash.clone());

    let job = Job {
        metadata: job_metadata,
        spec: Some(JobSpec {
            template: pod_template,
            backoff_limit: Some(0),
            ..JobSpec::default()
        }),
        status: None,
    };

    Ok(DesiredResources {
        service_account,
        role,
        role_binding,
        config_maps,
        job,
        template_hash,
    })
}

/// Labels of the build Pod. They leave out the operator version, an operator
/// upgrade alone must not change the Pod template and thereby rebuild every
/// Image.
fn pod_labels(image: &v1alpha1::Image, name: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = child_metadata(image, name)?.labels.unwrap_or_default();
    labels.remove(VERSION_LABEL);
    Ok(labels)
}

fn child_metadata(image: &v1alpha1::Image, name: &str) -> Result<ObjectMeta> {
    Ok(ObjectMetaBuilder::new()
        .name_and_namespace(image)
        .name(name)
        .ownerreference_from_resource(image, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu)?
        .with_recommended_labels(build_recommended_labels(
            image,
            IMAGE_CONTROLLER_NAME,
            crate::built_info::PKG_VERSION,
            BUILDER_ROLE,
            ROLE_GROUP,
        ))
        .context(ObjectMetaSnafu)?
        .build())
}

fn build_role(image: &v1alpha1::Image, name: &str) -> Result<Role> {
    Ok(Role {
        metadata: child_metadata(image, name)?,
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: ["create", "delete", "get", "list", "patch", "update", "watch"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..PolicyRule::default()
        }]),
    })
}

fn build_role_binding(image: &v1alpha1::Image, name: &str, namespace: &str) -> Result<RoleBinding> {
    Ok(RoleBinding {
        metadata: child_metadata(image, name)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Subject::default()
        }]),
    })
}

fn build_config_map(
    image: &v1alpha1::Image,
    name: &str,
    key: &str,
    content: String,
) -> Result<ConfigMap> {
    ConfigMapBuilder::new()
        .metadata(child_metadata(image, name)?)
        .add_data(key, content)
        .build()
        .context(BuildConfigMapSnafu { name })
}

fn builder_container(image: &v1alpha1::Image, volume_mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: BUILDER_CONTAINER_NAME.to_string(),
        image: Some(container_image(&image.spec.builder, "image-builder")),
        args: Some(vec![verbosity_arg(&image.spec.builder)]),
        env: Some(vec![
            env_var_from_field("K8S_NAME", "metadata.name"),
            env_var_from_field("K8S_NAMESPACE", "metadata.namespace"),
            env_var("IMAGE_NAME", image.name_any()),
            env_var("K8S_SECRET_NAME", image.result_secret_name()),
            env_var("LINUXKIT_FORMAT", image.spec.format.to_string()),
            env_var("LINUXKIT_CONFIG", format!("{CONFIG_DIR}/{CONFIGURATION_KEY}")),
            env_var(
                "STORAGE_CREDENTIALS",
                format!("{CREDENTIALS_DIR}/{BUCKET_INFO_KEY}"),
            ),
        ]),
        volume_mounts: Some(volume_mounts),
        resources: image.spec.builder.resources.clone(),
        ..Container::default()
    }
}

fn fetcher_container(
    container_name: &str,
    stage: &str,
    config: &ContainerConfig,
    volume_mounts: Vec<VolumeMount>,
) -> Container {
    Container {
        name: container_name.to_string(),
        image: Some(container_image(
            config,
            &format!("image-builder-init-{stage}"),
        )),
        args: Some(vec![verbosity_arg(config)]),
        env: Some(vec![
            env_var_from_field("K8S_NAME", "metadata.name"),
            env_var_from_field("K8S_NAMESPACE", "metadata.namespace"),
            env_var(
                "FETCHER_CONFIG",
                format!("{FETCHER_CONFIG_DIR}/{FETCHER_CONFIG_KEY}"),
            ),
        ]),
        volume_mounts: Some(volume_mounts),
        resources: config.resources.clone(),
        ..Container::default()
    }
}

fn container_image(config: &ContainerConfig, default_name: &str) -> String {
    match &config.image {
        Some(image) if !image.is_empty() => image.clone(),
        _ => format!(
            "{DEFAULT_IMAGE_REPOSITORY}/{default_name}:{}",
            crate::built_info::PKG_VERSION
        ),
    }
}

fn verbosity_arg(config: &ContainerConfig) -> String {
    format!("--v={}", config.verbosity)
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}
