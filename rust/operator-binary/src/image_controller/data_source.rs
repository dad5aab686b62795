//! Translates one [`AdditionalData`] into Volumes, mounts and an optional
//! entry of the fetcher configuration.
use std::collections::BTreeMap;

use stackable_operator::k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, SecretVolumeSource, Volume, VolumeMount,
};

use crate::{
    crd::{
        self, AdditionalData, BUCKET_INFO_KEY, DEFAULT_GIT_REF, DEFAULT_ITEM_MODE, DataSource,
        GIT_FETCHER_DIR, OBJ_FETCHER_DIR,
    },
    fetcher_config::{File, Fetcher, GitFetcher, ObjFetcher},
    naming,
};

pub const OBJ_CREDENTIALS_SUFFIX: &str = "objcreds";
pub const ITEMS_SUFFIX: &str = "items";
pub const GIT_CREDENTIALS_SUFFIX: &str = "gitcreds";

/// The init container that has to materialize a data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStage {
    Git,
    Obj,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranslatedDataSource {
    pub volumes: Vec<Volume>,
    /// Mount of the data into the builder container.
    pub main_mount: VolumeMount,
    /// Mounts of the init container named by `fetch_stage`.
    pub fetch_mounts: Vec<VolumeMount>,
    pub fetch_stage: Option<FetchStage>,
    pub fetch_entry: Option<Fetcher>,
}

pub fn translate(data: &AdditionalData) -> Result<TranslatedDataSource, crd::Error> {
    let main_mount = VolumeMount {
        name: data.name.clone(),
        mount_path: data.volume_mount_point.clone(),
        ..VolumeMount::default()
    };

    let translated = match data.data_source()? {
        DataSource::ConfigMap(source) => direct(
            Volume {
                name: data.name.clone(),
                config_map: Some(source.clone()),
                ..Volume::default()
            },
            main_mount,
        ),
        DataSource::Secret(source) => direct(
            Volume {
                name: data.name.clone(),
                secret: Some(source.clone()),
                ..Volume::default()
            },
            main_mount,
        ),
        DataSource::Image(source) => direct(
            Volume {
                name: data.name.clone(),
                image: Some(source.clone()),
                ..Volume::default()
            },
            main_mount,
        ),
        DataSource::Volume(source) => direct(
            Volume {
                name: data.name.clone(),
                persistent_volume_claim: Some(source.clone()),
                ..Volume::default()
            },
            main_mount,
        ),
        DataSource::Bucket {
            credentials_secret,
            items,
            items_secret,
        } => {
            let mut volumes = vec![staging_volume(&data.name)];
            let mut fetch_mounts = vec![main_mount.clone()];

            let credentials = naming::volume_name(&data.name, OBJ_CREDENTIALS_SUFFIX);
            let credentials_dir = format!("{OBJ_FETCHER_DIR}/{credentials}");
            volumes.push(secret_volume(&credentials, credentials_secret));
            fetch_mounts.push(read_only_mount(&credentials, &credentials_dir));

            let keys_path = items_secret.map(|items_secret| {
                let listing = naming::volume_name(&data.name, ITEMS_SUFFIX);
                let listing_dir = format!("{OBJ_FETCHER_DIR}/{listing}");
                volumes.push(secret_volume(&listing, items_secret));
                fetch_mounts.push(read_only_mount(&listing, &listing_dir));
                listing_dir
            });

            let keys = items
                .iter()
                .map(|item| {
                    (
                        item.key.clone(),
                        File {
                            path: item.path.clone(),
                            mode: item.mode.unwrap_or(DEFAULT_ITEM_MODE),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>();

            TranslatedDataSource {
                volumes,
                main_mount,
                fetch_mounts,
                fetch_stage: Some(FetchStage::Obj),
                fetch_entry: Some(Fetcher {
                    git_fetcher: None,
                    obj_fetcher: Some(ObjFetcher {
                        mount_point: data.volume_mount_point.clone(),
                        credentials_path: format!("{credentials_dir}/{BUCKET_INFO_KEY}"),
                        keys_path,
                        keys,
                    }),
                }),
            }
        }
        DataSource::GitRepository(git) => {
            let mut volumes = vec![staging_volume(&data.name)];
            let mut fetch_mounts = vec![main_mount.clone()];

            let credentials_path = match &git.credentials_secret {
                Some(secret) if !secret.is_empty() => {
                    let credentials = naming::volume_name(&data.name, GIT_CREDENTIALS_SUFFIX);
                    let credentials_dir = format!("{GIT_FETCHER_DIR}/{credentials}");
                    volumes.push(secret_volume(&credentials, secret));
                    fetch_mounts.push(read_only_mount(&credentials, &credentials_dir));
                    credentials_dir
                }
                _ => String::new(),
            };

            TranslatedDataSource {
                volumes,
                main_mount,
                fetch_mounts,
                fetch_stage: Some(FetchStage::Git),
                fetch_entry: Some(Fetcher {
                    git_fetcher: Some(GitFetcher {
                        mount_point: data.volume_mount_point.clone(),
                        credentials_path,
                        repository: git.repository.clone(),
                        reference: git
                            .reference
                            .clone()
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| DEFAULT_GIT_REF.to_string()),
                    }),
                    obj_fetcher: None,
                }),
            }
        }
    };

    Ok(translated)
}

fn direct(volume: Volume, main_mount: VolumeMount) -> TranslatedDataSource {
    TranslatedDataSource {
        volumes: vec![volume],
        main_mount,
        fetch_mounts: Vec::new(),
        fetch_stage: None,
        fetch_entry: None,
    }
}

fn staging_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    }
}
