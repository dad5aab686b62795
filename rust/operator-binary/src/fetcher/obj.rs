//! Downloads bucket objects into the staging volume of a data source.
use std::{
    collections::BTreeMap,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;

use crate::{
    crd::DEFAULT_ITEM_MODE,
    fetcher_config::{File, ObjFetcher},
    storage::{self, BucketInfo, ObjectStore},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to open the bucket"))]
    OpenStorage { source: storage::Error },

    #[snafu(display("failed to read key listing {}", path.display()))]
    ReadKeys {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("key listing {} contains an empty key", path.display()))]
    EmptyKey { path: PathBuf },

    #[snafu(display("key [{key}] does not end in a usable file name"))]
    InvalidFileName { key: String },

    #[snafu(display("target path [{path}] of key [{key}] leaves the mount point"))]
    InvalidTargetPath { key: String, path: String },

    #[snafu(display("mode {mode:o} of key [{key}] is not a file mode"))]
    InvalidMode { key: String, mode: i32 },

    #[snafu(display("failed to create directory {}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to download object [{key}]"))]
    Download { source: storage::Error, key: String },

    #[snafu(display("failed to set the mode of {}", path.display()))]
    SetMode {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("fetch was cancelled"))]
    Cancelled,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Fetches every object of `entry` and returns how many were written.
pub async fn fetch(entry: &ObjFetcher, cancel: &CancellationToken) -> Result<usize> {
    let bucket =
        BucketInfo::from_path(Path::new(&entry.credentials_path)).context(OpenStorageSnafu)?;
    let store = storage::connect(&bucket).context(OpenStorageSnafu)?;

    let files = files_to_fetch(entry)?;
    fetch_objects(
        store.as_ref(),
        Path::new(&entry.mount_point),
        &files,
        cancel,
    )
    .await
}

/// The explicit keys of `entry` plus the keys of its listing. Explicit keys
/// keep their path and mode if they are listed as well.
pub fn files_to_fetch(entry: &ObjFetcher) -> Result<BTreeMap<String, File>> {
    let mut files = entry.keys.clone();
    if let Some(keys_path) = &entry.keys_path {
        for (key, file) in load_keys(Path::new(keys_path))? {
            files.entry(key).or_insert(file);
        }
    }
    Ok(files)
}

/// Reads every file in `dir` as a listing of object keys.
///
/// A listing holds one key per line; anything after a `=` is ignored. Each
/// object is written to the base name of its key.
pub fn load_keys(dir: &Path) -> Result<BTreeMap<String, File>> {
    let mut keys = BTreeMap::new();

    let entries = std::fs::read_dir(dir).context(ReadKeysSnafu { path: dir })?;
    for entry in entries {
        let path = entry.context(ReadKeysSnafu { path: dir })?.path();
        // also skips the `..data` indirection of Secret volumes
        if path.is_dir() {
            continue;
        }

        let content = std::fs::read_to_string(&path).context(ReadKeysSnafu { path: &path })?;
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let key = line.split_once('=').map_or(line, |(key, _)| key).trim();
            ensure!(!key.is_empty(), EmptyKeySnafu { path: &path });

            let file_name = Path::new(key)
                .file_name()
                .and_then(|name| name.to_str())
                .context(InvalidFileNameSnafu { key })?;
            keys.insert(
                key.to_string(),
                File {
                    path: file_name.to_string(),
                    mode: DEFAULT_ITEM_MODE,
                },
            );
        }
    }

    Ok(keys)
}

/// Downloads every object of `files` below `mount_point`.
pub async fn fetch_objects(
    store: &dyn ObjectStore,
    mount_point: &Path,
    files: &BTreeMap<String, File>,
    cancel: &CancellationToken,
) -> Result<usize> {
    for (key, file) in files {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);

        let target = target_path(mount_point, key, &file.path)?;
        let mode = u32::try_from(file.mode)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .context(InvalidModeSnafu {
                key,
                mode: file.mode,
            })?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(CreateDirSnafu { path: parent })?;
        }
        let size = store
            .get(key, &target)
            .await
            .context(DownloadSnafu { key })?;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
            .await
            .context(SetModeSnafu { path: &target })?;

        tracing::debug!(key, path = %target.display(), size, "fetched object");
    }

    Ok(files.len())
}

fn target_path(mount_point: &Path, key: &str, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    ensure!(
        !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir)),
        InvalidTargetPathSnafu { key, path }
    );
    Ok(mount_point.join(relative))
}
