use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use snafu::{ResultExt, Snafu, ensure};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::crd::ImageFormat;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to start {}", binary.to_string_lossy()))]
    Spawn {
        source: std::io::Error,
        binary: OsString,
    },

    #[snafu(display("failed to wait for linuxkit"))]
    Wait { source: std::io::Error },

    #[snafu(display("linuxkit build failed with {status}: {stderr}"))]
    BuildFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[snafu(display("linuxkit build was cancelled"))]
    Cancelled,

    #[snafu(display("failed to read build output {}", path.display()))]
    ReadOutput {
        source: std::io::Error,
        path: PathBuf,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A file produced by `linuxkit build`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Runs `linuxkit build` and returns every file it wrote into `output_dir`.
///
/// The process is killed when `cancel` fires.
pub async fn build(
    binary: &Path,
    format: ImageFormat,
    config: &Path,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<Artifact>> {
    let child = Command::new(binary)
        .arg("build")
        .arg("--format")
        .arg(format.to_string())
        .arg("--dir")
        .arg(output_dir)
        .arg(config)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context(SpawnSnafu {
            binary: binary.as_os_str(),
        })?;

    tracing::info!(%format, config = %config.display(), "running linuxkit build");
    let output = tokio::select! {
        output = child.wait_with_output() => output.context(WaitSnafu)?,
        _ = cancel.cancelled() => return CancelledSnafu.fail(),
    };

    if !output.stdout.is_empty() {
        tracing::debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            "linuxkit output"
        );
    }
    ensure!(
        output.status.success(),
        BuildFailedSnafu {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    );

    collect_artifacts(output_dir)
}

/// All regular files below `dir`, ordered by path. Artifacts are named by
/// their path relative to `dir`, so equally named files in different
/// directories stay distinct.
pub fn collect_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).context(ReadOutputSnafu { path: &current })?;
        for entry in entries {
            let entry = entry.context(ReadOutputSnafu { path: &current })?;
            let path = entry.path();
            let metadata = entry.metadata().context(ReadOutputSnafu { path: &path })?;
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() {
                artifacts.push(Artifact {
                    name: artifact_name(dir, &path),
                    path,
                    size: metadata.len(),
                });
            }
        }
    }

    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}

fn artifact_name(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("linuxkit");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_build_collects_artifacts() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let binary = script(
            bin_dir.path(),
            r#"mkdir -p "$5/nested"
printf 'abc' > "$5/image-efi.iso"
printf 'xy' > "$5/nested/image.sha256""#,
        );

        let artifacts = build(
            &binary,
            ImageFormat::IsoEfi,
            Path::new("/config/image.yaml"),
            out_dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            artifacts,
            vec![
                Artifact {
                    name: "image-efi.iso".to_string(),
                    path: out_dir.path().join("image-efi.iso"),
                    size: 3,
                },
                Artifact {
                    name: "nested/image.sha256".to_string(),
                    path: out_dir.path().join("nested/image.sha256"),
                    size: 2,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_build_passes_arguments() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let binary = script(bin_dir.path(), r#"echo "$@" > "$5/args""#);

        build(
            &binary,
            ImageFormat::KernelInitrd,
            Path::new("/config/image.yaml"),
            out_dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let args = std::fs::read_to_string(out_dir.path().join("args")).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "build --format kernel+initrd --dir {} /config/image.yaml",
                out_dir.path().display()
            )
        );
    }

    #[tokio::test]
    async fn test_build_failure_carries_stderr() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let binary = script(bin_dir.path(), "echo 'no kernel in config' >&2\nexit 3");

        let err = build(
            &binary,
            ImageFormat::Tar,
            Path::new("/config/image.yaml"),
            out_dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            Error::BuildFailed { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "no kernel in config");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let out_dir = tempfile::tempdir().unwrap();
        let err = build(
            Path::new("/nonexistent/linuxkit"),
            ImageFormat::Tar,
            Path::new("/config/image.yaml"),
            out_dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_build() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let binary = script(bin_dir.path(), "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = build(
            &binary,
            ImageFormat::Tar,
            Path::new("/config/image.yaml"),
            out_dir.path(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_equally_named_files_stay_distinct() {
        let out_dir = tempfile::tempdir().unwrap();
        for sub in ["amd64", "arm64"] {
            std::fs::create_dir(out_dir.path().join(sub)).unwrap();
            std::fs::write(out_dir.path().join(sub).join("kernel"), "k").unwrap();
        }

        let artifacts = collect_artifacts(out_dir.path()).unwrap();
        let names = artifacts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["amd64/kernel", "arm64/kernel"]);

        let keys = names
            .iter()
            .map(|name| crate::naming::object_key("ns", "img", "kernel+initrd", name))
            .collect::<Vec<_>>();
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_collect_empty_dir() {
        let out_dir = tempfile::tempdir().unwrap();
        assert!(collect_artifacts(out_dir.path()).unwrap().is_empty());
    }
}
