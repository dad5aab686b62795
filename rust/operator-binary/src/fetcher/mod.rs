//! The `objfetch` and `gitfetch` subcommands, run as init containers of the
//! build Job.
//!
//! Each stage reads the fetcher configuration rendered by the operator and
//! materializes its entries into the staging volumes shared with the builder.
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;

use crate::fetcher_config::{self, FetchConfig};

pub mod git;
pub mod obj;

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Path of the fetcher configuration.
    #[arg(long, env = "FETCHER_CONFIG")]
    pub config: PathBuf,

    /// Verbosity set on the container. Log levels themselves are configured
    /// through the telemetry arguments.
    #[arg(long = "v", default_value_t = crate::crd::DEFAULT_VERBOSITY)]
    pub verbosity: u8,
}

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read fetcher configuration from {}", path.display()))]
    ReadConfig {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("invalid fetcher configuration"))]
    ParseConfig { source: fetcher_config::Error },

    #[snafu(display("{failed} of {total} {stage} entries failed"))]
    Incomplete {
        stage: &'static str,
        failed: usize,
        total: usize,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Reads the fetcher configuration. The operator only mounts one if there is
/// something to fetch, so a missing file is an empty configuration.
pub fn load_config(path: &Path) -> Result<FetchConfig> {
    match std::fs::read(path) {
        Ok(raw) => FetchConfig::from_slice(&raw).context(ParseConfigSnafu),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no fetcher configuration, nothing to fetch");
            Ok(FetchConfig::default())
        }
        Err(err) => Err(err).context(ReadConfigSnafu { path }),
    }
}

/// Downloads the objects of every `objfetcher` entry. A failing entry does
/// not stop the others.
pub async fn run_obj_fetch(args: FetchArgs, cancel: CancellationToken) -> Result<()> {
    tracing::info!(config = %args.config.display(), verbosity = args.verbosity, "starting objfetcher");
    let config = load_config(&args.config)?;

    let mut total = 0;
    let mut failed = 0;
    for entry in config.obj_fetchers() {
        total += 1;
        match obj::fetch(entry, &cancel).await {
            Ok(objects) => {
                tracing::info!(mount_point = entry.mount_point, objects, "fetched objects")
            }
            Err(err) => {
                failed += 1;
                tracing::error!(
                    mount_point = entry.mount_point,
                    error = &err as &dyn std::error::Error,
                    "failed to fetch objects"
                );
            }
        }
    }

    ensure!(
        failed == 0,
        IncompleteSnafu {
            stage: "objfetcher",
            failed,
            total,
        }
    );
    Ok(())
}

/// Clones the repository of every `gitfetcher` entry. A failing entry does
/// not stop the others.
pub async fn run_git_fetch(
    args: FetchArgs,
    git_binary: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(config = %args.config.display(), verbosity = args.verbosity, "starting gitfetcher");
    let config = load_config(&args.config)?;

    let mut total = 0;
    let mut failed = 0;
    for entry in config.git_fetchers() {
        total += 1;
        match git::fetch(git_binary, entry, &cancel).await {
            Ok(()) => tracing::info!(
                repository = entry.repository,
                mount_point = entry.mount_point,
                "cloned repository"
            ),
            Err(err) => {
                failed += 1;
                tracing::error!(
                    repository = entry.repository,
                    mount_point = entry.mount_point,
                    error = &err as &dyn std::error::Error,
                    "failed to clone repository"
                );
            }
        }
    }

    ensure!(
        failed == 0,
        IncompleteSnafu {
            stage: "gitfetcher",
            failed,
            total,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("fetcher.json")).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetcher.json");
        std::fs::write(&path, "fetchers: []").unwrap();

        assert!(matches!(load_config(&path), Err(Error::ParseConfig { .. })));
    }

    #[tokio::test]
    async fn test_failing_entries_fail_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetcher.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"fetchers":[
                    {{"objfetcher":{{"mountPoint":"{0}/a","credentialsPath":"{0}/missing.json","keys":{{}}}}}},
                    {{"objfetcher":{{"mountPoint":"{0}/b","credentialsPath":"{0}/missing.json","keys":{{}}}}}}
                ]}}"#,
                dir.path().display()
            ),
        )
        .unwrap();

        let err = run_obj_fetch(
            FetchArgs {
                config: path,
                verbosity: 0,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            Error::Incomplete {
                stage,
                failed,
                total,
            } => {
                assert_eq!(stage, "objfetcher");
                assert_eq!((failed, total), (2, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stage_without_entries_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetcher.json");
        std::fs::write(
            &path,
            r#"{"fetchers":[{"objfetcher":{"mountPoint":"/a","credentialsPath":"/c","keys":{}}}]}"#,
        )
        .unwrap();

        run_git_fetch(
            FetchArgs {
                config: path,
                verbosity: 0,
            },
            Path::new("/nonexistent/git"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }
}
