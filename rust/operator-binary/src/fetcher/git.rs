//! Shallow clones of git repositories into the staging volume of a data
//! source.
//!
//! Credentials come from a mounted Secret: `password` (with an optional
//! `username`) for HTTP basic auth, `ssh-privatekey` for SSH and `gitconfig`
//! for any further git configuration.
use std::{
    fmt,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use snafu::{ResultExt, Snafu, ensure};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::fetcher_config::GitFetcher;

const DEFAULT_USERNAME: &str = "gitfetcher";

const USERNAME_FILE: &str = "username";
const PASSWORD_FILE: &str = "password";
const SSH_PRIVATE_KEY_FILE: &str = "ssh-privatekey";
const GITCONFIG_FILE: &str = "gitconfig";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("credentials directory {} does not exist", path.display()))]
    MissingCredentials { path: PathBuf },

    #[snafu(display("failed to read credential {}", path.display()))]
    ReadCredential {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("credentials in {} configure more than one auth method", path.display()))]
    MultipleAuthMethods { path: PathBuf },

    #[snafu(display("failed to prepare the SSH private key"))]
    PrepareSshKey { source: std::io::Error },

    #[snafu(display("failed to start {}", binary.display()))]
    Spawn {
        source: std::io::Error,
        binary: PathBuf,
    },

    #[snafu(display("failed to wait for git"))]
    Wait { source: std::io::Error },

    #[snafu(display("cloning [{repository}] failed with {status}: {stderr}"))]
    CloneFailed {
        repository: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[snafu(display("clone was cancelled"))]
    Cancelled,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { username: String, password: String },
    SshKey { path: PathBuf },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::SshKey { path } => f.debug_struct("SshKey").field("path", path).finish(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub auth: Option<Auth>,
    pub gitconfig: Option<PathBuf>,
}

impl Credentials {
    /// Reads the credentials mounted at `dir`. An empty path means the
    /// repository is cloned anonymously.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut credentials = Self::default();
        if dir.as_os_str().is_empty() {
            return Ok(credentials);
        }
        ensure!(dir.is_dir(), MissingCredentialsSnafu { path: dir });

        let password = dir.join(PASSWORD_FILE);
        if password.is_file() {
            let username = dir.join(USERNAME_FILE);
            let username = if username.is_file() {
                read_credential(&username)?
            } else {
                DEFAULT_USERNAME.to_string()
            };
            credentials.set_auth(
                dir,
                Auth::Basic {
                    username,
                    password: read_credential(&password)?,
                },
            )?;
        }

        let ssh_key = dir.join(SSH_PRIVATE_KEY_FILE);
        if ssh_key.is_file() {
            credentials.set_auth(dir, Auth::SshKey { path: ssh_key })?;
        }

        let gitconfig = dir.join(GITCONFIG_FILE);
        if gitconfig.is_file() {
            credentials.gitconfig = Some(gitconfig);
        }

        Ok(credentials)
    }

    fn set_auth(&mut self, dir: &Path, auth: Auth) -> Result<()> {
        ensure!(
            self.auth.is_none(),
            MultipleAuthMethodsSnafu { path: dir }
        );
        self.auth = Some(auth);
        Ok(())
    }
}

/// Secret values usually end in a line break that is not part of the value.
fn read_credential(path: &Path) -> Result<String> {
    let value = std::fs::read_to_string(path).context(ReadCredentialSnafu { path })?;
    Ok(value.trim_end_matches(['\r', '\n']).to_string())
}

/// The branch or tag name `git clone --branch` expects.
pub fn branch_name(reference: &str) -> &str {
    reference
        .strip_prefix("refs/heads/")
        .or_else(|| reference.strip_prefix("refs/tags/"))
        .unwrap_or(reference)
}

/// The `git clone` invocation for `entry`.
///
/// `ssh_key` is the private key git should use, which has to be a copy only
/// readable by us if the credentials carry one.
pub fn clone_command(
    git_binary: &Path,
    entry: &GitFetcher,
    credentials: &Credentials,
    ssh_key: Option<&Path>,
) -> Command {
    let mut command = Command::new(git_binary);
    command
        .args(["clone", "--depth", "1", "--single-branch"])
        .args(["--recurse-submodules", "--shallow-submodules"])
        .arg("--branch")
        .arg(branch_name(&entry.reference))
        .arg("--")
        .arg(&entry.repository)
        .arg(&entry.mount_point)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(gitconfig) = &credentials.gitconfig {
        command.env("GIT_CONFIG_GLOBAL", gitconfig);
    }

    match &credentials.auth {
        Some(Auth::Basic { username, password }) => {
            let token = STANDARD.encode(format!("{username}:{password}"));
            command
                .env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", format!("Authorization: Basic {token}"));
        }
        Some(Auth::SshKey { path }) => {
            let key = ssh_key.unwrap_or(path.as_path());
            command.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key.display()
                ),
            );
        }
        None => {}
    }

    command
}

/// Copies the private key at `source` into `dir` with mode 0600, ssh refuses
/// keys that others can read.
pub fn private_key_copy(source: &Path, dir: &Path) -> Result<PathBuf> {
    let target = dir.join("id");
    std::fs::copy(source, &target).context(PrepareSshKeySnafu)?;
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600))
        .context(PrepareSshKeySnafu)?;
    Ok(target)
}

/// Clones the repository of `entry` into its mount point.
pub async fn fetch(git_binary: &Path, entry: &GitFetcher, cancel: &CancellationToken) -> Result<()> {
    let credentials = Credentials::from_dir(Path::new(&entry.credentials_path))?;

    let key_dir = tempfile::tempdir().context(PrepareSshKeySnafu)?;
    let ssh_key = match &credentials.auth {
        Some(Auth::SshKey { path }) => Some(private_key_copy(path, key_dir.path())?),
        _ => None,
    };

    let child = clone_command(git_binary, entry, &credentials, ssh_key.as_deref())
        .spawn()
        .context(SpawnSnafu { binary: git_binary })?;

    tracing::info!(
        repository = entry.repository,
        reference = entry.reference,
        mount_point = entry.mount_point,
        auth = ?credentials.auth,
        "cloning repository"
    );
    let output = tokio::select! {
        output = child.wait_with_output() => output.context(WaitSnafu)?,
        _ = cancel.cancelled() => return CancelledSnafu.fail(),
    };

    ensure!(
        output.status.success(),
        CloneFailedSnafu {
            repository: &entry.repository,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    );
    Ok(())
}
