use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_PLATFORM: &str = "nano328";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// What to deploy and for which board. Built once from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub local_path: PathBuf,
    pub platform: String,
    pub remote_path: String,
}

impl DeployRequest {
    /// Resolve the target directory to an absolute path and derive the remote
    /// working area `<remote_root>/<basename>` from it.
    pub fn resolve(target: Option<&Path>, platform: &str, remote_root: &str) -> Result<Self> {
        let target = target.ok_or(Error::MissingArgument("target"))?;

        let local_path = fs::canonicalize(target).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::PathNotFound(target.to_path_buf()),
            _ => Error::Io(e),
        })?;

        if !local_path.is_dir() {
            return Err(Error::NotADirectory(local_path));
        }

        let base_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidTarget(local_path.clone()))?;

        let remote_path = format!("{}/{}", remote_root.trim_end_matches('/'), base_name);

        Ok(Self {
            local_path,
            platform: platform.to_string(),
            remote_path,
        })
    }
}

/// Raw connection settings as read from the environment.
#[derive(Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub host: Option<String>,
    pub port: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SessionConfig {
    /// Build a config from a variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            host: get("SSH_HOST"),
            port: get("SSH_PORT"),
            user: get("SSH_USER"),
            password: get("SSH_PASSWORD"),
            private_key: get("SSH_PRIVKEY"),
            passphrase: get("SSH_PASSPHRASE"),
        }
    }

    /// Process environment first, then values read from a `.env` file.
    pub fn from_layers<F>(env: F, file_vars: &HashMap<String, String>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(|key| {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file_vars.get(key).cloned())
        })
    }

    pub fn from_env(file_vars: &HashMap<String, String>) -> Self {
        Self::from_layers(|key| std::env::var(key).ok(), file_vars)
    }

    /// Check the required fields and turn the raw values into a connectable target.
    pub fn validate(&self) -> Result<SshTarget> {
        let host = self.host.clone().ok_or(Error::MissingCredential("SSH_HOST"))?;
        let user = self.user.clone().ok_or(Error::MissingCredential("SSH_USER"))?;

        let port = match &self.port {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::InvalidConfig(format!("SSH_PORT is not a valid port: {}", raw)))?,
            None => DEFAULT_SSH_PORT,
        };

        let identity = self.private_key.as_deref().map(KeySource::parse);

        // A passphrase only makes sense with a key; otherwise fall back to the password.
        let prompt_secret = match (&identity, &self.passphrase, &self.password) {
            (Some(_), Some(passphrase), _) => Some(PromptSecret::Passphrase(passphrase.clone())),
            (_, _, Some(password)) => Some(PromptSecret::Password(password.clone())),
            _ => None,
        };

        Ok(SshTarget {
            host,
            port,
            user,
            identity,
            prompt_secret,
        })
    }
}

/// Validated connection target handed to a connector.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<KeySource>,
    pub prompt_secret: Option<PromptSecret>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Clone, PartialEq)]
pub enum KeySource {
    File(PathBuf),
    Inline(String),
}

impl KeySource {
    /// `SSH_PRIVKEY` holds either a path or the key text itself.
    pub fn parse(raw: &str) -> Self {
        if raw.contains("-----BEGIN") {
            KeySource::Inline(raw.to_string())
        } else {
            KeySource::File(PathBuf::from(raw))
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            KeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

/// Secret fed to the interactive prompt of the SSH client.
#[derive(Clone, PartialEq)]
pub enum PromptSecret {
    Password(String),
    Passphrase(String),
}

impl PromptSecret {
    pub fn value(&self) -> &str {
        match self {
            PromptSecret::Password(v) | PromptSecret::Passphrase(v) => v,
        }
    }
}

impl fmt::Debug for PromptSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptSecret::Password(_) => f.write_str("Password(<redacted>)"),
            PromptSecret::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
        }
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Which local files made it to the remote host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferOutcome {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The remote steps that run commands on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Clean,
    Build,
    Upload,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Clean => "remove remote target",
            Step::Build => "build",
            Step::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Deployment progress. Linear, with `Failed` reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Validated,
    Connected,
    Cleaned,
    Copied,
    Built,
    Uploaded,
    Done,
    Failed,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Init => Stage::Validated,
            Stage::Validated => Stage::Connected,
            Stage::Connected => Stage::Cleaned,
            Stage::Cleaned => Stage::Copied,
            Stage::Copied => Stage::Built,
            Stage::Built => Stage::Uploaded,
            Stage::Uploaded => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Failed => Stage::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

/// Returned by a successful deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployReport {
    pub remote_path: String,
    pub outcome: TransferOutcome,
    pub build: RemoteOutput,
    pub upload: RemoteOutput,
}
