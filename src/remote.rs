//! Seams between the deploy sequence and the remote-shell transport.

use std::future::Future;
use std::path::Path;

use crate::error::Result;
use crate::models::{RemoteOutput, SshTarget};

/// Opens remote-shell sessions.
pub trait Connector {
    type Session: RemoteSession + 'static;

    fn connect(&self, target: &SshTarget) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// One open connection to the remote host. Shared by every step of a deployment.
pub trait RemoteSession: Send + Sync {
    /// Run `command` through the remote shell, optionally inside `cwd`.
    fn exec(
        &self,
        command: &str,
        cwd: Option<&str>,
    ) -> impl Future<Output = Result<RemoteOutput>> + Send;

    /// Copy one local file to `remote_path`. The parent directory must exist.
    fn put_file(&self, local_path: &Path, remote_path: &str)
        -> impl Future<Output = Result<()>> + Send;

    /// Release the connection. Calling it twice is harmless.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Prefix `command` with a `cd` into `cwd`.
pub fn in_directory(command: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
        None => command.to_string(),
    }
}
