use std::path::PathBuf;
use thiserror::Error;

use crate::models::Step;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a deployment. Every variant is fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} argument is required!")]
    MissingArgument(&'static str),

    #[error("Target path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Target path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Target path has no base name: {}", .0.display())]
    InvalidTarget(PathBuf),

    #[error("{0} is required!")]
    MissingCredential(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("SSH connection error ({host}): {message}")]
    ConnectionFailure { host: String, message: String },

    #[error("{step} wrote to stderr: {stderr}")]
    RemoteCommandStderr { step: Step, stderr: String },

    #[error("{step} exited with status {status}")]
    RemoteCommandStatus { step: Step, status: i32 },

    #[error("failed transfers: {}", join_paths(.failed))]
    TransferFailure { failed: Vec<PathBuf> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk local directory: {0}")]
    Walk(#[from] walkdir::Error),
}

impl Error {
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            host: host.into(),
            message: message.into(),
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
