use clap::Parser;
use std::path::{Path, PathBuf};

use crate::config::DeployConfig;

/// Copy a sketch directory to a remote host over SSH, then build and flash it with ino.
///
/// Connection settings come from SSH_HOST, SSH_PORT, SSH_USER, SSH_PASSWORD,
/// SSH_PRIVKEY and SSH_PASSPHRASE.
#[derive(Debug, Parser)]
#[command(name = "rollout", version)]
pub struct Cli {
    /// Local directory to deploy
    #[arg(value_name = "TARGET")]
    pub target: Option<PathBuf>,

    /// Local directory to deploy (same as TARGET)
    #[arg(short = 't', long = "target", value_name = "PATH", conflicts_with = "target")]
    pub target_flag: Option<PathBuf>,

    /// Board identifier passed to ino as -m<PLATFORM>
    #[arg(short, long)]
    pub platform: Option<String>,

    /// Defaults file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of files copied in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Directory for log files
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write the default config file and exit
    #[arg(long)]
    pub init_config: bool,
}

impl Cli {
    pub fn target(&self) -> Option<&Path> {
        self.target_flag.as_deref().or(self.target.as_deref())
    }

    /// Command-line values win over the config file.
    pub fn apply(&self, config: &mut DeployConfig) {
        if let Some(platform) = &self.platform {
            config.platform = platform.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
    }
}
