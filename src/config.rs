use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{Step, DEFAULT_PLATFORM};

/// How a remote step treats the output of its command.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct StepPolicy {
    pub fail_on_stderr: bool,
    pub fail_on_exit_status: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StepPolicies {
    pub clean: StepPolicy,
    pub build: StepPolicy,
    pub upload: StepPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub platform: String,
    pub concurrency: usize,
    pub remote_root: String,
    pub toolchain: String,
    pub excluded_dirs: Vec<String>,
    pub host_key_checking: String,
    pub policy: StepPolicies,
}

impl Default for StepPolicies {
    fn default() -> Self {
        // Only the clean step fails on stderr; build and upload output is printed, not judged.
        Self {
            clean: StepPolicy {
                fail_on_stderr: true,
                fail_on_exit_status: false,
            },
            build: StepPolicy::default(),
            upload: StepPolicy::default(),
        }
    }
}

impl StepPolicies {
    pub fn for_step(&self, step: Step) -> StepPolicy {
        match step {
            Step::Clean => self.clean,
            Step::Build => self.build,
            Step::Upload => self.upload,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            platform: DEFAULT_PLATFORM.to_string(),
            concurrency: 2,
            remote_root: "/tmp".to_string(),
            toolchain: "ino".to_string(),
            excluded_dirs: vec!["node_modules".to_string()],
            host_key_checking: "no".to_string(),
            policy: StepPolicies::default(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if !self.remote_root.starts_with('/') {
            bail!("remote_root must be an absolute path, got {:?}", self.remote_root);
        }
        if self.toolchain.trim().is_empty() {
            bail!("toolchain must not be empty");
        }
        if !matches!(self.host_key_checking.as_str(), "yes" | "no" | "accept-new") {
            bail!(
                "host_key_checking must be one of yes, no, accept-new, got {:?}",
                self.host_key_checking
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    config_file: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("rollout");

        Ok(Self {
            config_file: config_dir.join("rollout.toml"),
        })
    }

    pub fn with_file(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
        }
    }

    pub fn get_config_path(&self) -> &Path {
        &self.config_file
    }

    /// Load the defaults file. A missing file means built-in defaults.
    pub fn load_config(&self) -> Result<DeployConfig> {
        if !self.config_file.exists() {
            tracing::debug!("No config file at {:?}, using defaults", self.config_file);
            return Ok(DeployConfig::default());
        }

        let content: String =
            fs::read_to_string(&self.config_file).context("Failed to read config file")?;

        let config: DeployConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config
            .validate()
            .with_context(|| format!("Invalid config file {}", self.config_file.display()))?;

        Ok(config)
    }

    pub fn save_config(&self, config: &DeployConfig) -> Result<()> {
        if let Some(dir) = self.config_file.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create config directory")?;
            }
        }
        let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_file, toml).context("Failed to write config file")?;
        Ok(())
    }
}

/// Read `KEY=value` pairs from a `.env` file without touching the process
/// environment. A missing file yields no values.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        tracing::debug!("No env file at {:?}", path);
        return Ok(HashMap::new());
    }

    let vars = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read env file {}", path.display()))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()
        .with_context(|| format!("Failed to parse env file {}", path.display()))?;

    tracing::debug!("Loaded {} variables from {:?}", vars.len(), path);
    Ok(vars)
}
