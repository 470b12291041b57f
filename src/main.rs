use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use std::fs::{self, File};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod config;
mod deployer;
mod error;
mod models;
mod output;
mod remote;
mod ssh_service;
mod transfer;

use cli::Cli;
use config::{load_env_file, ConfigManager, DeployConfig};
use deployer::Deployer;
use models::SessionConfig;
use output::Reporter;
use ssh_service::OpenSshConnector;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = setup_logging(cli.log_dir.as_deref()) {
        eprintln!("Warning: file logging disabled: {:#}", err);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            Reporter::stdio().error(format!("{:#}", err));
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(log_dir: Option<&Path>) -> Result<()> {
    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::cache_dir()
            .context("Could not find cache directory")?
            .join("rollout")
            .join("logs"),
    };
    if !log_dir.exists() {
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    }

    let log_file = log_dir.join(format!(
        "rollout_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = File::create(&log_file).context("Failed to create log file")?;

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rollout=debug".parse()?))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    debug!("Logging to {:?}", log_file);
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let manager = match &cli.config {
        Some(path) => {
            if !cli.init_config && !path.exists() {
                bail!("Config file does not exist: {}", path.display());
            }
            ConfigManager::with_file(path)
        }
        None => ConfigManager::new()?,
    };

    if cli.init_config {
        if manager.get_config_path().exists() {
            bail!("Config file already exists: {}", manager.get_config_path().display());
        }
        manager.save_config(&DeployConfig::default())?;
        println!("Wrote default config to {}", manager.get_config_path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = manager.load_config()?;
    cli.apply(&mut config);
    config.validate().context("Invalid command-line options")?;
    debug!("Effective config: {:?}", config);

    // Variables already set in the process environment win over `.env`.
    let env_file = load_env_file(Path::new(".env"))?;
    let session_config = SessionConfig::from_env(&env_file);
    debug!("Session config: {:?}", session_config);

    let connector = OpenSshConnector::new(&config.host_key_checking);
    let platform = config.platform.clone();
    let mut deployer = Deployer::new(connector, config, Reporter::stdio());

    match deployer.run(cli.target(), &platform, &session_config).await {
        Ok(report) => {
            debug!(
                "Deployed {} files to {} (build exit {:?}, upload exit {:?})",
                report.outcome.succeeded.len(),
                report.remote_path,
                report.build.exit_status,
                report.upload.exit_status
            );
            Ok(ExitCode::SUCCESS)
        }
        // Already reported by the deployer.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
