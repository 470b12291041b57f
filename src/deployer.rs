//! The deploy sequence: validate, connect, clean, copy, build, upload, report.

use std::path::Path;
use std::sync::Arc;

use crate::config::DeployConfig;
use crate::error::{Error, Result};
use crate::models::{DeployReport, DeployRequest, RemoteOutput, SessionConfig, Stage, Step, TransferOutcome};
use crate::output::Reporter;
use crate::remote::{shell_quote, Connector, RemoteSession};
use crate::transfer::{plan_upload, upload_tree};

pub struct Deployer<C: Connector> {
    connector: C,
    config: DeployConfig,
    reporter: Reporter,
    stage: Stage,
}

impl<C: Connector> Deployer<C> {
    pub fn new(connector: C, config: DeployConfig, reporter: Reporter) -> Self {
        Self {
            connector,
            config,
            reporter,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self) {
        if self.stage.is_terminal() {
            return;
        }
        let next = self.stage.next();
        tracing::debug!("Stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    /// Run the whole deployment. Any error is reported on stderr and leaves
    /// the deployer in [`Stage::Failed`].
    pub async fn run(
        &mut self,
        target: Option<&Path>,
        platform: &str,
        session_config: &SessionConfig,
    ) -> Result<DeployReport> {
        let result = self.connect_and_deploy(target, platform, session_config).await;
        if let Err(e) = &result {
            tracing::error!("Deployment failed at {:?}: {}", self.stage, e);
            self.stage = Stage::Failed;
            self.reporter.error(e);
        }
        result
    }

    async fn connect_and_deploy(
        &mut self,
        target: Option<&Path>,
        platform: &str,
        session_config: &SessionConfig,
    ) -> Result<DeployReport> {
        // Nothing touches the network until both the target and the credentials check out.
        let request = DeployRequest::resolve(target, platform, &self.config.remote_root)?;
        let ssh_target = session_config.validate()?;
        self.advance();

        tracing::info!("Deploying {:?} to {}", request.local_path, request.remote_path);
        self.reporter
            .progress(format!("Connecting to remote host {}", ssh_target.host));
        let session = Arc::new(self.connector.connect(&ssh_target).await?);
        self.reporter
            .success(format!("Successful connection {}", ssh_target.host));
        self.advance();

        let result = self.deploy(&session, &request).await;

        if let Err(e) = session.close().await {
            tracing::warn!("Failed to close session: {}", e);
        }
        result
    }

    async fn deploy(&mut self, session: &Arc<C::Session>, request: &DeployRequest) -> Result<DeployReport> {
        self.remove_remote_target(session.as_ref(), request).await?;
        self.advance();

        let outcome = self.copy_target_to_remote(session, request).await?;
        self.advance();

        let build = self.ino_action(session.as_ref(), request, Step::Build, "build").await?;
        self.advance();

        let upload = self.ino_action(session.as_ref(), request, Step::Upload, "upload").await?;
        self.advance();

        self.reporter.success("All done!");
        self.advance();

        Ok(DeployReport {
            remote_path: request.remote_path.clone(),
            outcome,
            build,
            upload,
        })
    }

    async fn remove_remote_target(&mut self, session: &C::Session, request: &DeployRequest) -> Result<()> {
        self.reporter
            .progress(format!("Start remove {}", request.remote_path));

        let command = format!("rm -r {} > /dev/null 2>&1", shell_quote(&request.remote_path));
        let output = session.exec(&command, None).await?;
        self.check_output(Step::Clean, &output)?;

        self.reporter.progress(
            format!("{} removed! {}", request.remote_path, output.stdout.trim_end()).trim_end(),
        );
        Ok(())
    }

    async fn copy_target_to_remote(
        &mut self,
        session: &Arc<C::Session>,
        request: &DeployRequest,
    ) -> Result<TransferOutcome> {
        self.reporter.progress(format!(
            "Start of transfer from {} to {}",
            request.local_path.display(),
            request.remote_path
        ));

        let plan = plan_upload(&request.local_path, &request.remote_path, &self.config.excluded_dirs)?;
        tracing::info!(
            "Uploading {} files in {} directories",
            plan.files.len(),
            plan.directories.len()
        );

        let outcome = upload_tree(Arc::clone(session), plan, self.config.concurrency).await?;
        if !outcome.is_success() {
            return Err(Error::TransferFailure {
                failed: outcome.failed,
            });
        }

        self.reporter.success("The directory transfer was successful");
        if !outcome.succeeded.is_empty() {
            self.reporter.progress("Transferred files:");
            for file in &outcome.succeeded {
                self.reporter.plain(file.display());
            }
        }
        Ok(outcome)
    }

    async fn ino_action(
        &mut self,
        session: &C::Session,
        request: &DeployRequest,
        step: Step,
        action: &str,
    ) -> Result<RemoteOutput> {
        let command = format!(
            "{} {} {}",
            self.config.toolchain,
            action,
            shell_quote(&format!("-m{}", request.platform))
        );

        tracing::info!("Running `{}` in {}", command, request.remote_path);
        let output = session.exec(&command, Some(request.remote_path.as_str())).await?;

        self.reporter.plain(format!("STDOUT: {}", output.stdout.trim_end()));
        if !output.stderr.trim().is_empty() {
            self.reporter.error(format!("STDERR: {}", output.stderr.trim_end()));
        }
        self.check_output(step, &output)?;
        Ok(output)
    }

    /// Apply the configured policy for `step` to a command result.
    fn check_output(&self, step: Step, output: &RemoteOutput) -> Result<()> {
        let policy = self.config.policy.for_step(step);

        if policy.fail_on_stderr && !output.stderr.trim().is_empty() {
            return Err(Error::RemoteCommandStderr {
                step,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if !output.success() {
            let status = output.exit_status.unwrap_or(-1);
            if policy.fail_on_exit_status {
                return Err(Error::RemoteCommandStatus { step, status });
            }
            match step {
                // rm on a missing directory exits non-zero, which is expected.
                Step::Clean => tracing::debug!("{} exited with status {}", step, status),
                _ => tracing::warn!("{} exited with status {}, continuing", step, status),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshTarget;
    use crate::output::capture::Capture;
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Default)]
    struct Log {
        connects: usize,
        commands: Vec<(String, Option<String>)>,
        uploads: Vec<(PathBuf, String)>,
        closes: usize,
    }

    /// Canned responses keyed by the first word of the remote command.
    #[derive(Debug, Default, Clone)]
    struct Script {
        refuse_connection: bool,
        responses: HashMap<String, RemoteOutput>,
        failing_uploads: HashSet<String>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        log: Arc<Mutex<Log>>,
        script: Script,
    }

    struct FakeSession {
        log: Arc<Mutex<Log>>,
        script: Script,
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self, target: &SshTarget) -> Result<FakeSession> {
            self.log.lock().unwrap().connects += 1;
            if self.script.refuse_connection {
                return Err(Error::connection(&target.host, "Connection refused"));
            }
            Ok(FakeSession {
                log: Arc::clone(&self.log),
                script: self.script.clone(),
            })
        }
    }

    impl RemoteSession for FakeSession {
        async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<RemoteOutput> {
            self.log
                .lock()
                .unwrap()
                .commands
                .push((command.to_string(), cwd.map(str::to_string)));
            let key = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
            Ok(self.script.responses.get(&key).cloned().unwrap_or(RemoteOutput {
                exit_status: Some(0),
                ..RemoteOutput::default()
            }))
        }

        async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .uploads
                .push((local_path.to_path_buf(), remote_path.to_string()));
            let name = local_path.file_name().unwrap().to_string_lossy().to_string();
            if self.script.failing_uploads.contains(&name) {
                return Err(Error::Io(std::io::Error::other("scp: broken pipe")));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    struct Harness {
        deployer: Deployer<FakeConnector>,
        log: Arc<Mutex<Log>>,
        out: Capture,
        err: Capture,
    }

    fn harness(script: Script, config: DeployConfig) -> Harness {
        let connector = FakeConnector {
            log: Arc::default(),
            script,
        };
        let log = Arc::clone(&connector.log);
        let out = Capture::default();
        let err = Capture::default();
        let reporter = Reporter::new(Box::new(out.clone()), Box::new(err.clone()), false);
        Harness {
            deployer: Deployer::new(connector, config, reporter),
            log,
            out,
            err,
        }
    }

    fn credentials() -> SessionConfig {
        SessionConfig {
            host: Some("rpi.local".to_string()),
            user: Some("pi".to_string()),
            ..SessionConfig::default()
        }
    }

    /// `<tmp>/blink` with `blink.ino`, `.git/` and `node_modules/`.
    fn blink() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("blink");
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("node_modules/johnny-five")).unwrap();
        fs::write(root.join("blink.ino"), "void loop() {}").unwrap();
        fs::write(root.join(".git/config"), "").unwrap();
        fs::write(root.join("node_modules/johnny-five/index.js"), "").unwrap();
        (dir, root)
    }

    fn output(stderr: &str, status: i32) -> RemoteOutput {
        RemoteOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_status: Some(status),
        }
    }

    #[tokio::test]
    async fn test_blink_deploys_end_to_end() {
        let (_dir, root) = blink();
        let mut h = harness(Script::default(), DeployConfig::default());

        let report = h
            .deployer
            .run(Some(root.as_path()), "nano328", &credentials())
            .await
            .unwrap();

        assert_eq!(report.remote_path, "/tmp/blink");
        assert_eq!(report.outcome.succeeded, vec![fs::canonicalize(&root).unwrap().join("blink.ino")]);
        assert_eq!(h.deployer.stage(), Stage::Done);

        let log = h.log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.closes, 1);
        assert_eq!(
            log.commands,
            vec![
                ("rm -r /tmp/blink > /dev/null 2>&1".to_string(), None),
                ("mkdir -p /tmp/blink".to_string(), None),
                ("ino build -mnano328".to_string(), Some("/tmp/blink".to_string())),
                ("ino upload -mnano328".to_string(), Some("/tmp/blink".to_string())),
            ]
        );
        let uploaded: Vec<&str> = log.uploads.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(uploaded, vec!["/tmp/blink/blink.ino"]);

        let out = h.out.text();
        assert!(out.contains("Connecting to remote host rpi.local"));
        assert!(out.contains("Transferred files:"));
        assert!(out.trim_end().ends_with("All done!"));
        assert!(h.err.text().is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_never_connects() {
        let mut h = harness(Script::default(), DeployConfig::default());

        let err = h.deployer.run(None, "nano328", &credentials()).await.unwrap_err();

        assert!(matches!(err, Error::MissingArgument("target")));
        assert_eq!(h.deployer.stage(), Stage::Failed);
        assert_eq!(h.log.lock().unwrap().connects, 0);
        assert!(h.err.text().contains("target argument is required"));
    }

    #[tokio::test]
    async fn test_nonexistent_target_never_connects() {
        let dir = tempdir().unwrap();
        let mut h = harness(Script::default(), DeployConfig::default());

        let err = h
            .deployer
            .run(Some(dir.path().join("missing").as_path()), "nano328", &credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PathNotFound(_)));
        assert_eq!(h.log.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_file_target_never_connects() {
        let (_dir, root) = blink();
        let mut h = harness(Script::default(), DeployConfig::default());

        let err = h
            .deployer
            .run(Some(root.join("blink.ino").as_path()), "nano328", &credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotADirectory(_)));
        assert_eq!(h.deployer.stage(), Stage::Failed);
        let log = h.log.lock().unwrap();
        assert_eq!(log.connects, 0);
        assert!(log.commands.is_empty());
        assert!(h.err.text().contains("is not a directory"));
        assert!(!h.out.text().contains("All done!"));
    }

    #[tokio::test]
    async fn test_missing_credentials_never_connect() {
        let (_dir, root) = blink();

        for missing in ["SSH_HOST", "SSH_USER"] {
            let mut config = credentials();
            match missing {
                "SSH_HOST" => config.host = None,
                _ => config.user = None,
            }
            let mut h = harness(Script::default(), DeployConfig::default());

            let err = h.deployer.run(Some(root.as_path()), "nano328", &config).await.unwrap_err();

            assert!(matches!(err, Error::MissingCredential(name) if name == missing));
            assert_eq!(h.log.lock().unwrap().connects, 0);
            assert!(h.err.text().contains(&format!("{} is required!", missing)));
        }
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let (_dir, root) = blink();
        let script = Script {
            refuse_connection: true,
            ..Script::default()
        };
        let mut h = harness(script, DeployConfig::default());

        let err = h.deployer.run(Some(root.as_path()), "nano328", &credentials()).await.unwrap_err();

        assert!(matches!(err, Error::ConnectionFailure { .. }));
        assert!(h.err.text().contains("SSH connection error"));
        let log = h.log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert!(log.commands.is_empty());
    }

    #[tokio::test]
    async fn test_clean_stderr_stops_and_closes() {
        let (_dir, root) = blink();
        let script = Script {
            responses: HashMap::from([(
                "rm -r".to_string(),
                output("rm: cannot remove '/tmp/blink': Permission denied", 1),
            )]),
            ..Script::default()
        };
        let mut h = harness(script, DeployConfig::default());

        let err = h.deployer.run(Some(root.as_path()), "nano328", &credentials()).await.unwrap_err();

        assert!(matches!(err, Error::RemoteCommandStderr { step: Step::Clean, .. }));
        let log = h.log.lock().unwrap();
        assert_eq!(log.commands.len(), 1);
        assert!(log.uploads.is_empty());
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_failed_transfer_skips_build() {
        let (_dir, root) = blink();
        fs::write(root.join("pins.h"), "").unwrap();
        let script = Script {
            failing_uploads: HashSet::from(["pins.h".to_string()]),
            ..Script::default()
        };
        let mut h = harness(script, DeployConfig::default());

        let err = h.deployer.run(Some(root.as_path()), "nano328", &credentials()).await.unwrap_err();

        match err {
            Error::TransferFailure { failed } => {
                assert_eq!(failed, vec![fs::canonicalize(&root).unwrap().join("pins.h")]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.deployer.stage(), Stage::Failed);
        assert!(h.err.text().contains("failed transfers"));

        let log = h.log.lock().unwrap();
        assert_eq!(log.uploads.len(), 2);
        assert!(!log.commands.iter().any(|(c, _)| c.starts_with("ino")));
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_build_stderr_is_ignored_by_default() {
        let (_dir, root) = blink();
        let script = Script {
            responses: HashMap::from([("ino build".to_string(), output("error: 'LED' was not declared", 1))]),
            ..Script::default()
        };
        let mut h = harness(script, DeployConfig::default());

        let report = h.deployer.run(Some(root.as_path()), "uno", &credentials()).await.unwrap();

        assert_eq!(report.build.exit_status, Some(1));
        assert_eq!(h.deployer.stage(), Stage::Done);
        assert!(h.err.text().contains("STDERR: error: 'LED' was not declared"));
        assert!(h.out.text().contains("All done!"));
        let log = h.log.lock().unwrap();
        assert_eq!(log.commands[3].0, "ino upload -muno");
    }

    #[tokio::test]
    async fn test_strict_build_policy_stops_before_upload() {
        let (_dir, root) = blink();
        let script = Script {
            responses: HashMap::from([("ino build".to_string(), output("error: 'LED' was not declared", 1))]),
            ..Script::default()
        };
        let mut config = DeployConfig::default();
        config.policy.build.fail_on_stderr = true;
        let mut h = harness(script, config);

        let err = h.deployer.run(Some(root.as_path()), "nano328", &credentials()).await.unwrap_err();

        assert!(matches!(err, Error::RemoteCommandStderr { step: Step::Build, .. }));
        assert!(!h.out.text().contains("All done!"));
        let log = h.log.lock().unwrap();
        assert!(!log.commands.iter().any(|(c, _)| c.starts_with("ino upload")));
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_exit_status_policy() {
        let (_dir, root) = blink();
        let script = Script {
            responses: HashMap::from([("ino upload".to_string(), output("", 2))]),
            ..Script::default()
        };
        let mut config = DeployConfig::default();
        config.policy.upload.fail_on_exit_status = true;
        let mut h = harness(script, config);

        let err = h.deployer.run(Some(root.as_path()), "nano328", &credentials()).await.unwrap_err();

        assert!(matches!(
            err,
            Error::RemoteCommandStatus {
                step: Step::Upload,
                status: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_custom_toolchain_and_remote_root() {
        let (_dir, root) = blink();
        let config = DeployConfig {
            toolchain: "/opt/ino/bin/ino".to_string(),
            remote_root: "/srv/sketches".to_string(),
            ..DeployConfig::default()
        };
        let mut h = harness(Script::default(), config);

        let report = h.deployer.run(Some(root.as_path()), "mega2560", &credentials()).await.unwrap();

        assert_eq!(report.remote_path, "/srv/sketches/blink");
        let log = h.log.lock().unwrap();
        assert_eq!(
            log.commands[2],
            (
                "/opt/ino/bin/ino build -mmega2560".to_string(),
                Some("/srv/sketches/blink".to_string())
            )
        );
    }
}
