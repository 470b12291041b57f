//! OpenSSH transport. One control master per deployment; every remote command
//! and file copy is multiplexed over its socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::models::{KeySource, PromptSecret, RemoteOutput, SshTarget};
use crate::remote::{in_directory, shell_quote, Connector, RemoteSession};

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_program: String,
    scp_program: String,
    sshpass_program: String,
    host_key_checking: String,
}

impl OpenSshConnector {
    pub fn new(host_key_checking: &str) -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            sshpass_program: "sshpass".to_string(),
            host_key_checking: host_key_checking.to_string(),
        }
    }

    fn master_command(&self, target: &SshTarget, control_path: &Path, identity: Option<&Path>) -> Command {
        // sshpass answers the password or key passphrase prompt from $SSHPASS.
        let mut cmd = match &target.prompt_secret {
            Some(secret) => {
                let mut cmd = Command::new(&self.sshpass_program);
                if let PromptSecret::Passphrase(_) = secret {
                    cmd.arg("-P").arg("passphrase");
                }
                cmd.arg("-e").arg(&self.ssh_program);
                cmd.env("SSHPASS", secret.value());
                cmd
            }
            None => Command::new(&self.ssh_program),
        };

        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-S")
            .arg(control_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("ConnectTimeout=30")
            .arg("-o")
            .arg(format!("StrictHostKeyChecking={}", self.host_key_checking))
            .arg("-o")
            .arg("LogLevel=ERROR");

        if target.prompt_secret.is_none() {
            cmd.arg("-o").arg("BatchMode=yes");
        }

        if let Some(identity) = identity {
            cmd.arg("-i").arg(identity);
        }

        cmd.arg(target.destination());
        cmd
    }
}

impl Connector for OpenSshConnector {
    type Session = OpenSshSession;

    async fn connect(&self, target: &SshTarget) -> Result<OpenSshSession> {
        let control_dir = tempfile::Builder::new().prefix("rollout-").tempdir()?;
        let control_path = control_dir.path().join("control.sock");
        let master_log = control_dir.path().join("master.log");

        let identity = match &target.identity {
            Some(KeySource::File(path)) => Some(path.clone()),
            Some(KeySource::Inline(key)) => Some(write_identity(control_dir.path(), key)?),
            None => None,
        };

        let mut cmd = self.master_command(target, &control_path, identity.as_deref());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(fs::File::create(&master_log)?));

        tracing::info!(
            "Opening control master: ssh {} -p {}",
            target.destination(),
            target.port
        );

        // -f forks the master into the background once authentication succeeded.
        let status = cmd.status().await.map_err(|e| {
            Error::connection(&target.host, format!("Failed to execute SSH command: {}", e))
        })?;

        if !status.success() {
            let log = fs::read_to_string(&master_log).unwrap_or_default();
            let message = if log.trim().is_empty() {
                format!("ssh exited with {}", status)
            } else {
                log.trim().to_string()
            };
            tracing::error!("Control master for {} failed: {}", target.host, message);
            return Err(Error::connection(&target.host, message));
        }

        Ok(OpenSshSession {
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
            destination: target.destination(),
            port: target.port,
            control_path,
            closed: AtomicBool::new(false),
            _control_dir: control_dir,
        })
    }
}

fn write_identity(dir: &Path, key: &str) -> Result<PathBuf> {
    use std::io::Write;

    let path = dir.join("identity");
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(key.as_bytes())?;
    // OpenSSH rejects key files without a trailing newline.
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(path)
}

/// A live control master. Closed explicitly by the deployer, or on drop.
#[derive(Debug)]
pub struct OpenSshSession {
    ssh_program: String,
    scp_program: String,
    destination: String,
    port: u16,
    control_path: PathBuf,
    closed: AtomicBool,
    // Holds the socket and any inline identity file; removed after `Drop::drop`.
    _control_dir: TempDir,
}

impl OpenSshSession {
    fn client_command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("LogLevel=ERROR");
        cmd.stdin(Stdio::null());
        cmd
    }

    /// `-O` pins the legacy scp protocol, where the remote path goes through the
    /// remote shell. The path is quoted for it, the same way `mkdir -p` quotes it.
    fn upload_command(&self, local_path: &Path, remote_path: &str) -> Command {
        let mut cmd = self.client_command(&self.scp_program);
        cmd.arg("-O")
            .arg("-q")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(local_path)
            .arg(format!("{}:{}", self.destination, shell_quote(remote_path)));
        cmd
    }

    fn exit_args(&self) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-O".to_string(),
            "exit".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
        ]
    }
}

impl RemoteSession for OpenSshSession {
    async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<RemoteOutput> {
        let remote_command = in_directory(command, cwd);
        tracing::debug!("exec on {}: {}", self.destination, remote_command);

        let output = self
            .client_command(&self.ssh_program)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.destination)
            .arg(&remote_command)
            .output()
            .await?;

        let result = RemoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_status: output.status.code(),
        };
        tracing::debug!("exec finished with {:?}", result.exit_status);
        Ok(result)
    }

    async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let output = self.upload_command(local_path, remote_path).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Io(std::io::Error::other(format!(
                "SCP upload failed: {}",
                stderr.trim()
            ))));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!("Closing control master for {}", self.destination);
        let output = Command::new(&self.ssh_program)
            .args(self.exit_args())
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::connection(
                &self.destination,
                format!("failed to close control master: {}", stderr.trim()),
            ));
        }
        // Only a confirmed exit skips the teardown in `Drop`.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Control master for {} was not closed, stopping it", self.destination);
        let _ = std::process::Command::new(&self.ssh_program)
            .args(self.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
