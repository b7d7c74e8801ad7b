use std::cell::Cell;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use anyhow::Context;
use bstr::ByteSlice;
use tempfile::TempDir;
use tokio::process::Command;

use crate::common::config::SshConfig;
use crate::common::error::HpcError;
use crate::common::utils::str::shell_quote;
use crate::gateway::{CommandOutput, GatewayFuture, RemoteShell};

/// Exit code of `ssh` itself when the connection fails.
const SSH_FAILURE_CODE: i32 = 255;

/// [`RemoteShell`] backed by the system `ssh` and `scp` binaries.
///
/// `connect` starts a control master, all later commands are multiplexed over its socket.
pub struct SshShell {
    config: SshConfig,
    control_path: PathBuf,
    // Keeps the temporary socket directory alive
    _control_dir: Option<TempDir>,
    connected: Cell<bool>,
}

impl SshShell {
    pub fn new(config: SshConfig) -> crate::Result<Self> {
        if config.host.trim().is_empty() {
            return Err(HpcError::configuration("ssh", "missing `host`"));
        }
        let (directory, temporary) = match &config.control_dir {
            Some(directory) => (directory.clone(), None),
            None => {
                let directory = tempfile::Builder::new().prefix("hpcbench-ssh").tempdir()?;
                (directory.path().to_path_buf(), Some(directory))
            }
        };
        Ok(Self {
            control_path: directory.join("master-%C"),
            config,
            _control_dir: temporary,
            connected: Cell::new(false),
        })
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = &self.config.identity_file {
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.config.port.to_string()];
        args.extend(self.common_options());
        args
    }

    fn scp_args(&self) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-P".to_string(), self.config.port.to_string()];
        args.extend(self.common_options());
        args
    }

    fn connection_error(&self, message: impl Into<String>) -> HpcError {
        HpcError::ConnectionError {
            host: self.config.destination(),
            message: message.into(),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> crate::Result<Output> {
        let binary = which::which(program).with_context(|| {
            format!("Cannot find `{program}` binary. Make sure that OpenSSH is installed.")
        })?;
        log::trace!("Running `{} {}`", binary.display(), args.join(" "));
        let output = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    async fn open_master(&self) -> crate::Result<()> {
        let mut args = self.ssh_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-M".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            self.config.destination(),
        ]);
        let output = self.run("ssh", args).await?;
        if !output.status.success() {
            return Err(self.connection_error(output.stderr.to_str_lossy().trim().to_string()));
        }
        Ok(())
    }

    async fn close_master(&self) -> crate::Result<()> {
        let mut args = self.ssh_args();
        args.extend([
            "-O".to_string(),
            "exit".to_string(),
            self.config.destination(),
        ]);
        let output = self.run("ssh", args).await?;
        if !output.status.success() {
            log::debug!(
                "Closing SSH master failed: {}",
                output.stderr.to_str_lossy().trim()
            );
        }
        Ok(())
    }

    async fn execute_command(&self, command: &str) -> crate::Result<CommandOutput> {
        let mut args = self.ssh_args();
        args.push(self.config.destination());
        args.push(command.to_string());
        let output = self.run("ssh", args).await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = output.stderr.to_str_lossy().into_owned();
        if exit_code == SSH_FAILURE_CODE {
            return Err(self.connection_error(stderr.trim().to_string()));
        }
        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout.to_str_lossy().into_owned(),
            stderr,
        })
    }

    async fn copy(&self, from: String, to: String) -> crate::Result<()> {
        let mut args = self.scp_args();
        args.extend([from, to]);
        let output = self.run("scp", args).await?;
        if !output.status.success() {
            return Err(self.connection_error(format!(
                "scp failed: {}",
                output.stderr.to_str_lossy().trim()
            )));
        }
        Ok(())
    }

    fn remote(&self, path: &str) -> String {
        format!("{}:{}", self.config.destination(), shell_quote(path))
    }

    async fn upload_file(&self, content: &[u8], remote_path: &str) -> crate::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(content)?;
        file.flush()?;
        self.copy(
            file.path().display().to_string(),
            self.remote(remote_path),
        )
        .await
    }

    async fn download_file(&self, remote_path: &str) -> crate::Result<Vec<u8>> {
        let file = tempfile::NamedTempFile::new()?;
        self.copy(self.remote(remote_path), file.path().display().to_string())
            .await?;
        Ok(std::fs::read(file.path())?)
    }
}

impl RemoteShell for SshShell {
    fn connect(&self) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            if self.connected.get() {
                return Ok(());
            }
            let destination = self.config.destination();
            self.config
                .retry
                .run(&format!("SSH connection to {destination}"), |_| {
                    self.open_master()
                })
                .await?;
            log::info!("Connected to {destination}");
            self.connected.set(true);
            Ok(())
        })
    }

    fn disconnect(&self) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected.replace(false) {
                return Ok(());
            }
            self.close_master().await?;
            log::debug!("Disconnected from {}", self.config.destination());
            Ok(())
        })
    }

    fn execute<'a>(&'a self, command: &'a str) -> GatewayFuture<'a, CommandOutput> {
        Box::pin(self.execute_command(command))
    }

    fn upload<'a>(&'a self, content: &'a [u8], remote_path: &'a str) -> GatewayFuture<'a, ()> {
        Box::pin(self.upload_file(content, remote_path))
    }

    fn download<'a>(&'a self, remote_path: &'a str) -> GatewayFuture<'a, Vec<u8>> {
        Box::pin(self.download_file(remote_path))
    }
}
