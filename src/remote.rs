//! Remote command execution over ssh.
//!
//! Every remote call is guarded twice: the `timeout` binary wraps the ssh
//! process on the local machine, and the future itself carries a deadline.
//! A hung remote shell therefore never keeps a task (or an ssh process)
//! alive past its budget.

use async_trait::async_trait;
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::process::Command;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Remote command on {host} exceeded {timeout:?}")]
    Deadline { host: String, timeout: Duration },
    #[error("Remote command on {host} exited with {code:?}: {output}")]
    CommandFailed {
        host: String,
        code: Option<i32>,
        output: String,
    },
}

/// Runs a shell command on a node and returns its combined output.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host: &str, command: &str, timeout: Duration)
    -> Result<String, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    options: Vec<String>,
}

impl SshExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            user: settings.ssh_user.clone(),
            options: settings.ssh_options.clone(),
        }
    }

    pub fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    fn command(&self, host: &str, command: &str, timeout: Duration) -> Command {
        let mut cmd = Command::new("timeout");
        cmd.arg(format!("{}s", timeout.as_secs().max(1)))
            .arg("ssh")
            .args(&self.options)
            .arg(self.destination(host))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, RemoteError> {
        log::debug!("Running on {host}: {command}");
        let output = tokio::time::timeout(timeout, self.command(host, command, timeout).output())
            .await
            .map_err(|_| RemoteError::Deadline {
                host: host.to_string(),
                timeout,
            })??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                host: host.to_string(),
                code: output.status.code(),
                output: combined.trim().to_string(),
            });
        }
        Ok(combined)
    }
}

/// Container teardown on a node.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn destroy(&self, host: &str, name: &str) -> Result<(), RemoteError>;
}

pub struct LxcRuntime {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl LxcRuntime {
    pub fn new(executor: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn destroy(&self, host: &str, name: &str) -> Result<(), RemoteError> {
        log::info!("Destroying container {name} on {host}");
        // A container that is already stopped makes lxc-stop fail, which is fine.
        if let Err(e) = self
            .executor
            .run(host, &format!("sudo lxc-stop -n {name} -k"), self.timeout)
            .await
        {
            log::debug!("lxc-stop for {name} on {host} failed: {e}");
        }
        self.executor
            .run(host, &format!("sudo lxc-destroy -n {name}"), self.timeout)
            .await?;
        log::info!("Container {name} on {host} destroyed");
        Ok(())
    }
}
