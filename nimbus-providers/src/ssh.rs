use crate::{CommandRunner, CommandTarget};
use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs commands through the local `ssh` client.
pub struct SshCommandRunner {
    private_key_file: Option<String>,
    timeout: Duration,
}

impl SshCommandRunner {
    pub fn new(private_key_file: Option<String>, timeout: Duration) -> Self {
        let private_key_file = private_key_file
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Self {
            private_key_file,
            timeout,
        }
    }

    fn build(&self, target: &CommandTarget, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
            "-p",
            target.port.as_str(),
        ]);
        if let Some(key) = &self.private_key_file {
            cmd.args(["-i", key.as_str()]);
        }
        cmd.arg(format!("{}@{}", target.user_name, target.host));
        cmd.arg(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        // Dropping the child on timeout must not leave ssh running.
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    async fn run_command(&self, target: &CommandTarget, command: &str) -> Result<String> {
        if target.host.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "vm {} has no public address for remote command",
                target.vm_id
            ));
        }
        let child = self.build(target, command).spawn().map_err(|e| {
            anyhow::anyhow!("failed to spawn ssh: {}. Is the OpenSSH client installed?", e)
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "remote command on {} timed out after {}s",
                    target.vm_id,
                    self.timeout.as_secs()
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "remote command on {} failed ({}): {}",
                target.vm_id,
                output.status,
                stderr.trim()
            ));
        }
        Ok(stdout)
    }
}
