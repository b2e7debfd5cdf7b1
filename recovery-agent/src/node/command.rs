//! Node process control through configured shell commands
//! (`docker compose stop node`, `systemctl start geth`, ...).

use super::ProcessControl;
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandProcess {
    start_command: String,
    stop_command: String,
    status_command: String,
}

impl CommandProcess {
    pub fn new(
        start_command: impl Into<String>,
        stop_command: impl Into<String>,
        status_command: impl Into<String>,
    ) -> Self {
        Self {
            start_command: start_command.into(),
            stop_command: stop_command.into(),
            status_command: status_command.into(),
        }
    }

    async fn run(&self, command: &str) -> Result<std::process::Output> {
        debug!("Running: {}", command);
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| DrError::Process(format!("failed to spawn `{}`: {}", command, e)))
    }

    async fn run_checked(&self, command: &str) -> Result<()> {
        let output = self.run(command).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DrError::Process(format!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ProcessControl for CommandProcess {
    async fn start(&self) -> Result<()> {
        self.run_checked(&self.start_command).await
    }

    async fn stop(&self) -> Result<()> {
        self.run_checked(&self.stop_command).await
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.run(&self.status_command).await?.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commands_drive_state() {
        let dir = TempDir::new().unwrap();
        let flag = dir.path().join("running");
        let flag = flag.display();

        let process = CommandProcess::new(
            format!("touch {}", flag),
            format!("rm -f {}", flag),
            format!("test -f {}", flag),
        );

        assert!(!process.is_running().await.unwrap());
        process.start().await.unwrap();
        assert!(process.is_running().await.unwrap());
        process.stop().await.unwrap();
        assert!(!process.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_command_is_process_error() {
        let process = CommandProcess::new("exit 3", "true", "false");
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, DrError::Process(_)));
    }
}
