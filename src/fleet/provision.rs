//! Replacement provisioning for departed chunkservers

use crate::common::{Result, WatcherConfig};
use std::process::Stdio;
use tokio::process::Command;

/// Starts a replacement chunkserver on a host. Dispatch does not wait for
/// the remote command to finish.
pub trait Provisioner: Send + Sync + 'static {
    fn dispatch(&self, host: &str) -> Result<()>;
}

/// Runs the provisioning command on the target host over ssh.
#[derive(Debug, Clone)]
pub struct SshProvisioner {
    program: String,
    command: String,
}

impl SshProvisioner {
    pub fn new(program: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            command: command.into(),
        }
    }

    /// Build from the watcher configuration. `{coordination}` in the command
    /// template is replaced with the coordination endpoint.
    pub fn from_config(config: &WatcherConfig, coordination: &str) -> Self {
        Self::new(
            config.ssh_program.clone(),
            config.provision_command.replace("{coordination}", coordination),
        )
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Provisioner for SshProvisioner {
    fn dispatch(&self, host: &str) -> Result<()> {
        tracing::info!("Dispatching `{}` to {}", self.command, host);
        // Detached; tokio reaps the child in the background.
        Command::new(&self.program)
            .arg(host)
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_substitutes_endpoint() {
        let config = WatcherConfig::default();
        let provisioner = SshProvisioner::from_config(&config, "10.0.0.5:2379");
        assert_eq!(
            provisioner.command(),
            "minigfs-chunkserver --coordination 10.0.0.5:2379"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let provisioner = SshProvisioner::new("/nonexistent/minigfs-ssh", "true");
        assert!(provisioner.dispatch("host").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait() {
        // `true` ignores its arguments and exits at once.
        let provisioner = SshProvisioner::new("true", "sleep 10");
        assert!(provisioner.dispatch("localhost").is_ok());
    }
}
