//! Remote shell access to cluster nodes
//!
//! Certificate rotation has to write files and restart services on every
//! node. Nodes are reached over SSH through the API server's public FQDN,
//! which fronts the masters.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use kestrel_common::{Error, Result};

/// Default SSH port of the master load balancer
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Runs commands on cluster nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeShell: Send + Sync {
    /// Run `command` on `host`, returning its stdout
    async fn run(&self, host: &str, command: &str) -> Result<String>;

    /// Replace the file at `path` on `host` with `contents`
    async fn write_file(&self, host: &str, path: &str, contents: &str) -> Result<()>;
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub private_key: PathBuf,
    /// Bastion every connection hops through, usually the master FQDN
    pub jump_host: Option<String>,
    pub port: u16,
}

/// Builds a [`NodeShell`] for a target
#[cfg_attr(test, automock)]
pub trait ShellConnector: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Result<Arc<dyn NodeShell>>;
}

/// [`NodeShell`] over the system `ssh` binary
#[derive(Debug, Clone)]
pub struct SshShell {
    target: SshTarget,
}

impl SshShell {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.target.private_key)
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ConnectTimeout=30"]);
        if let Some(jump) = &self.target.jump_host {
            cmd.arg("-J")
                .arg(format!("{}@{}:{}", self.target.user, jump, self.target.port));
        } else {
            cmd.arg("-p").arg(self.target.port.to_string());
        }
        cmd.arg(format!("{}@{}", self.target.user, host)).arg(remote);
        cmd
    }

    async fn exec(&self, host: &str, remote: &str, stdin: Option<&str>) -> Result<String> {
        let mut child = self
            .command(host, remote)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io("ssh", e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::io("ssh stdin", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io("ssh", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::internal(format!(
                "command '{}' failed on {}: {}",
                remote,
                host,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl NodeShell for SshShell {
    async fn run(&self, host: &str, command: &str) -> Result<String> {
        debug!(host = %host, command = %command, "Running remote command");
        self.exec(host, command, None).await
    }

    async fn write_file(&self, host: &str, path: &str, contents: &str) -> Result<()> {
        debug!(host = %host, path = %path, "Writing remote file");
        let remote = format!("sudo tee {} > /dev/null", path);
        self.exec(host, &remote, Some(contents)).await.map(|_| ())
    }
}

/// Connects with [`SshShell`]
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl ShellConnector for SshConnector {
    fn connect(&self, target: &SshTarget) -> Result<Arc<dyn NodeShell>> {
        if target.user.is_empty() {
            return Err(Error::invalid_args("an ssh user is required"));
        }
        Ok(Arc::new(SshShell::new(target.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn connections_hop_through_the_jump_host() {
        let shell = SshShell::new(SshTarget {
            user: "azureuser".to_string(),
            private_key: PathBuf::from("/keys/id_rsa"),
            jump_host: Some("kestrel.westus2.cloudapp.azure.com".to_string()),
            port: DEFAULT_SSH_PORT,
        });
        let args = args(&shell.command("k8s-agentpool1-12345678-0", "hostname"));
        assert!(args.contains(&"-J".to_string()));
        assert!(args.contains(&"azureuser@kestrel.westus2.cloudapp.azure.com:22".to_string()));
        assert_eq!(args[args.len() - 2], "azureuser@k8s-agentpool1-12345678-0");
        assert_eq!(args[args.len() - 1], "hostname");
    }

    #[test]
    fn direct_connections_use_the_port_flag() {
        let shell = SshShell::new(SshTarget {
            user: "azureuser".to_string(),
            private_key: PathBuf::from("/keys/id_rsa"),
            jump_host: None,
            port: 2200,
        });
        let args = args(&shell.command("10.240.255.5", "true"));
        assert!(!args.contains(&"-J".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2200"));
    }

    #[test]
    fn connector_requires_a_user() {
        let target = SshTarget {
            user: String::new(),
            private_key: PathBuf::from("/keys/id_rsa"),
            jump_host: None,
            port: DEFAULT_SSH_PORT,
        };
        assert!(SshConnector.connect(&target).is_err());
    }
}
