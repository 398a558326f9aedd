use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::process::DeployedProcess;
use crate::transport::TransportError;

/// Address the deployed kernel must connect back to, handed down as an
/// environment variable.
pub const ENV_REMOTE_ADDRESS: &str = "TIDEPOOL_REMOTE_ADDRESS";

/// Launches the kernel process for a transport server.
///
/// Implementations decide what to run (a local binary, spark-submit, a
/// container); the transport only needs a process that connects back to
/// `server_addr` and speaks the channel protocol.
#[async_trait]
pub trait Deploy: Send + Sync {
    async fn deploy_kernel(&self, server_addr: SocketAddr)
    -> Result<DeployedProcess, TransportError>;
}

/// Merge of server-wide and per-notebook environment; notebook entries win.
pub fn merged_env(
    global: &HashMap<String, String>,
    notebook: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = global.clone();
    for (key, value) in notebook {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Deploys a kernel by spawning a command line on this host.
///
/// The kernel becomes its own process group leader so a later kill reaps
/// any helpers it forked; its output is piped for the remote log drain.
#[derive(Debug, Clone, Default)]
pub struct CommandDeploy {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl CommandDeploy {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Applies the merged server-wide and per-notebook environment.
    pub fn notebook_env(
        mut self,
        global: &HashMap<String, String>,
        notebook: &HashMap<String, String>,
    ) -> Self {
        self.env = merged_env(global, notebook);
        self
    }
}

#[async_trait]
impl Deploy for CommandDeploy {
    async fn deploy_kernel(
        &self,
        server_addr: SocketAddr,
    ) -> Result<DeployedProcess, TransportError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .env(ENV_REMOTE_ADDRESS, server_addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|err| {
            TransportError::Process(format!(
                "failed to spawn kernel {}: {err}",
                self.program.display()
            ))
        })?;
        let process = DeployedProcess::new(child)?;
        info!(
            target = "tidepool::kernel::deploy",
            program = %self.program.display(),
            pid = process.pid(),
            server = %server_addr,
            "kernel process deployed"
        );
        Ok(process)
    }
}
