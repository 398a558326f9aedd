use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::transport::TransportError;

/// A deployed kernel process: exit observation, termination, log draining.
///
/// The `Child` itself lives on a monitor task; handles are cheap clones that
/// share the exit watch and the kill signal.
#[derive(Debug, Clone)]
pub struct DeployedProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::Sender<()>,
}

impl DeployedProcess {
    /// Takes ownership of a freshly spawned child. Its piped stdout/stderr
    /// are drained line-by-line into the remote kernel log.
    pub fn new(mut child: Child) -> Result<Self, TransportError> {
        let pid = child
            .id()
            .ok_or_else(|| TransportError::Process("kernel process already exited".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_kernel_lines(BufReader::new(stdout), "stdout", pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_kernel_lines(BufReader::new(stderr), "stderr", pid));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => {
                                let code = exit_code(status);
                                info!(
                                    target = "tidepool::kernel::process",
                                    pid,
                                    code,
                                    "kernel process exited"
                                );
                                let _ = exit_tx.send(Some(code));
                            }
                            Err(err) => {
                                warn!(
                                    target = "tidepool::kernel::process",
                                    pid,
                                    error = %err,
                                    "failed to await kernel process"
                                );
                                let _ = exit_tx.send(Some(-1));
                            }
                        }
                        break;
                    }
                    request = kill_rx.recv() => {
                        match request {
                            Some(()) => {
                                if let Err(err) = child.start_kill() {
                                    debug!(
                                        target = "tidepool::kernel::process",
                                        pid,
                                        error = %err,
                                        "kill requested for exited kernel"
                                    );
                                }
                            }
                            // Every handle is gone; kill_on_drop reaps the child.
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            pid,
            exit: exit_rx,
            kill_tx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// `None` iff the process is still alive.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Waits up to `timeout` for the process to exit; `None` on timeout.
    pub async fn await_exit(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.exit.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await {
            Ok(Ok(slot)) => *slot,
            Ok(Err(_)) => self.exit_status(),
            Err(_) => None,
        }
    }

    /// Waits for exit with no deadline.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit.clone();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.unwrap_or(-1),
            Err(_) => self.exit_status().unwrap_or(-1),
        }
    }

    /// Requests termination of the kernel's process group.
    pub fn kill(&self) -> Result<(), TransportError> {
        #[cfg(unix)]
        {
            // The deploy spawns the kernel as its own group leader, so this
            // reaps helper processes too. ESRCH means it is already gone.
            let result = unsafe { libc::killpg(self.pid as i32, libc::SIGKILL) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(TransportError::Process(format!(
                        "failed to kill kernel process group {}: {err}",
                        self.pid
                    )));
                }
            }
        }
        let _ = self.kill_tx.try_send(());
        Ok(())
    }

    /// Waits `grace` for a natural exit, then kills and waits `grace` again.
    pub async fn await_or_kill(&self, grace: Duration) -> Result<i32, TransportError> {
        if let Some(code) = self.await_exit(grace).await {
            return Ok(code);
        }
        warn!(
            target = "tidepool::kernel::process",
            pid = self.pid,
            grace_ms = grace.as_millis(),
            "kernel did not exit within grace period; killing"
        );
        self.kill()?;
        if let Some(code) = self.await_exit(grace).await {
            return Ok(code);
        }
        Err(TransportError::Process(format!(
            "kernel process {} survived kill",
            self.pid
        )))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

async fn forward_kernel_lines<R>(mut reader: BufReader<R>, stream: &'static str, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if !trimmed.is_empty() {
                    info!(target: "tidepool::kernel::remote", pid, stream, message = trimmed);
                }
            }
            Err(err) => {
                warn!(
                    target: "tidepool::kernel::remote",
                    pid,
                    stream,
                    error = %err,
                    "failed to read kernel output"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> DeployedProcess {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        DeployedProcess::new(command.spawn().expect("spawn sh")).expect("wrap child")
    }

    #[tokio::test]
    async fn observes_natural_exit_code() {
        let process = spawn_sh("exit 7");
        let code = process.await_exit(Duration::from_secs(5)).await;
        assert_eq!(code, Some(7));
        assert_eq!(process.exit_status(), Some(7));
    }

    #[tokio::test]
    async fn await_exit_times_out_while_running() {
        let process = spawn_sh("sleep 30");
        assert_eq!(process.exit_status(), None);
        let code = process.await_exit(Duration::from_millis(50)).await;
        assert_eq!(code, None);
        process.kill().expect("kill");
        let code = process.await_exit(Duration::from_secs(5)).await;
        assert!(code.is_some());
    }

    #[tokio::test]
    async fn await_or_kill_prefers_natural_exit() {
        let process = spawn_sh("exit 0");
        let code = process
            .await_or_kill(Duration::from_secs(5))
            .await
            .expect("await");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn await_or_kill_escalates() {
        let process = spawn_sh("sleep 30");
        let code = process
            .await_or_kill(Duration::from_millis(100))
            .await
            .expect("await or kill");
        // Killed, not a natural zero exit.
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn kill_is_safe_after_exit() {
        let process = spawn_sh("exit 0");
        let _ = process.await_exit(Duration::from_secs(5)).await;
        process.kill().expect("kill after exit");
    }
}
