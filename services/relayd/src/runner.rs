//! External command lifecycle (`run_on_init`, `run_on_demand`,
//! `run_on_publish`, `run_on_read`).
//!
//! A [`Runner`] launches the configured command through `sh -c`, optionally
//! relaunches it with a fixed pause when it exits, and can be closed
//! synchronously — `close()` kills the child and joins the supervising task
//! before returning.
//!
//! `$MTX_PATH` / `$MTX_PORT` are substituted inside the command string and
//! exported to the child's environment.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub command: String,
    pub restart: bool,
    /// Resolved path name, exported as `MTX_PATH`.
    pub path_name: String,
    /// Ingress listener port, exported as `MTX_PORT`.
    pub port: u16,
    pub restart_pause: Duration,
}

impl RunnerSpec {
    pub fn new(command: impl Into<String>, restart: bool, path_name: impl Into<String>, port: u16) -> Self {
        RunnerSpec {
            command: command.into(),
            restart,
            path_name: path_name.into(),
            port,
            restart_pause: DEFAULT_RESTART_PAUSE,
        }
    }
}

pub struct Runner {
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Runner {
    pub fn spawn(spec: RunnerSpec) -> Runner {
        let (terminate, terminate_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(spec, terminate_rx));
        Runner { terminate, task }
    }

    /// Kill the child (if running) and join the supervisor.
    pub async fn close(self) {
        let _ = self.terminate.send(true);
        let _ = self.task.await;
    }
}

fn spawn_child(spec: &RunnerSpec) -> std::io::Result<Child> {
    let port = spec.port.to_string();
    let expanded = spec
        .command
        .replace("$MTX_PATH", &spec.path_name)
        .replace("$MTX_PORT", &port);
    Command::new("sh")
        .arg("-c")
        .arg(&expanded)
        .env("MTX_PATH", &spec.path_name)
        .env("MTX_PORT", &port)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn supervise(spec: RunnerSpec, mut terminate: watch::Receiver<bool>) {
    loop {
        let mut child = match spawn_child(&spec) {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %spec.command, error = %e, "command spawn failed");
                if !spec.restart {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(spec.restart_pause) => continue,
                    _ = terminate.changed() => return,
                }
            }
        };
        debug!(command = %spec.command, path = %spec.path_name, "command started");

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(command = %spec.command, %status, "command exited"),
                    Err(e) => warn!(command = %spec.command, error = %e, "command wait failed"),
                }
            }
            _ = terminate.changed() => {
                let _ = child.kill().await;
                return;
            }
        }

        if !spec.restart {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(spec.restart_pause) => {}
            _ = terminate.changed() => return,
        }
    }
}
