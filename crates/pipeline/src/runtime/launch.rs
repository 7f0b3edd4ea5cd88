use super::LaunchSpec;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// How the launched process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signalled(i32),
}

impl ExitOutcome {
    /// Shell convention: the exit code, or 128 plus the signal number
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Signalled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signalled(signal);
            }
        }
        ExitOutcome::Exited(1)
    }
}

/// Signals relayed from this process to the launched one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn forward(child: &mut Child, relay: Relay) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match relay {
        Relay::Interrupt => Signal::SIGINT,
        Relay::Terminate => Signal::SIGTERM,
    };
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        if let Err(e) = kill(target, signal) {
            warn!(pid, ?relay, "Failed to forward signal: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn forward(child: &mut Child, _relay: Relay) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop child process: {}", e);
    }
}

/// Termination requests aimed at this process. Pending forever when the
/// platform has no such signal or the handler cannot be installed.
struct Terminations {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Terminations {
    #[cfg(unix)]
    fn listen() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let signal = match signal(SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Cannot listen for termination requests: {}", e);
                None
            }
        };
        Self { signal }
    }

    #[cfg(not(unix))]
    fn listen() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        match self.signal.as_mut() {
            Some(signal) => {
                if signal.recv().await.is_none() {
                    self.signal = None;
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Run the process described by `spec` against the image materialised at
/// `root` and wait for it. Standard streams are inherited. An interrupt or
/// termination request received meanwhile is passed on to the child rather
/// than acted on; the child is killed if this future is dropped.
pub async fn launch(spec: &LaunchSpec, root: &Path) -> Result<ExitOutcome> {
    let workdir = spec.host_workdir(root);
    if !workdir.is_dir() {
        anyhow::bail!(
            "Working directory {} does not exist in the image",
            spec.workdir
        );
    }

    // Installed before spawning so an early request is not lost.
    let mut terminations = Terminations::listen();

    info!(argv = ?spec.argv, workdir = %spec.workdir, "Launching entrypoint");
    let mut child = spec
        .command(root)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.argv[0]))?;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status.context("Failed to wait for child process")?,
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    debug!("Forwarding interrupt to child");
                    forward(&mut child, Relay::Interrupt);
                }
                Err(e) => {
                    warn!("Cannot listen for interrupts: {}", e);
                    break child.wait().await.context("Failed to wait for child process")?;
                }
            },
            () = terminations.recv() => {
                debug!("Forwarding termination request to child");
                forward(&mut child, Relay::Terminate);
            }
        }
    };

    let outcome = ExitOutcome::from(status);
    info!(exit_code = outcome.exit_code(), "Process exited");
    Ok(outcome)
}
