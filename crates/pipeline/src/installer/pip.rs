use super::{read_manifest, InstallReport, InstallRequest, PackageInstaller};
use async_trait::async_trait;
use slipway_core::config::SlipwayConfig;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

const FIXED_FLAGS: &[&str] = &["--no-cache-dir", "--disable-pip-version-check"];
const STDERR_TAIL_LINES: usize = 20;

/// Runs `pip install` against the staged manifest, installing into a prefix
#[derive(Debug, Clone)]
pub struct PipInstaller {
    /// Program plus leading arguments, e.g. `["python3", "-m", "pip"]`
    command: Vec<String>,
    /// Passed as `--index-url` when set
    index_url: Option<String>,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(program: &str, timeout: Duration) -> Self {
        let mut command: Vec<String> = program.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            command.push("pip".to_string());
        }
        Self {
            command,
            index_url: None,
            timeout,
        }
    }

    pub fn with_index_url(mut self, index_url: impl Into<String>) -> Self {
        self.index_url = Some(index_url.into());
        self
    }

    pub fn from_config(config: &SlipwayConfig) -> Self {
        Self::new(
            &config.pip_program,
            Duration::from_secs(config.install_timeout_secs),
        )
        .with_index_url(&config.package_index)
    }

    fn args(&self, request: &InstallRequest) -> Vec<String> {
        let mut args: Vec<String> = self.command[1..].to_vec();
        args.push("install".to_string());
        args.extend(FIXED_FLAGS.iter().map(|f| f.to_string()));
        args.push("--prefix".to_string());
        args.push(request.prefix.display().to_string());
        if let Some(index_url) = &self.index_url {
            args.push("--index-url".to_string());
            args.push(index_url.clone());
        }
        args.push("-r".to_string());
        args.push(request.manifest.clone());
        args.extend(request.extra_args.iter().cloned());
        args
    }
}

async fn drain<R>(reader: R, stream: &'static str) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("  [pip:{}] {}", stream, line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    fn identity(&self) -> String {
        let mut identity = format!("{} install {}", self.command.join(" "), FIXED_FLAGS.join(" "));
        if let Some(index_url) = &self.index_url {
            identity.push_str(" --index-url ");
            identity.push_str(index_url);
        }
        identity
    }

    async fn install(&self, request: &InstallRequest) -> Result<InstallReport, BuildError> {
        let start = Instant::now();
        let requirements = read_manifest(request)?;

        if requirements.is_empty() {
            info!(manifest = %request.manifest, "Manifest lists no dependencies, skipping install");
            return Ok(InstallReport {
                requested: 0,
                skipped: true,
                duration: start.elapsed(),
            });
        }

        let args = self.args(request);
        info!(
            manifest = %request.manifest,
            requested = requirements.len(),
            "Running {} {}",
            self.command[0],
            args.join(" ")
        );

        let mut child = Command::new(&self.command[0])
            .args(&args)
            .current_dir(&request.workdir)
            .env("PIP_NO_INPUT", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuildError::install(
                    &request.manifest,
                    format!("failed to start {}: {}", self.command[0], e),
                )
            })?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(drain(s, "stdout")));
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s, "stderr")));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| BuildError::install(&request.manifest, e))?,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                return Err(BuildError::install(
                    &request.manifest,
                    format!("installer timed out after {}s", self.timeout.as_secs()),
                ));
            }
            _ = request.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(BuildError::Cancelled { step: StepKind::Dependencies });
            }
        };

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let tail: Vec<String> = stderr_tail.into_iter().collect();
            return Err(BuildError::install(
                &request.manifest,
                format!("installer exited with {}:\n{}", code, tail.join("\n")),
            ));
        }

        let duration = start.elapsed();
        info!(
            manifest = %request.manifest,
            duration_ms = duration.as_millis(),
            "Dependencies installed"
        );

        Ok(InstallReport {
            requested: requirements.len(),
            skipped: false,
            duration,
        })
    }
}
