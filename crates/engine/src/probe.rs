//! Media duration probing through an external prober.
//!
//! The prober is always invoked with an argument list, never through a shell.
//! Probes of freshly encoded files go through [`Prober::duration_with_retry`]
//! because the encoder may still be flushing when it exits.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that can occur while probing a file's duration.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The prober exited unsuccessfully.
    #[error("prober exited with {code}: {stderr}")]
    Failed { code: String, stderr: String },

    /// The prober output was not a usable duration.
    #[error("unparsable duration output '{0}'")]
    Parse(String),

    /// The prober could not be launched.
    #[error("failed to run prober: {0}")]
    Io(#[from] std::io::Error),
}

/// Retry schedule for probes that may hit a file still being finalized.
///
/// The delay before attempt `n + 1` is `initial_delay + n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub step: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            step: Duration::ZERO,
        }
    }

    /// `attempts` tries with no waiting in between.
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            step: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.initial_delay + self.step * attempt
    }
}

impl Default for RetryPolicy {
    /// Five attempts, waiting 0.3s, 0.5s, 0.7s and 0.9s in between.
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(300),
            step: Duration::from_millis(200),
        }
    }
}

/// Handle on the external duration prober.
#[derive(Debug, Clone)]
pub struct Prober {
    program: PathBuf,
}

impl Prober {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Build the prober invocation printing only the container duration.
    pub fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]);
        cmd.arg(path);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Probe a file's duration in seconds with a single attempt.
    pub async fn duration(&self, path: &Path) -> Result<f64, ProbeError> {
        debug!(prober = %self.program.display(), path = %path.display(), "probing duration");
        let output = self.command(path).output().await?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("code {}", c))
                .unwrap_or_else(|| "signal".to_string());
            return Err(ProbeError::Failed {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Probe a file's duration, retrying failures on the given schedule.
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn duration_with_retry(
        &self,
        path: &Path,
        policy: &RetryPolicy,
    ) -> Result<f64, ProbeError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.duration(path).await {
                Ok(secs) => return Ok(secs),
                Err(e) if attempt + 1 < attempts => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        path = %path.display(),
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        "probe failed: {}", e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse the prober's stdout into seconds.
///
/// Accepts the first non-empty line; the value must be a finite, non-negative
/// number.
pub fn parse_duration_output(stdout: &str) -> Result<f64, ProbeError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    match line.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(ProbeError::Parse(line.to_string())),
    }
}

/// Render seconds as zero-padded `HH:MM:SS`, truncating fractions.
pub fn format_length(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
