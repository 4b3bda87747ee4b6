//! Console rendering of run events.

use ez_ffmpeg::{MetricColumn, RunEvent, RunMode, RunOutcome, RunSnapshot};

/// Only print progress when it moves by at least this many percent.
const PROGRESS_STEP: f64 = 5.0;

/// Turns the event stream into console lines, keeping the table snapshot current.
#[derive(Debug, Default)]
pub struct Renderer {
    last_percent: Option<f64>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `event` into `snapshot` and return the line to print, if any.
    pub fn render(&mut self, snapshot: &mut RunSnapshot, event: &RunEvent) -> Option<String> {
        snapshot.apply(event);
        let name = |row: &usize| {
            snapshot
                .rows
                .get(*row)
                .map(|r| r.filename.clone())
                .unwrap_or_else(|| format!("#{}", row))
        };

        match event {
            RunEvent::FileDiscovered { row, size_mb, .. } => {
                Some(format!("[{:>3}] {} ({:.2} MB)", row, name(row), size_mb))
            }
            RunEvent::DiscoveryFinished { files } => Some(format!("{} video file(s) queued", files)),
            RunEvent::RunStarted { mode } => Some(match mode {
                RunMode::Process => "Processing queue...".to_string(),
                RunMode::Estimate => "Estimating queue...".to_string(),
            }),
            RunEvent::Status { row, status } => {
                self.last_percent = None;
                Some(format!("[{:>3}] {}: {}", row, name(row), status))
            }
            RunEvent::Length { row, length } => {
                Some(format!("[{:>3}] {}: length {}", row, name(row), length))
            }
            RunEvent::Metric { row, column, value } => {
                let label = match column {
                    MetricColumn::MbPerMinBefore => "MB/min before",
                    MetricColumn::MbAfter => "MB after",
                    MetricColumn::MbPerMinAfter => "MB/min after",
                };
                Some(format!("[{:>3}] {}: {} {:.2}", row, name(row), label, value))
            }
            RunEvent::Progress { percent } => {
                let due = match self.last_percent {
                    None => true,
                    Some(last) => *percent - last >= PROGRESS_STEP || (*percent >= 100.0 && last < 100.0),
                };
                if !due {
                    return None;
                }
                self.last_percent = Some(*percent);
                let speed = snapshot.speed.as_deref().unwrap_or("-");
                Some(format!("      {:>5.1}% at {}", percent, speed))
            }
            RunEvent::Speed { .. } => None,
            RunEvent::RunFinished { outcome, summary } => {
                let verb = match outcome {
                    RunOutcome::Completed => "Run finished",
                    RunOutcome::Cancelled => "Run cancelled",
                };
                Some(format!(
                    "{}: {} completed, {} skipped, {} estimated, {} failed, {} cancelled, {:.2} MB saved",
                    verb,
                    summary.completed,
                    summary.skipped,
                    summary.estimated,
                    summary.failed,
                    summary.cancelled,
                    summary.mb_saved
                ))
            }
        }
    }
}
