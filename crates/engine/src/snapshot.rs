//! Run snapshot for the status endpoint and console rendering
//!
//! Folds the event stream into a table with one row per discovered file,
//! plus run-level state, with JSON serialization support.

use crate::event::{MetricColumn, RunEvent, RunMode, RunOutcome, RunState, RunSummary, Status};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One table row
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowSnapshot {
    pub filename: String,
    pub status: String,
    pub mb_before: f64,
    pub mb_per_min_before: Option<f64>,
    pub length: Option<String>,
    pub mb_after: Option<f64>,
    pub mb_per_min_after: Option<f64>,
}

/// Complete run snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub state: RunState,
    pub mode: Option<RunMode>,
    pub last_outcome: Option<RunOutcome>,
    pub summary: Option<RunSummary>,
    /// Progress of the file currently encoding
    pub percent: f64,
    pub speed: Option<String>,
    pub rows: Vec<RowSnapshot>,
}

/// Shared snapshot state for concurrent access
pub type SharedSnapshot = Arc<RwLock<RunSnapshot>>;

/// Creates a new SharedSnapshot with default values
pub fn new_shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(RunSnapshot::default()))
}

impl RunSnapshot {
    fn row_mut(&mut self, row: usize) -> &mut RowSnapshot {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, RowSnapshot::default);
        }
        &mut self.rows[row]
    }

    /// Apply one event
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::FileDiscovered { row, path, size_mb } => {
                let entry = self.row_mut(*row);
                *entry = RowSnapshot {
                    filename: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string()),
                    status: Status::Queued.to_string(),
                    mb_before: *size_mb,
                    ..RowSnapshot::default()
                };
            }
            RunEvent::DiscoveryFinished { .. } => {}
            RunEvent::RunStarted { mode } => {
                self.state = RunState::Running;
                self.mode = Some(*mode);
                self.summary = None;
                self.percent = 0.0;
                self.speed = None;
            }
            RunEvent::Status { row, status } => {
                if matches!(status, Status::Processing | Status::ProcessingAudio) {
                    self.percent = 0.0;
                    self.speed = None;
                }
                self.row_mut(*row).status = status.to_string();
            }
            RunEvent::Length { row, length } => {
                self.row_mut(*row).length = Some(length.clone());
            }
            RunEvent::Metric { row, column, value } => {
                let entry = self.row_mut(*row);
                match column {
                    MetricColumn::MbPerMinBefore => entry.mb_per_min_before = Some(*value),
                    MetricColumn::MbAfter => entry.mb_after = Some(*value),
                    MetricColumn::MbPerMinAfter => entry.mb_per_min_after = Some(*value),
                }
            }
            RunEvent::Progress { percent } => self.percent = *percent,
            RunEvent::Speed { speed } => self.speed = Some(speed.clone()),
            RunEvent::RunFinished { outcome, summary } => {
                self.state = RunState::Idle;
                self.last_outcome = Some(*outcome);
                self.summary = Some(summary.clone());
            }
        }
    }
}
