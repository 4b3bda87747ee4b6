//! Status and progress events emitted to the controlling collaborator.
//!
//! Every logical transition produces exactly one event; events for a row are
//! delivered in the order they were produced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-file lifecycle status.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Queued,
    DetectingLength,
    CalculatingRate,
    Skipped,
    Processing,
    ProcessingAudio,
    Finalizing,
    Replacing,
    Completed,
    Estimated,
    Cancelled,
    Error(String),
}

impl Status {
    /// Whether no further transitions follow this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Skipped
                | Status::Completed
                | Status::Estimated
                | Status::Cancelled
                | Status::Error(_)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Queued => write!(f, "Queued"),
            Status::DetectingLength => write!(f, "Detecting video length"),
            Status::CalculatingRate => write!(f, "Calculating MB/min"),
            Status::Skipped => write!(f, "Skipped"),
            Status::Processing => write!(f, "Processing"),
            Status::ProcessingAudio => write!(f, "Processing Audio"),
            Status::Finalizing => write!(f, "Finalizing"),
            Status::Replacing => write!(f, "Replacing"),
            Status::Completed => write!(f, "Completed"),
            Status::Estimated => write!(f, "Estimated"),
            Status::Cancelled => write!(f, "Cancelled"),
            Status::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

/// Table column a rate or size metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricColumn {
    MbPerMinBefore,
    MbAfter,
    MbPerMinAfter,
}

/// Which pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Probe, encode, validate and commit.
    Process,
    /// Probe and compute rates only.
    Estimate,
}

/// Global run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Aggregate counts for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub estimated: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Megabytes freed by completed encodes.
    pub mb_saved: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    FileDiscovered {
        row: usize,
        path: PathBuf,
        size_mb: f64,
    },
    DiscoveryFinished {
        files: usize,
    },
    RunStarted {
        mode: RunMode,
    },
    Status {
        row: usize,
        status: Status,
    },
    Length {
        row: usize,
        length: String,
    },
    Metric {
        row: usize,
        column: MetricColumn,
        value: f64,
    },
    Progress {
        percent: f64,
    },
    Speed {
        speed: String,
    },
    RunFinished {
        outcome: RunOutcome,
        summary: RunSummary,
    },
}

/// Sending half of the event stream.
///
/// Emitting never fails; events are dropped once the receiver is gone.
#[derive(Debug, Clone, Default)]
pub struct Events {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Events {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, row: usize, status: Status) {
        self.emit(RunEvent::Status { row, status });
    }

    pub fn length(&self, row: usize, length: String) {
        self.emit(RunEvent::Length { row, length });
    }

    pub fn metric(&self, row: usize, column: MetricColumn, value: f64) {
        self.emit(RunEvent::Metric { row, column, value });
    }
}

/// Shared cancellation flag.
///
/// Set from outside the worker; polled between files and while an encode is
/// running.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
