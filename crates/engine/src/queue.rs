//! Queue runner: drives every discovered file through the pipeline.
//!
//! A run walks the queue largest-first (or in discovery order for an
//! estimate), probing, deciding, encoding, validating and committing each
//! file while emitting one status event per transition. Every file runs in
//! its own task so an unexpected failure is contained to its row.

use crate::budget::{bytes_to_mb, rate, target_video_bitrate, within_budget};
use crate::encode::{
    build_encode_command, output_path_for, processed_file_name, run_encode, EncodeError,
    EncodeExit, EncodeMode, EncodeOutcome, EncodeParams,
};
use crate::event::{
    Events, MetricColumn, RunEvent, RunMode, RunOutcome, RunSummary, Status, StopFlag,
};
use crate::probe::{format_length, ProbeError, Prober, RetryPolicy};
use crate::replace::{commit, move_into_place, CommitError};
use crate::scan::DiscoveredFile;
use crate::scratch::{ScratchOutput, WorkingCopy};
use crate::validate::{evaluate, Measurement, ValidationMode};
use ez_ffmpeg_config::{ProcessingSpec, ToolsConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// A file in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    /// Table row, assigned in discovery order.
    pub row: usize,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Filled in once probed.
    pub duration_secs: Option<f64>,
    pub status: Status,
}

impl MediaFile {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes)
    }
}

/// Discovered files, deduplicated by path.
#[derive(Debug, Default)]
pub struct MediaQueue {
    files: Vec<MediaFile>,
    seen: HashSet<PathBuf>,
}

impl MediaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a discovered file, returning the queued entry or `None` for a
    /// path already in the queue.
    pub fn push(&mut self, file: DiscoveredFile) -> Option<&MediaFile> {
        if !self.seen.insert(file.path.clone()) {
            return None;
        }
        let row = self.files.len();
        self.files.push(MediaFile {
            row,
            path: file.path,
            size_bytes: file.size_bytes,
            duration_secs: None,
            status: Status::Queued,
        });
        self.files.last()
    }

    pub fn files(&self) -> &[MediaFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.seen.clear();
    }

    /// Write back the state a finished run reached for each row.
    pub fn absorb(&mut self, updated: &[MediaFile]) {
        for file in updated {
            if let Some(slot) = self.files.get_mut(file.row) {
                slot.duration_secs = file.duration_secs;
                slot.status = file.status.clone();
            }
        }
    }
}

/// Everything a run needs, shared by all per-file tasks.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub spec: ProcessingSpec,
    pub tools: ToolsConfig,
    pub scratch_dir: PathBuf,
    /// Encode from a working copy in the scratch directory.
    pub copy_source: bool,
    /// Schedule for probing freshly encoded outputs.
    pub output_probe_retry: RetryPolicy,
    pub events: Events,
    pub stop: StopFlag,
}

impl RunContext {
    fn prober(&self) -> Prober {
        Prober::new(&self.tools.ffprobe)
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    /// Queue entries with the status each reached, in row order.
    pub files: Vec<MediaFile>,
}

/// Per-file pipeline failure, rendered into the row's `Error:` status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not detect length: {0}")]
    Probe(#[source] ProbeError),

    #[error("could not verify output: {0}")]
    OutputProbe(#[source] ProbeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("encoder exited with {code} and produced no output{detail}")]
    NoOutput { code: String, detail: String },

    #[error("{0}")]
    Rejected(String),

    #[error("replace failed, encoded file kept in cache: {0}")]
    Commit(#[source] CommitError),

    #[error("replace failed, encoded file kept in cache: {0}")]
    CommitTask(#[source] tokio::task::JoinError),

    #[error("scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FileOutcome {
    Completed { mb_saved: f64 },
    Skipped,
    Estimated,
    Cancelled,
    Failed,
}

#[derive(Debug)]
struct FileReport {
    outcome: FileOutcome,
    duration_secs: Option<f64>,
    status: Status,
}

/// Order in which a run visits the queue.
pub fn run_order(files: &[MediaFile], mode: RunMode) -> Vec<MediaFile> {
    let mut ordered = files.to_vec();
    if mode == RunMode::Process {
        // Stable sort keeps discovery order among equal sizes
        ordered.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
    }
    ordered
}

/// Run the whole queue.
///
/// Stops before the next file once the stop flag is set; a run interrupted
/// that way ends [`RunOutcome::Cancelled`]. Per-file failures never end the
/// run early.
pub async fn run_queue(ctx: Arc<RunContext>, files: Vec<MediaFile>, mode: RunMode) -> RunReport {
    ctx.events.emit(RunEvent::RunStarted { mode });
    info!(files = files.len(), ?mode, "run started");

    let mut summary = RunSummary::default();
    let mut processed: HashSet<PathBuf> = HashSet::new();
    let mut finished: Vec<MediaFile> = files.clone();
    let mut outcome = RunOutcome::Completed;

    for file in run_order(&files, mode) {
        if !processed.insert(file.path.clone()) {
            continue;
        }
        if ctx.stop.is_set() {
            outcome = RunOutcome::Cancelled;
            break;
        }

        let row = file.row;
        let report = match tokio::spawn(process_file(ctx.clone(), file, mode)).await {
            Ok(report) => report,
            Err(join_err) => {
                error!(row, "file task failed: {}", join_err);
                let status = Status::Error("unexpected internal failure".to_string());
                ctx.events.status(row, status.clone());
                FileReport {
                    outcome: FileOutcome::Failed,
                    duration_secs: None,
                    status,
                }
            }
        };

        match report.outcome {
            FileOutcome::Completed { mb_saved } => {
                summary.completed += 1;
                summary.mb_saved += mb_saved;
            }
            FileOutcome::Skipped => summary.skipped += 1,
            FileOutcome::Estimated => summary.estimated += 1,
            FileOutcome::Failed => summary.failed += 1,
            FileOutcome::Cancelled => summary.cancelled += 1,
        }

        if let Some(slot) = finished.iter_mut().find(|f| f.row == row) {
            slot.duration_secs = report.duration_secs.or(slot.duration_secs);
            slot.status = report.status;
        }

        if report.outcome == FileOutcome::Cancelled {
            outcome = RunOutcome::Cancelled;
            break;
        }
    }

    info!(
        ?outcome,
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        mb_saved = summary.mb_saved,
        "run finished"
    );
    ctx.events.emit(RunEvent::RunFinished {
        outcome,
        summary: summary.clone(),
    });

    RunReport {
        outcome,
        summary,
        files: finished,
    }
}

async fn process_file(ctx: Arc<RunContext>, file: MediaFile, mode: RunMode) -> FileReport {
    let mut duration_secs = None;
    let result = match mode {
        RunMode::Process => process_pipeline(&ctx, &file, &mut duration_secs).await,
        RunMode::Estimate => estimate_pipeline(&ctx, &file, &mut duration_secs).await,
    };

    let (outcome, status) = match result {
        Ok(outcome) => {
            let status = match outcome {
                FileOutcome::Completed { .. } => Status::Completed,
                FileOutcome::Skipped => Status::Skipped,
                FileOutcome::Estimated => Status::Estimated,
                FileOutcome::Cancelled => Status::Cancelled,
                FileOutcome::Failed => Status::Error("failed".to_string()),
            };
            (outcome, status)
        }
        Err(e) => {
            warn!(row = file.row, path = %file.path.display(), "{}", e);
            (FileOutcome::Failed, Status::Error(e.to_string()))
        }
    };

    ctx.events.status(file.row, status.clone());
    FileReport {
        outcome,
        duration_secs,
        status,
    }
}

/// Probe the input and publish its length and rate.
async fn measure_input(
    ctx: &RunContext,
    file: &MediaFile,
    duration_out: &mut Option<f64>,
) -> Result<f64, PipelineError> {
    let row = file.row;
    ctx.events.status(row, Status::DetectingLength);
    let duration = match ctx.prober().duration(&file.path).await {
        Ok(secs) => secs,
        Err(e) => {
            ctx.events.length(row, "Error".to_string());
            return Err(PipelineError::Probe(e));
        }
    };
    *duration_out = Some(duration);

    ctx.events.status(row, Status::CalculatingRate);
    let rate_before = rate(file.size_mb(), duration);
    ctx.events.length(row, format_length(duration));
    ctx.events
        .metric(row, MetricColumn::MbPerMinBefore, rate_before);
    info!(row, path = %file.path.display(), duration, rate = rate_before, "measured");
    Ok(rate_before)
}

async fn estimate_pipeline(
    ctx: &RunContext,
    file: &MediaFile,
    duration_out: &mut Option<f64>,
) -> Result<FileOutcome, PipelineError> {
    measure_input(ctx, file, duration_out).await?;
    Ok(FileOutcome::Estimated)
}

async fn process_pipeline(
    ctx: &RunContext,
    file: &MediaFile,
    duration_out: &mut Option<f64>,
) -> Result<FileOutcome, PipelineError> {
    let row = file.row;
    let spec = &ctx.spec;
    let rate_before = measure_input(ctx, file, duration_out).await?;
    let duration = duration_out.unwrap_or_default();

    let mode = if spec.convert {
        if within_budget(rate_before, spec.rate_limit()) {
            None
        } else {
            Some(EncodeMode::Video {
                bitrate_bps: target_video_bitrate(spec.target_rate),
            })
        }
    } else if spec.has_audio_filters() {
        Some(EncodeMode::AudioOnly)
    } else {
        None
    };

    let Some(mode) = mode else {
        info!(row, rate = rate_before, limit = spec.rate_limit(), "within budget, skipping");
        ctx.events.metric(row, MetricColumn::MbAfter, file.size_mb());
        ctx.events
            .metric(row, MetricColumn::MbPerMinAfter, rate_before);
        return Ok(FileOutcome::Skipped);
    };

    tokio::fs::create_dir_all(&ctx.scratch_dir).await?;
    let working_copy = if ctx.copy_source {
        Some(WorkingCopy::acquire(&file.path, &ctx.scratch_dir).await?)
    } else {
        None
    };
    let encoder_input = working_copy
        .as_ref()
        .map(|c| c.path().to_path_buf())
        .unwrap_or_else(|| file.path.clone());
    let mut output = ScratchOutput::new(output_path_for(&file.path, &ctx.scratch_dir));

    let params = EncodeParams {
        input: encoder_input,
        output: output.path().to_path_buf(),
        video_codec: ctx.tools.video_codec.clone(),
        audio_codec: ctx.tools.audio_codec.clone(),
        mode,
        normalize: spec.normalize,
        stereo: spec.stereo,
    };
    let command = build_encode_command(&ctx.tools.ffmpeg, &params);
    info!(row, ?command, "starting encoder");

    ctx.events.status(
        row,
        match mode {
            EncodeMode::Video { .. } => Status::Processing,
            EncodeMode::AudioOnly => Status::ProcessingAudio,
        },
    );

    let events = ctx.events.clone();
    let encoded = run_encode(command, duration, &ctx.stop, move |progress| {
        if let Some(percent) = progress.percent {
            events.emit(RunEvent::Progress { percent });
        }
        if let Some(speed) = progress.speed {
            events.emit(RunEvent::Speed { speed });
        }
    })
    .await?;

    let code = match encoded.exit {
        EncodeExit::Cancelled => {
            info!(row, "encode cancelled, discarding output");
            return Ok(FileOutcome::Cancelled);
        }
        EncodeExit::Finished { code } => code,
    };

    ctx.events.status(row, Status::Finalizing);
    let measured = measure_output(ctx, output.path(), code, &encoded).await?;

    let input = Measurement {
        size_bytes: file.size_bytes,
        duration_secs: duration,
    };
    let validation = match mode {
        EncodeMode::Video { .. } => ValidationMode::Full,
        EncodeMode::AudioOnly => ValidationMode::LengthOnly,
    };
    let result = evaluate(&input, &measured, spec.rate_limit(), validation);
    if let Some(reason) = result.rejection_reason() {
        warn!(row, %reason, output_mb = measured.size_mb(), output_secs = measured.duration_secs, "output rejected");
        return Err(PipelineError::Rejected(reason));
    }
    if code != Some(0) {
        warn!(row, ?code, "encoder exited unsuccessfully but output passed validation");
    }

    ctx.events
        .metric(row, MetricColumn::MbAfter, measured.size_mb());
    ctx.events
        .metric(row, MetricColumn::MbPerMinAfter, measured.rate());

    let replace = spec.replace;
    if replace {
        ctx.events.status(row, Status::Replacing);
    }
    let original = file.path.clone();
    let encoded = output.path().to_path_buf();
    let destination = if replace {
        original.clone()
    } else {
        sibling_output_path(&original)
    };
    let target = destination.clone();
    // Cross-device moves copy the whole file
    let committed = tokio::task::spawn_blocking(move || {
        if replace {
            commit(&original, &encoded)
        } else {
            move_into_place(&encoded, &target)
        }
    })
    .await;
    match committed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            output.retain();
            return Err(PipelineError::Commit(e));
        }
        Err(e) => {
            output.retain();
            return Err(PipelineError::CommitTask(e));
        }
    }
    if !replace {
        info!(row, path = %destination.display(), "kept original, output written alongside");
    }

    Ok(FileOutcome::Completed {
        mb_saved: file.size_mb() - measured.size_mb(),
    })
}

/// Size and fresh duration of an encoder output.
async fn measure_output(
    ctx: &RunContext,
    path: &Path,
    code: Option<i32>,
    encoded: &EncodeOutcome,
) -> Result<Measurement, PipelineError> {
    let describe_code = || {
        code.map(|c| format!("code {}", c))
            .unwrap_or_else(|| "a signal".to_string())
    };

    let size_bytes = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => {
            return Err(PipelineError::NoOutput {
                code: describe_code(),
                detail: encoded
                    .last_diagnostic()
                    .map(|l| format!(": {}", l))
                    .unwrap_or_default(),
            })
        }
    };

    let duration_secs = ctx
        .prober()
        .duration_with_retry(path, &ctx.output_probe_retry)
        .await
        .map_err(PipelineError::OutputProbe)?;

    Ok(Measurement {
        size_bytes,
        duration_secs,
    })
}

/// Where an accepted output goes when originals are kept.
pub fn sibling_output_path(original: &Path) -> PathBuf {
    original.with_file_name(processed_file_name(original))
}
