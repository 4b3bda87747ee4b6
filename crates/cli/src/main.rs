//! CLI entry point for ez-ffmpeg
//!
//! Loads settings, queues every video under the library folder and runs the
//! queue. Ctrl-C cancels the run, killing any encode in progress.

mod logging;
mod render;

use clap::Parser;
use ez_ffmpeg::{
    new_shared_snapshot, run_status_server, Events, Preset, ProcessingSpec, RunMode, RunOutcome,
    Session, Settings, SharedSnapshot, DEFAULT_STATUS_ADDR,
};
use render::Renderer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

/// EZ ffmpeg - shrink a video library to a per-minute storage budget
#[derive(Parser, Debug)]
#[command(name = "ez-ffmpeg")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Library folder to scan (defaults to the last folder used)
    folder: Option<PathBuf>,

    /// Path to the settings file
    #[arg(short, long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Only measure files, never encode
    #[arg(long)]
    estimate: bool,

    /// Apply a preset (movies, television, animation)
    #[arg(long)]
    preset: Option<Preset>,

    /// Target rate in MB per minute
    #[arg(short, long)]
    target: Option<u32>,

    /// Tolerance above the target before a file is re-encoded
    #[arg(long)]
    threshold: Option<String>,

    /// Re-encode video streams
    #[arg(long)]
    convert: Option<bool>,

    /// Normalize audio loudness
    #[arg(long)]
    normalize: Option<bool>,

    /// Downmix audio to stereo
    #[arg(long)]
    stereo: Option<bool>,

    /// Replace originals with accepted outputs
    #[arg(long)]
    replace: Option<bool>,

    /// Diagnostic log file (defaults to ez_ffmpeg.log in the cache directory)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Serve the run snapshot as JSON on 127.0.0.1:7879/status
    #[arg(long)]
    serve: bool,
}

impl Args {
    /// Fold command line overrides into the loaded settings.
    fn apply_to(&self, settings: &mut Settings) {
        if let Some(preset) = self.preset {
            settings.apply_preset(preset);
        }
        if let Some(target) = self.target {
            settings.target_rate = target;
        }
        if let Some(threshold) = &self.threshold {
            settings.threshold = threshold.clone();
        }
        let toggles = [
            (self.convert, &mut settings.options.convert),
            (self.normalize, &mut settings.options.normalize),
            (self.stereo, &mut settings.options.stereo),
            (self.replace, &mut settings.options.replace),
        ];
        for (flag, slot) in toggles {
            if let Some(flag) = flag {
                *slot = flag;
            }
        }
        if let Some(folder) = &self.folder {
            settings.last_folder = Some(folder.clone());
        }
    }
}

/// Print events as they arrive until the session drops its sender.
async fn print_events(mut rx: UnboundedReceiver<ez_ffmpeg::RunEvent>, snapshot: SharedSnapshot) {
    let mut renderer = Renderer::new();
    while let Some(event) = rx.recv().await {
        let line = {
            let mut snapshot = snapshot.write().await;
            renderer.render(&mut snapshot, &event)
        };
        if let Some(line) = line {
            println!("{}", line);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (mut settings, load_error) = Settings::load_or_default(&args.settings);
    args.apply_to(&mut settings);

    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(|| settings.cache.resolved_dir().join(logging::LOG_FILE_NAME));
    if let Err(e) = logging::init(&log_file) {
        eprintln!("Failed to open log file {}: {}", log_file.display(), e);
        return ExitCode::FAILURE;
    }
    if let Some(e) = load_error {
        warn!(path = %args.settings.display(), "using default settings: {}", e);
    }

    let spec = match ProcessingSpec::from_settings(&settings) {
        Ok(spec) => spec,
        Err(e) => {
            error!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let Some(folder) = settings.last_folder.clone() else {
        error!("No folder given and no previous folder in {}", args.settings.display());
        return ExitCode::FAILURE;
    };

    info!(
        folder = %folder.display(),
        target = spec.target_rate,
        threshold = spec.threshold,
        log = %log_file.display(),
        "ez-ffmpeg starting"
    );

    let snapshot = new_shared_snapshot();
    if args.serve {
        let snapshot = snapshot.clone();
        let addr = SocketAddr::from(DEFAULT_STATUS_ADDR);
        tokio::spawn(async move {
            if let Err(e) = run_status_server(snapshot, addr).await {
                error!("Status server error: {}", e);
            }
        });
    }

    let (events, rx) = Events::channel();
    let mut session = Session::new(settings.tools.clone(), &settings.cache, events);
    let printer = tokio::spawn(print_events(rx, snapshot));

    if let Err(e) = session.load_folder(&folder).await {
        error!("Failed to load {}: {}", folder.display(), e);
        return ExitCode::FAILURE;
    }

    let mode = if args.estimate {
        RunMode::Estimate
    } else {
        RunMode::Process
    };
    if let Err(e) = session.start(spec, mode) {
        error!("Failed to start run: {}", e);
        return ExitCode::FAILURE;
    }

    let stop = session.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            stop.request();
        }
    });

    let report = session.wait().await;
    drop(session);
    let _ = printer.await;

    if let Err(e) = settings.save(&args.settings) {
        warn!(path = %args.settings.display(), "failed to save settings: {}", e);
    }

    match report {
        Ok(Some(report)) if report.outcome == RunOutcome::Completed && report.summary.failed == 0 => {
            ExitCode::SUCCESS
        }
        Ok(Some(report)) if report.outcome == RunOutcome::Cancelled => ExitCode::from(130),
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
