//! Tracing setup: console output plus an append-only diagnostic log file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the console filter directives.
pub const LOG_ENV_VAR: &str = "EZ_FFMPEG_LOG";

/// File name of the diagnostic log inside the cache directory.
pub const LOG_FILE_NAME: &str = "ez_ffmpeg.log";

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber.
///
/// The console honours `EZ_FFMPEG_LOG` (default `info`). The log file always
/// records at `debug`, which includes encoder command lines and every raw
/// diagnostic line.
pub fn init(log_file: &Path) -> io::Result<()> {
    let file = open_log_file(log_file)?;

    let console = fmt::layer().with_target(false).with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(LOG_ENV_VAR)
            .from_env_lossy(),
    );
    let diagnostics = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(diagnostics)
        .try_init()
        .map_err(io::Error::other)
}
