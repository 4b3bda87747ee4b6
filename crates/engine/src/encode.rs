//! Encoder invocation for a single file.
//!
//! Builds the encoder command from the processing toggles, runs it while
//! draining its diagnostic stream on a separate task, and reports progress
//! and speed parsed from the stats lines.

use crate::event::StopFlag;
use crate::scratch::scratch_path;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Suffix inserted before the extension of encoded outputs.
pub const PROCESSED_SUFFIX: &str = "_processed";

/// Number of diagnostic lines kept for error reporting.
pub const TAIL_LINES: usize = 5;

/// How long to wait on the diagnostic stream before re-checking the stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder could not be launched
    #[error("failed to start encoder: {0}")]
    Spawn(#[source] std::io::Error),

    /// The encoder's diagnostic stream was not captured
    #[error("encoder diagnostic stream unavailable")]
    NoDiagnostics,

    /// Waiting on the encoder failed
    #[error("failed waiting on encoder: {0}")]
    Wait(#[from] std::io::Error),
}

/// What the encoder does to the streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeMode {
    /// Re-encode video at the given bitrate (bits per second).
    Video { bitrate_bps: f64 },
    /// Copy video, re-encode audio through the enabled filters.
    AudioOnly,
}

/// Parameters for one encoder invocation
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub input: PathBuf,
    pub output: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    pub mode: EncodeMode,
    pub normalize: bool,
    pub stereo: bool,
}

/// Build the encoder command.
///
/// Video, audio and any subtitle streams are mapped to the output; subtitles
/// are copied. Audio is always re-encoded at 192k. The output path is the
/// final argument.
pub fn build_encode_command(program: &Path, params: &EncodeParams) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);

    cmd.arg("-y").arg("-i").arg(&params.input);
    cmd.args(["-map", "0:v", "-map", "0:a", "-map", "0:s?"]);

    match params.mode {
        EncodeMode::Video { bitrate_bps } => {
            let rate = format!("{}k", (bitrate_bps / 1000.0) as u64);
            let bufsize = format!("{}k", (bitrate_bps / 500.0) as u64);
            cmd.arg("-c:v").arg(&params.video_codec);
            cmd.arg("-b:v").arg(&rate);
            cmd.arg("-maxrate").arg(&rate);
            cmd.arg("-bufsize").arg(bufsize);
        }
        EncodeMode::AudioOnly => {
            cmd.args(["-c:v", "copy"]);
        }
    }

    cmd.arg("-c:a").arg(&params.audio_codec);
    cmd.args(["-b:a", "192k", "-c:s", "copy"]);

    if params.normalize {
        cmd.args(["-af", "dynaudnorm"]);
    }
    if params.stereo {
        cmd.args(["-ac", "2"]);
    }

    cmd.arg(&params.output);
    cmd
}

/// `<stem>_processed.<ext>` for the given file.
pub fn processed_file_name(path: &Path) -> OsString {
    let mut name = path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(PROCESSED_SUFFIX);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    name
}

/// Where the encoder writes its output for `input` inside the scratch directory.
///
/// The name carries a tag of the full input path, so an output kept after a
/// failed replace is never reused by another file with the same name.
pub fn output_path_for(input: &Path, scratch_dir: &Path) -> PathBuf {
    scratch_path(input, scratch_dir, PROCESSED_SUFFIX)
}

/// Splits a byte stream into lines on both `\r` and `\n`.
///
/// The encoder rewrites its stats line with carriage returns, so a plain
/// newline reader would only see progress once the encode finished.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feed bytes, returning every completed non-empty line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Flush a final unterminated line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}

/// Values extracted from one diagnostic line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub elapsed_secs: Option<f64>,
    pub speed: Option<String>,
}

/// Extract `time=` and `speed=` from a stats line.
///
/// Malformed or negative timestamps yield no elapsed value.
pub fn parse_progress_line(line: &str) -> ProgressSample {
    ProgressSample {
        elapsed_secs: field_value(line, "time=").and_then(parse_timestamp),
        speed: field_value(line, "speed=")
            .filter(|s| *s != "N/A")
            .map(str::to_string),
    }
}

fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    line[start..].trim_start().split_whitespace().next()
}

/// Parse `HH:MM:SS(.ff)` into seconds.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    if raw.starts_with('-') {
        return None;
    }
    let mut parts = raw.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}

/// Progress reported while an encode runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeProgress {
    /// Percent of the input duration encoded so far, clamped to 0..=100.
    pub percent: Option<f64>,
    pub speed: Option<String>,
}

/// How the encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeExit {
    /// Exited on its own; `code` is `None` when killed by a signal.
    Finished { code: Option<i32> },
    /// Terminated because a stop was requested.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutcome {
    pub exit: EncodeExit,
    /// Last few non-empty diagnostic lines, oldest first.
    pub tail: Vec<String>,
}

impl EncodeOutcome {
    /// Most recent diagnostic line, if any.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.tail.last().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct DiagnosticTail {
    lines: VecDeque<String>,
}

impl DiagnosticTail {
    fn push(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(trimmed.to_string());
    }

    fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

async fn read_diagnostics(mut stderr: ChildStderr, tx: mpsc::UnboundedSender<String>) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("diagnostic stream read failed: {}", e);
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line);
    }
}

fn handle_line<F>(line: &str, total_secs: f64, tail: &mut DiagnosticTail, on_progress: &mut F)
where
    F: FnMut(EncodeProgress),
{
    debug!(target: "ez_ffmpeg::encoder", "{}", line);
    tail.push(line);

    let sample = parse_progress_line(line);
    if sample.elapsed_secs.is_none() && sample.speed.is_none() {
        return;
    }
    let percent = sample
        .elapsed_secs
        .filter(|_| total_secs > 0.0)
        .map(|elapsed| (elapsed / total_secs * 100.0).clamp(0.0, 100.0));
    on_progress(EncodeProgress {
        percent,
        speed: sample.speed,
    });
}

/// Run the encoder to completion or until a stop is requested.
///
/// The diagnostic stream is drained on its own task so a full pipe can never
/// stall the encoder. Between lines, and at least every [`POLL_INTERVAL`], the
/// stop flag is checked; when set the encoder is killed and
/// [`EncodeExit::Cancelled`] returned.
///
/// # Arguments
/// * `command` - Encoder invocation from [`build_encode_command`]
/// * `total_secs` - Input duration used to turn timestamps into percentages
/// * `stop` - Shared cancellation flag
/// * `on_progress` - Called for every line carrying a timestamp or speed
pub async fn run_encode<F>(
    command: std::process::Command,
    total_secs: f64,
    stop: &StopFlag,
    mut on_progress: F,
) -> Result<EncodeOutcome, EncodeError>
where
    F: FnMut(EncodeProgress) + Send,
{
    let mut cmd = Command::from(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
    let stderr = child.stderr.take().ok_or(EncodeError::NoDiagnostics)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut reader = tokio::spawn(read_diagnostics(stderr, tx));
    let mut tail = DiagnosticTail::default();

    let exit = loop {
        if stop.is_set() {
            info!("stop requested, terminating encoder");
            if let Err(e) = child.kill().await {
                warn!("failed to kill encoder: {}", e);
            }
            reader.abort();
            break EncodeExit::Cancelled;
        }

        match timeout(POLL_INTERVAL, rx.recv()).await {
            Ok(Some(line)) => handle_line(&line, total_secs, &mut tail, &mut on_progress),
            Ok(None) => {
                let status = child.wait().await?;
                break EncodeExit::Finished {
                    code: status.code(),
                };
            }
            Err(_) => {
                // A descendant may still hold the pipe after the encoder exits
                if let Some(status) = child.try_wait()? {
                    let _ = timeout(POLL_INTERVAL, &mut reader).await;
                    reader.abort();
                    while let Ok(line) = rx.try_recv() {
                        handle_line(&line, total_secs, &mut tail, &mut on_progress);
                    }
                    break EncodeExit::Finished {
                        code: status.code(),
                    };
                }
            }
        }
    };

    Ok(EncodeOutcome {
        exit,
        tail: tail.into_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    fn params(mode: EncodeMode, normalize: bool, stereo: bool) -> EncodeParams {
        EncodeParams {
            input: PathBuf::from("/media/show/episode 01.mkv"),
            output: PathBuf::from("/tmp/ez_ffmpeg/episode 01_processed.mkv"),
            video_codec: "libx265".to_string(),
            audio_codec: "libmp3lame".to_string(),
            mode,
            normalize,
            stereo,
        }
    }

    #[test]
    fn test_video_command_uses_budget_bitrate() {
        let cmd = build_encode_command(
            Path::new("ffmpeg"),
            &params(EncodeMode::Video { bitrate_bps: 1_313_341.44 }, true, true),
        );
        let args = args_of(&cmd);

        assert_eq!(cmd.get_program(), "ffmpeg");
        assert_eq!(value_after(&args, "-i").as_deref(), Some("/media/show/episode 01.mkv"));
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("libx265"));
        assert_eq!(value_after(&args, "-b:v").as_deref(), Some("1313k"));
        assert_eq!(value_after(&args, "-maxrate").as_deref(), Some("1313k"));
        assert_eq!(value_after(&args, "-bufsize").as_deref(), Some("2626k"));
        assert_eq!(value_after(&args, "-c:a").as_deref(), Some("libmp3lame"));
        assert_eq!(value_after(&args, "-b:a").as_deref(), Some("192k"));
        assert_eq!(value_after(&args, "-c:s").as_deref(), Some("copy"));
        assert_eq!(value_after(&args, "-af").as_deref(), Some("dynaudnorm"));
        assert_eq!(value_after(&args, "-ac").as_deref(), Some("2"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/tmp/ez_ffmpeg/episode 01_processed.mkv")
        );
    }

    #[test]
    fn test_command_maps_all_stream_kinds() {
        let cmd = build_encode_command(
            Path::new("ffmpeg"),
            &params(EncodeMode::Video { bitrate_bps: 500_000.0 }, false, false),
        );
        let args = args_of(&cmd);
        let maps: Vec<&str> = args
            .windows(2)
            .filter(|w| w[0] == "-map")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(maps, vec!["0:v", "0:a", "0:s?"]);
    }

    #[test]
    fn test_filters_only_when_enabled() {
        let cmd = build_encode_command(
            Path::new("ffmpeg"),
            &params(EncodeMode::Video { bitrate_bps: 500_000.0 }, false, false),
        );
        let args = args_of(&cmd);
        assert!(!args.contains(&"-af".to_string()));
        assert!(!args.contains(&"-ac".to_string()));

        let cmd = build_encode_command(
            Path::new("ffmpeg"),
            &params(EncodeMode::Video { bitrate_bps: 500_000.0 }, false, true),
        );
        let args = args_of(&cmd);
        assert!(!args.contains(&"-af".to_string()));
        assert_eq!(value_after(&args, "-ac").as_deref(), Some("2"));
    }

    #[test]
    fn test_audio_only_copies_video() {
        let cmd = build_encode_command(
            Path::new("ffmpeg"),
            &params(EncodeMode::AudioOnly, true, false),
        );
        let args = args_of(&cmd);
        assert_eq!(value_after(&args, "-c:v").as_deref(), Some("copy"));
        assert!(!args.contains(&"-b:v".to_string()));
        assert!(!args.contains(&"-maxrate".to_string()));
        assert_eq!(value_after(&args, "-af").as_deref(), Some("dynaudnorm"));
    }

    #[test]
    fn test_output_path_naming() {
        let film = Path::new("/media/movies/film.mkv");
        let output = output_path_for(film, Path::new("/tmp/ez_ffmpeg"));
        assert_eq!(output.parent(), Some(Path::new("/tmp/ez_ffmpeg")));
        assert_eq!(
            output.file_name().unwrap().to_string_lossy(),
            format!("film.{}_processed.mkv", crate::scratch::source_tag(film))
        );

        // Same file name in another season folder gets its own scratch entry
        let s1 = output_path_for(Path::new("/media/S1/ep.mkv"), Path::new("/scratch"));
        let s2 = output_path_for(Path::new("/media/S2/ep.mkv"), Path::new("/scratch"));
        assert_ne!(s1, s2);

        assert_eq!(
            processed_file_name(Path::new("/media/film.2024.mp4")),
            OsString::from("film.2024_processed.mp4")
        );
        assert_eq!(
            processed_file_name(Path::new("/media/noext")),
            OsString::from("noext_processed")
        );
    }

    #[test]
    fn test_line_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"frame=1 time=00:00:01.00\rframe=2 time=00:00:02.00\r\nDone\n");
        assert_eq!(
            lines,
            vec!["frame=1 time=00:00:01.00", "frame=2 time=00:00:02.00", "Done"]
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_line_splitter_joins_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"speed=1.").is_empty());
        assert_eq!(splitter.push(b"5x\rtail"), vec!["speed=1.5x"]);
        assert_eq!(splitter.finish(), Some("tail".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_parse_stats_line() {
        let sample = parse_progress_line(
            "frame= 1234 fps= 50 q=28.0 size=   10240kB time=00:01:02.50 bitrate=1342.2kbits/s speed=2.05x",
        );
        assert_eq!(sample.elapsed_secs, Some(62.5));
        assert_eq!(sample.speed.as_deref(), Some("2.05x"));
    }

    #[test]
    fn test_parse_padded_values() {
        let sample = parse_progress_line("time= 01:00:00.00 speed= 0.98x");
        assert_eq!(sample.elapsed_secs, Some(3600.0));
        assert_eq!(sample.speed.as_deref(), Some("0.98x"));
    }

    #[test]
    fn test_malformed_timestamps_are_ignored() {
        assert_eq!(parse_progress_line("time=N/A speed=N/A"), ProgressSample::default());
        assert_eq!(parse_progress_line("time=-00:00:00.02").elapsed_secs, None);
        assert_eq!(parse_progress_line("time=12:34").elapsed_secs, None);
        assert_eq!(parse_progress_line("time=1:2:3:4").elapsed_secs, None);
        assert_eq!(parse_progress_line("Input #0, matroska,webm").elapsed_secs, None);
        assert_eq!(parse_progress_line("time=").elapsed_secs, None);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let mut tail = DiagnosticTail::default();
        for i in 0..8 {
            tail.push(&format!("line {}", i));
            tail.push("   ");
        }
        assert_eq!(
            tail.into_vec(),
            vec!["line 3", "line 4", "line 5", "line 6", "line 7"]
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::test_support::{FakeEncode, FakeTools};
        use std::sync::{Arc, Mutex};
        use tempfile::TempDir;

        fn fake_params(dir: &Path) -> EncodeParams {
            let input = dir.join("input.mkv");
            std::fs::write(&input, b"").unwrap();
            EncodeParams {
                input,
                output: dir.join("input_processed.mkv"),
                video_codec: "libx265".to_string(),
                audio_codec: "libmp3lame".to_string(),
                mode: EncodeMode::Video { bitrate_bps: 1_000_000.0 },
                normalize: true,
                stereo: true,
            }
        }

        #[tokio::test]
        async fn test_encode_reports_progress_and_exit() {
            let temp_dir = TempDir::new().unwrap();
            let tools = FakeTools::install(temp_dir.path());
            let params = fake_params(temp_dir.path());

            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            let outcome = run_encode(
                build_encode_command(&tools.ffmpeg, &params),
                180.0,
                &StopFlag::new(),
                move |p| sink.lock().unwrap().push(p),
            )
            .await
            .unwrap();

            assert_eq!(outcome.exit, EncodeExit::Finished { code: Some(0) });
            assert_eq!(outcome.last_diagnostic(), Some("video:1024kB audio:256kB muxing overhead: 0.1%"));
            assert!(params.output.exists());
            assert_eq!(tools.encoder_calls(), 1);

            let seen = seen.lock().unwrap();
            let percents: Vec<f64> = seen.iter().filter_map(|p| p.percent).collect();
            assert_eq!(percents, vec![25.0, 50.0]);
            assert_eq!(seen[0].speed.as_deref(), Some("1.50x"));
            assert_eq!(seen[1].speed.as_deref(), Some("1.60x"));
        }

        #[tokio::test]
        async fn test_encode_surfaces_nonzero_exit() {
            let temp_dir = TempDir::new().unwrap();
            let tools = FakeTools::with_encoder(
                temp_dir.path(),
                FakeEncode {
                    exit_code: 3,
                    ..FakeEncode::default()
                },
            );
            let params = fake_params(temp_dir.path());

            let outcome = run_encode(
                build_encode_command(&tools.ffmpeg, &params),
                180.0,
                &StopFlag::new(),
                |_| {},
            )
            .await
            .unwrap();

            assert_eq!(outcome.exit, EncodeExit::Finished { code: Some(3) });
            assert!(!outcome.tail.is_empty());
        }

        #[tokio::test]
        async fn test_stop_kills_running_encoder() {
            let temp_dir = TempDir::new().unwrap();
            let tools = FakeTools::with_encoder(
                temp_dir.path(),
                FakeEncode {
                    hang: true,
                    ..FakeEncode::default()
                },
            );
            let params = fake_params(temp_dir.path());
            let stop = StopFlag::new();
            let trigger = stop.clone();

            let outcome = tokio::time::timeout(
                Duration::from_secs(10),
                run_encode(
                    build_encode_command(&tools.ffmpeg, &params),
                    180.0,
                    &stop,
                    move |_| trigger.request(),
                ),
            )
            .await
            .expect("encoder should be killed well before it finishes")
            .unwrap();

            assert_eq!(outcome.exit, EncodeExit::Cancelled);
            assert!(!params.output.exists());
        }

        #[tokio::test]
        async fn test_missing_encoder_is_spawn_error() {
            let temp_dir = TempDir::new().unwrap();
            let params = fake_params(temp_dir.path());
            let result = run_encode(
                build_encode_command(Path::new("/nonexistent/ffmpeg"), &params),
                180.0,
                &StopFlag::new(),
                |_| {},
            )
            .await;
            assert!(matches!(result, Err(EncodeError::Spawn(_))));
        }
    }
}
