//! Shell stand-ins for the prober and encoder used by pipeline tests.
//!
//! The fake prober answers with the contents of `<file>.duration`. The fake
//! encoder prints two stats lines, writes a sparse output of the requested
//! size plus its `.duration` sidecar, and exits with the requested code.

use ez_ffmpeg_config::ToolsConfig;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Behaviour of the fake encoder.
#[derive(Debug, Clone)]
pub struct FakeEncode {
    /// Size of the output file; `None` writes nothing.
    pub output_bytes: Option<u64>,
    /// Duration reported for the output by the fake prober.
    pub output_duration: f64,
    pub exit_code: i32,
    /// Block after the first stats line until killed.
    pub hang: bool,
}

impl Default for FakeEncode {
    fn default() -> Self {
        Self {
            output_bytes: Some(1024 * 1024),
            output_duration: 180.0,
            exit_code: 0,
            hang: false,
        }
    }
}

pub struct FakeTools {
    pub ffprobe: PathBuf,
    pub ffmpeg: PathBuf,
    calls: PathBuf,
}

impl FakeTools {
    pub fn install(dir: &Path) -> Self {
        Self::with_encoder(dir, FakeEncode::default())
    }

    pub fn with_encoder(dir: &Path, encode: FakeEncode) -> Self {
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let calls = bin.join("ffmpeg.calls");

        let ffprobe = bin.join("ffprobe");
        write_script(
            &ffprobe,
            r#"#!/bin/sh
for last; do :; done
if [ -f "$last.duration" ]; then
  cat "$last.duration"
  exit 0
fi
echo "$last: No such file or directory" >&2
exit 1
"#,
        );

        let output = match encode.output_bytes {
            Some(bytes) => format!(
                "dd if=/dev/null of=\"$last\" bs=1 seek={} 2>/dev/null\necho '{}' > \"$last.duration\"\n",
                bytes, encode.output_duration
            ),
            None => String::new(),
        };
        let hang = if encode.hang { "exec sleep 30\n" } else { "" };
        let ffmpeg = bin.join("ffmpeg");
        write_script(
            &ffmpeg,
            &format!(
                "#!/bin/sh\n\
for last; do :; done\n\
echo \"$*\" >> '{calls}'\n\
printf 'frame=   48 fps=0.0 q=28.0 size=       0kB time=00:00:45.00 bitrate=   0.0kbits/s speed=1.50x\\r' >&2\n\
{hang}\
printf 'frame=   96 fps= 40 q=28.0 size=     256kB time=00:01:30.00 bitrate= 349.5kbits/s speed=1.60x\\n' >&2\n\
{output}\
printf 'video:1024kB audio:256kB muxing overhead: 0.1%%\\n' >&2\n\
exit {code}\n",
                calls = calls.display(),
                hang = hang,
                output = output,
                code = encode.exit_code,
            ),
        );

        Self {
            ffprobe,
            ffmpeg,
            calls,
        }
    }

    /// Number of times the fake encoder has been invoked.
    pub fn encoder_calls(&self) -> usize {
        fs::read_to_string(&self.calls)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn tools_config(&self) -> ToolsConfig {
        ToolsConfig {
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            ..ToolsConfig::default()
        }
    }
}

/// A prober that fails its first `failures` invocations, then answers normally.
pub fn flaky_prober(dir: &Path, failures: u32) -> PathBuf {
    let count = dir.join("flaky.count");
    let path = dir.join("flaky-ffprobe");
    write_script(
        &path,
        &format!(
            "#!/bin/sh\n\
for last; do :; done\n\
n=$(cat '{count}' 2>/dev/null || echo 0)\n\
n=$((n + 1))\n\
echo \"$n\" > '{count}'\n\
if [ \"$n\" -le {failures} ]; then\n\
  echo 'moov atom not found' >&2\n\
  exit 1\n\
fi\n\
cat \"$last.duration\"\n",
            count = count.display(),
            failures = failures,
        ),
    );
    path
}

/// Record the duration the fake prober reports for `path`.
pub fn write_duration(path: &Path, secs: f64) {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".duration");
    fs::write(PathBuf::from(sidecar), format!("{:.6}\n", secs)).unwrap();
}

/// Create a sparse file of the given size.
pub fn sparse_file(path: &Path, bytes: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    File::create(path).unwrap().set_len(bytes).unwrap();
}

/// Create a sparse video with a known duration.
pub fn fake_video(path: &Path, megabytes: u64, duration_secs: f64) {
    sparse_file(path, megabytes * 1024 * 1024);
    write_duration(path, duration_secs);
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
