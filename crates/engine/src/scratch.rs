//! Scratch directory files with guaranteed cleanup.
//!
//! Both guards remove their file when dropped, so every exit path of a
//! per-file job (success, rejection, error, cancellation, panic) releases the
//! scratch space.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stable 16-hex-digit tag for a source path.
///
/// Scratch files carry it so two sources with the same file name in
/// different folders never share a scratch entry.
pub fn source_tag(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// `<stem>.<tag><suffix>.<ext>` inside `scratch_dir`.
pub fn scratch_path(source: &Path, scratch_dir: &Path, suffix: &str) -> PathBuf {
    let mut name = source
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(source_tag(source));
    name.push(suffix);
    if let Some(ext) = source.extension() {
        name.push(".");
        name.push(ext);
    }
    scratch_dir.join(name)
}

/// Whether `path` lives inside `dir`, after resolving links and `..`.
pub async fn is_within(path: &Path, dir: &Path) -> bool {
    match (
        tokio::fs::canonicalize(path).await,
        tokio::fs::canonicalize(dir).await,
    ) {
        (Ok(path), Ok(dir)) => path.starts_with(dir),
        _ => false,
    }
}

/// An encoder output in the scratch directory.
///
/// Deleted on drop unless [`ScratchOutput::retain`] was called or the file
/// has been moved away.
#[derive(Debug)]
pub struct ScratchOutput {
    path: PathBuf,
    retained: bool,
}

impl ScratchOutput {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            retained: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk after the guard is dropped.
    pub fn retain(&mut self) {
        self.retained = true;
    }
}

impl Drop for ScratchOutput {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed scratch output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove scratch output: {}", e),
        }
    }
}

/// A copy of a source file placed in the scratch directory.
///
/// Keyed by the source's full path; an existing copy with the same length is
/// reused instead of copied again. A source already inside the scratch
/// directory is used in place and never removed.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    owned: bool,
}

impl WorkingCopy {
    pub async fn acquire(source: &Path, scratch_dir: &Path) -> io::Result<Self> {
        if source.file_name().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source has no file name",
            ));
        }
        if is_within(source, scratch_dir).await {
            debug!(path = %source.display(), "source already in scratch directory, using it in place");
            return Ok(Self {
                path: source.to_path_buf(),
                owned: false,
            });
        }

        let path = scratch_path(source, scratch_dir, "");
        let source_len = tokio::fs::metadata(source).await?.len();

        let reusable = matches!(
            tokio::fs::metadata(&path).await,
            Ok(existing) if existing.len() == source_len
        );
        // Guard first so a failed copy does not leave a partial file behind
        let copy = Self { path, owned: true };
        if reusable {
            debug!(path = %copy.path.display(), "reusing cached working copy");
        } else {
            tokio::fs::copy(source, &copy.path).await?;
        }
        Ok(copy)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed working copy"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove working copy: {}", e),
        }
    }
}
