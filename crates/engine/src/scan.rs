//! Discovery of video files under a library folder.
//!
//! Files are classified by extension and reported one at a time as the walk
//! finds them, so the queue fills incrementally.

use crate::budget::bytes_to_mb;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions treated as video (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".3gp", ".avi", ".flv", ".m2ts", ".m4v", ".mkv", ".mov", ".mp4", ".mpeg", ".mpg", ".ogv",
    ".ts", ".webm", ".wmv",
];

/// Errors that stop discovery before it starts.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("folder does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("not a folder: {0}")]
    NotADirectory(PathBuf),

    #[error("discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A video file found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Size in bytes at discovery time.
    pub size_bytes: u64,
}

impl DiscoveredFile {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes)
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn check_root(root: &Path) -> Result<(), ScanError> {
    if !root.exists() {
        return Err(ScanError::RootNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    Ok(())
}

/// Walk `root` recursively, calling `on_found` for every video file.
///
/// Entries are visited in file-name order within each directory. Directories
/// listed in `exclude` (typically the scratch directory) are not entered
/// unless they are the root itself. Unreadable entries are logged and skipped.
///
/// # Returns
/// The number of files reported.
pub fn discover_videos<F>(root: &Path, exclude: &[PathBuf], mut on_found: F) -> Result<usize, ScanError>
where
    F: FnMut(DiscoveredFile),
{
    check_root(root)?;

    let excluded: Vec<PathBuf> = exclude
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() || excluded.is_empty() {
                return true;
            }
            match entry.path().canonicalize() {
                Ok(dir) if excluded.contains(&dir) => {
                    debug!(path = %entry.path().display(), "skipping scratch directory");
                    false
                }
                _ => true,
            }
        });

    let mut found = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_video_file(entry.path()) {
            continue;
        }

        match entry.metadata() {
            Ok(metadata) => {
                debug!(path = %entry.path().display(), size = metadata.len(), "found video");
                on_found(DiscoveredFile {
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                });
                found += 1;
            }
            Err(e) => warn!(path = %entry.path().display(), "failed to read metadata: {}", e),
        }
    }

    Ok(found)
}

/// Run discovery on a blocking thread, streaming results over a channel.
///
/// The root is checked before the walk starts so a bad folder fails here
/// rather than inside the task.
pub fn spawn_discovery(
    root: &Path,
    exclude: Vec<PathBuf>,
) -> Result<
    (
        mpsc::UnboundedReceiver<DiscoveredFile>,
        JoinHandle<Result<usize, ScanError>>,
    ),
    ScanError,
> {
    check_root(root)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let handle = tokio::task::spawn_blocking(move || {
        discover_videos(&root, &exclude, |file| {
            let _ = tx.send(file);
        })
    });
    Ok((rx, handle))
}
