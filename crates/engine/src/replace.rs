//! Committing accepted encodes over their originals.
//!
//! The original is only ever overwritten by a rename, so a failed commit
//! leaves it byte-identical and the encoded file where it was.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while committing an encoded file.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Could not clear the read-only attribute on the original.
    #[error("failed to make {path} writable: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Could not stage a copy of the encoded file next to the destination.
    #[error("failed to copy encoded file: {0}")]
    Copy(std::io::Error),

    /// Could not move the staged file over the destination.
    #[error("failed to replace {path}: {source}")]
    Swap {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Staging path used when the encoded file lives on another filesystem.
///
/// Format: `<destination>.ezff-partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut partial: OsString = destination.as_os_str().to_owned();
    partial.push(".ezff-partial");
    PathBuf::from(partial)
}

/// Make a file writable by its owner if it is read-only.
pub fn clear_readonly(path: &Path) -> Result<(), CommitError> {
    let to_err = |source| CommitError::Permissions {
        path: path.to_path_buf(),
        source,
    };
    let mut perms = fs::metadata(path).map_err(to_err)?.permissions();
    if !perms.readonly() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);

    debug!(path = %path.display(), "clearing read-only attribute");
    fs::set_permissions(path, perms).map_err(to_err)
}

/// Move `encoded` to `destination`, replacing whatever is there.
///
/// Tries a plain rename first. When that fails (typically a cross-device
/// move) the encoded file is copied to a sibling staging file which is then
/// renamed over the destination. On failure the staging file is removed and
/// `encoded` is left untouched.
pub fn move_into_place(encoded: &Path, destination: &Path) -> Result<(), CommitError> {
    if fs::rename(encoded, destination).is_ok() {
        return Ok(());
    }

    let partial = partial_path(destination);
    if let Err(e) = fs::copy(encoded, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(CommitError::Copy(e));
    }

    if let Err(source) = fs::rename(&partial, destination) {
        let _ = fs::remove_file(&partial);
        return Err(CommitError::Swap {
            path: destination.to_path_buf(),
            source,
        });
    }

    // The destination is already replaced; a leftover source is only clutter
    if let Err(e) = fs::remove_file(encoded) {
        warn!(path = %encoded.display(), "failed to remove encoded file after copy: {}", e);
    }
    Ok(())
}

/// Replace `original` with `encoded`.
///
/// # Arguments
///
/// * `original` - Path to the original video file
/// * `encoded` - Path to the validated encoded file
///
/// # Returns
///
/// * `Ok(())` if the original now holds the encoded content
/// * `Err(CommitError)` with both files still present otherwise
pub fn commit(original: &Path, encoded: &Path) -> Result<(), CommitError> {
    clear_readonly(original)?;
    move_into_place(encoded, original)
}
