//! Post-encode file moves and original cleanup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subtitle files that travel with a video of the same stem.
pub const SIDECAR_EXTENSIONS: &[&str] = &["srt", "sub", "idx", "ass", "ssa"];

#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy {from} to {to}: {source}")]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to finish move to {to}: {source}")]
    RenameFailed {
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete {path}: {source}")]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Move `src` to `dst`.
///
/// Tries a rename first. Across filesystems it copies to `<dst>.part`,
/// renames that into place and then removes `src`, so `dst` never exists
/// half-written. A failed copy leaves `src` untouched.
pub fn safe_move(src: &Path, dst: &Path) -> Result<(), RelocateError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| RelocateError::CreateDir {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let partial = crate::markers::sibling_path(dst, ".part");
    if let Err(e) = fs::copy(src, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(RelocateError::CopyFailed {
            from: src.to_path_buf(),
            to: partial,
            source: e,
        });
    }
    if let Err(e) = fs::rename(&partial, dst) {
        let _ = fs::remove_file(&partial);
        return Err(RelocateError::RenameFailed {
            to: dst.to_path_buf(),
            source: e,
        });
    }
    fs::remove_file(src).map_err(|e| RelocateError::DeleteFailed {
        path: src.to_path_buf(),
        source: e,
    })
}

/// Existing subtitle sidecars for `video` (`movie.mkv` -> `movie.srt`, ...).
pub fn sidecar_files(video: &Path) -> Vec<PathBuf> {
    SIDECAR_EXTENSIONS
        .iter()
        .map(|ext| video.with_extension(ext))
        .filter(|p| p.is_file())
        .collect()
}

/// Delete `video` and its subtitle sidecars.
///
/// Sidecar removal is best effort; only failing to delete the video itself
/// is reported.
pub fn delete_with_sidecars(video: &Path) -> Result<Vec<PathBuf>, RelocateError> {
    fs::remove_file(video).map_err(|e| RelocateError::DeleteFailed {
        path: video.to_path_buf(),
        source: e,
    })?;
    let mut removed = vec![video.to_path_buf()];
    for sidecar in sidecar_files(video) {
        match fs::remove_file(&sidecar) {
            Ok(()) => removed.push(sidecar),
            Err(e) => log::debug!("Could not remove {}: {}", sidecar.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_move_same_filesystem() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.mp4");
        let dst = dir.path().join("final").join("a.mp4");
        fs::write(&src, b"encoded").unwrap();

        safe_move(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"encoded");
        assert!(!crate::markers::sibling_path(&dst, ".part").exists());
    }

    #[test]
    fn test_safe_move_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("missing.mp4");
        let dst = dir.path().join("out.mp4");
        let err = safe_move(&src, &dst).unwrap_err();
        assert!(matches!(err, RelocateError::CopyFailed { .. }));
        assert!(!dst.exists());
    }

    #[test]
    fn test_delete_with_sidecars() {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("movie.mkv");
        for name in ["movie.mkv", "movie.srt", "movie.idx", "other.srt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = delete_with_sidecars(&video).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(!video.exists());
        assert!(!dir.path().join("movie.srt").exists());
        assert!(!dir.path().join("movie.idx").exists());
        assert!(dir.path().join("other.srt").exists());
    }

    #[test]
    fn test_delete_missing_video_reports_error() {
        let dir = TempDir::new().unwrap();
        let err = delete_with_sidecars(&dir.path().join("gone.mkv")).unwrap_err();
        assert!(matches!(err, RelocateError::DeleteFailed { .. }));
    }
}
