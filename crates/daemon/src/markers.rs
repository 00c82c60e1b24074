//! Sidecar marker files.
//!
//! `<source>.stopped` records that the user stopped a job and it should not
//! be picked up again until retried. `<origin>.encoded` records that a staged
//! copy of `<origin>` was encoded; the staged copy names its origin in a
//! `<staged>.origin` sidecar.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// `<path><suffix>`, keeping the original extension.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut marker = path.as_os_str().to_owned();
    marker.push(suffix);
    PathBuf::from(marker)
}

pub fn stopped_marker_path(source: &Path) -> PathBuf {
    sibling_path(source, ".stopped")
}

pub fn encoded_marker_path(origin: &Path) -> PathBuf {
    sibling_path(origin, ".encoded")
}

pub fn origin_sidecar_path(staged: &Path) -> PathBuf {
    sibling_path(staged, ".origin")
}

pub fn has_stopped_marker(source: &Path) -> bool {
    stopped_marker_path(source).exists()
}

pub fn has_encoded_marker(origin: &Path) -> bool {
    encoded_marker_path(origin).exists()
}

/// Write `<source>.stopped` containing the reason.
pub fn write_stopped_marker(source: &Path, reason: &str) -> io::Result<()> {
    let mut file = fs::File::create(stopped_marker_path(source))?;
    writeln!(file, "{}", reason)?;
    Ok(())
}

/// Remove `<source>.stopped`; a missing marker is not an error.
pub fn remove_stopped_marker(source: &Path) -> io::Result<()> {
    match fs::remove_file(stopped_marker_path(source)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Origin recorded beside a staged copy, if any.
pub fn read_origin(staged: &Path) -> Option<PathBuf> {
    let content = fs::read_to_string(origin_sidecar_path(staged)).ok()?;
    let line = content.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(PathBuf::from(line))
    }
}

/// Mark the origin of a staged copy as encoded.
///
/// Returns the origin that was marked, or None when `staged` has no origin
/// sidecar.
pub fn mark_origin_encoded(staged: &Path) -> io::Result<Option<PathBuf>> {
    let Some(origin) = read_origin(staged) else {
        return Ok(None);
    };
    fs::File::create(encoded_marker_path(&origin))?;
    Ok(Some(origin))
}
