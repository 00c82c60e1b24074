//! Source keys, media kinds and destination naming.
//!
//! A source key is the only identity a job has: a filesystem path, or
//! `disc:<index>` / `dev:<node>` for a physical disc. The media kind decides
//! which encoder profile applies and whether a rip has to happen first.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parsed form of a source key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKey {
    File(PathBuf),
    /// `disc:<index>`
    Disc(u32),
    /// `dev:<node>`, e.g. `dev:/dev/sr0`
    Device(String),
}

impl SourceKey {
    /// Anything that is not a well-formed disc or device key is a path.
    pub fn parse(key: &str) -> Self {
        if let Some(rest) = key.strip_prefix("disc:") {
            if let Ok(index) = rest.trim().parse::<u32>() {
                return SourceKey::Disc(index);
            }
        }
        if let Some(rest) = key.strip_prefix("dev:") {
            let node = rest.trim();
            if !node.is_empty() {
                return SourceKey::Device(node.to_string());
            }
        }
        SourceKey::File(PathBuf::from(key))
    }

    pub fn is_physical(&self) -> bool {
        !matches!(self, SourceKey::File(_))
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SourceKey::File(p) => Some(p),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKey::File(p) => write!(f, "{}", p.display()),
            SourceKey::Disc(i) => write!(f, "disc:{}", i),
            SourceKey::Device(node) => write!(f, "dev:{}", node),
        }
    }
}

/// What kind of media a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// A single video file.
    #[default]
    File,
    /// A mounted DVD (`VIDEO_TS`).
    DvdFolder,
    /// A mounted Blu-ray (`BDMV`); encoded from a rip of the physical disc.
    BlurayFolder,
    /// A physical disc addressed by index or device node.
    Disc,
}

impl MediaKind {
    /// Whether the source has to be ripped before it can be encoded.
    pub fn needs_rip(&self) -> bool {
        matches!(self, MediaKind::BlurayFolder | MediaKind::Disc)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::File => write!(f, "file"),
            MediaKind::DvdFolder => write!(f, "dvd"),
            MediaKind::BlurayFolder => write!(f, "bluray"),
            MediaKind::Disc => write!(f, "disc"),
        }
    }
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_str().map_or(false, |s| s.eq_ignore_ascii_case(name)))
}

/// Classify a source by its key.
///
/// Folder kinds are recognised by a `BDMV` or `VIDEO_TS` path component, so a
/// file merely named after its source ("Film.BluRay.mkv") stays a file.
pub fn media_kind(key: &SourceKey) -> MediaKind {
    let path = match key {
        SourceKey::File(path) => path,
        _ => return MediaKind::Disc,
    };
    if has_component(path, "BDMV") {
        MediaKind::BlurayFolder
    } else if has_component(path, "VIDEO_TS") {
        MediaKind::DvdFolder
    } else {
        MediaKind::File
    }
}

/// Directory that holds the given disc structure marker (`VIDEO_TS`, `BDMV`).
fn mount_name(path: &Path, marker: &str) -> Option<String> {
    let ancestor = path.ancestors().find(|a| {
        a.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.eq_ignore_ascii_case(marker))
    })?;
    ancestor
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

/// Replace characters that do not belong in a file name and collapse runs.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = true;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '.').to_string();
    if trimmed.is_empty() {
        "disc".to_string()
    } else {
        trimmed
    }
}

/// Output file stem for a source, without extension.
///
/// DVD and Blu-ray folders are named after their mount directory, plain
/// files after their stem. Physical-disc keys have no name of their own; use
/// `rip_name` once the disc label is known.
pub fn destination_name(key: &SourceKey) -> String {
    match (key, media_kind(key)) {
        (SourceKey::File(path), MediaKind::DvdFolder) => mount_name(path, "VIDEO_TS"),
        (SourceKey::File(path), MediaKind::BlurayFolder) => mount_name(path, "BDMV"),
        (SourceKey::File(path), _) => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned()),
        _ => None,
    }
    .map(|n| sanitize_name(&n))
    .unwrap_or_else(|| sanitize_name(&key.to_string()))
}

/// Name for a ripped title: sanitized disc label plus title number.
pub fn rip_name(label: Option<&str>, title: Option<u32>) -> String {
    let base = sanitize_name(label.unwrap_or(""));
    match title {
        Some(t) => format!("{}_t{:02}", base, t),
        None => base,
    }
}
