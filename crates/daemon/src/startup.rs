//! Preflight checks for the external tools the daemon drives.
//!
//! Missing tools are reported, not fatal: a missing ripper only disables disc
//! work, and a missing encoder surfaces as a job error when it is needed.

use crate::encode::RIPPER_PROGRAM;
use crate::job_store::JobStore;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use video_encoder_config::Config;

/// Outcome of looking up every tool.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ToolReport {
    pub found: Vec<(String, PathBuf)>,
    pub missing: Vec<String>,
}

impl ToolReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Tools needed by `config`, in a stable order and without duplicates.
pub fn required_tools(config: &Config) -> Vec<String> {
    let encode = &config.encode;
    let mut seen = BTreeSet::new();
    [RIPPER_PROGRAM, "ffprobe"]
        .iter()
        .map(|p| p.to_string())
        .chain([
            encode.file_profile.program.clone(),
            encode.dvd_profile.program.clone(),
            encode.bluray_profile.program.clone(),
        ])
        .chain(encode.fallback_profile.iter().map(|p| p.program.clone()))
        .filter(|p| !p.trim().is_empty() && seen.insert(p.clone()))
        .collect()
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Resolve `program` the way the shell would: as given when it contains a
/// path separator, else through `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

/// Extract the version from `ffmpeg -version` output.
///
/// Handles plain ("8.0") and git-style ("n8.0-12-gabc") version strings.
pub fn parse_ffmpeg_version(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|l| l.to_lowercase().starts_with("ffmpeg version"))?;
    let token = line.split_whitespace().nth(2)?;
    let version: String = token
        .trim_start_matches('n')
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_end_matches('.');
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

fn ffmpeg_version() -> Option<String> {
    let output = Command::new("ffmpeg").arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout))
}

pub fn check_tools(config: &Config) -> ToolReport {
    let mut report = ToolReport::default();
    for tool in required_tools(config) {
        match find_in_path(&tool) {
            Some(path) => report.found.push((tool, path)),
            None => report.missing.push(tool),
        }
    }
    report
}

/// Look up every tool, log the result and record it as the `tools` subsystem.
pub fn run_startup_checks(config: &Config, store: &JobStore) -> ToolReport {
    let report = check_tools(config);
    for (tool, path) in &report.found {
        log::debug!("Found {} at {}", tool, path.display());
    }
    for tool in &report.missing {
        log::warn!("{} not found; is it installed and in PATH?", tool);
    }
    if report.found.iter().any(|(t, _)| t == "ffprobe") {
        if let Some(version) = ffmpeg_version() {
            log::info!("Using FFmpeg {}", version);
        }
    }

    let detail = if report.is_complete() {
        "all tools found".to_string()
    } else {
        format!("missing: {}", report.missing.join(", "))
    };
    store.set_subsystem("tools", report.is_complete(), detail);
    report
}
