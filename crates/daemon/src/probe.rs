//! Source bitrate probing.
//!
//! The lifecycle engine only needs one number from a source: its bitrate in
//! kbps. `FfprobeProbe` gets it from ffprobe's JSON output, preferring the
//! container bit rate and falling back to the first video stream.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Video stream summary from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: Option<u32>,
}

/// Parsed ffprobe result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub duration_secs: f64,
    pub size_bytes: u64,
    /// Overall container bit rate.
    pub bitrate_kbps: Option<u32>,
}

impl ProbeResult {
    /// Container bit rate, else the first video stream's.
    pub fn effective_bitrate_kbps(&self) -> Option<u32> {
        self.bitrate_kbps
            .or_else(|| self.video_streams.iter().find_map(|v| v.bitrate_kbps))
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

fn bps_to_kbps(raw: Option<&String>) -> Option<u32> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|bps| *bps > 0.0)
        .map(|bps| (bps / 1000.0).round() as u32)
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("missing format information in ffprobe output".to_string())
    })?;

    let video_streams = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| VideoStream {
            codec_name: s.codec_name.unwrap_or_default(),
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            bitrate_kbps: bps_to_kbps(s.bit_rate.as_ref()),
        })
        .collect();

    Ok(ProbeResult {
        video_streams,
        duration_secs: format
            .duration
            .as_ref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0),
        size_bytes: format
            .size
            .as_ref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0),
        bitrate_kbps: bps_to_kbps(format.bit_rate.as_ref()),
    })
}

/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
pub fn probe_file(path: &Path) -> Result<ProbeResult, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Bitrate source used by the low-bitrate gate.
pub trait BitrateProbe: Send + Sync {
    /// Ok(None) when the source has no measurable bitrate.
    fn bitrate_kbps(&self, path: &Path) -> Result<Option<u32>, ProbeError>;
}

#[derive(Debug, Default, Clone)]
pub struct FfprobeProbe;

impl BitrateProbe for FfprobeProbe {
    fn bitrate_kbps(&self, path: &Path) -> Result<Option<u32>, ProbeError> {
        Ok(probe_file(path)?.effective_bitrate_kbps())
    }
}

/// Probe that reports the same value for every path.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe(pub Option<u32>);

impl BitrateProbe for FixedProbe {
    fn bitrate_kbps(&self, _path: &Path) -> Result<Option<u32>, ProbeError> {
        Ok(self.0)
    }
}
