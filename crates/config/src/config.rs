//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Directories the daemon reads from and writes to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Roots scanned for video files and disc folders
    #[serde(default)]
    pub library_roots: Vec<PathBuf>,
    /// Roots holding staged copies from USB or network shares
    #[serde(default)]
    pub staging_roots: Vec<PathBuf>,
    /// Where encoded output is written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Where disc rips land before encoding
    #[serde(default = "default_rip_dir")]
    pub rip_dir: PathBuf,
    /// Optional final destination; encoded files are moved here on success
    #[serde(default)]
    pub final_dir: Option<PathBuf>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/video-encoder/encoded")
}

fn default_rip_dir() -> PathBuf {
    PathBuf::from("/var/lib/video-encoder/rips")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            library_roots: Vec::new(),
            staging_roots: Vec::new(),
            output_dir: default_output_dir(),
            rip_dir: default_rip_dir(),
            final_dir: None,
        }
    }
}

/// Library scanning settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Seconds between discovery passes
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Extensions treated as video (with leading dot, case-insensitive)
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    /// Files below this size are ignored
    #[serde(default = "default_min_size_mb")]
    pub min_size_mb: u64,
    /// A file must keep the same size for this long before it is queued
    #[serde(default = "default_stable_window_secs")]
    pub stable_window_secs: u64,
}

fn default_rescan_interval_secs() -> u64 {
    30
}

fn default_video_extensions() -> Vec<String> {
    [".mp4", ".mkv", ".avi", ".mov", ".flv", ".wmv", ".m4v"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_size_mb() -> u64 {
    100
}

fn default_stable_window_secs() -> u64 {
    20
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval_secs(),
            video_extensions: default_video_extensions(),
            min_size_mb: default_min_size_mb(),
            stable_window_secs: default_stable_window_secs(),
        }
    }
}

/// One external encoder invocation.
///
/// `args` may contain the placeholders `{input}`, `{output}`, `{audio_langs}`
/// and `{subtitle_langs}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderProfile {
    pub program: String,
    pub args: Vec<String>,
    /// Output container extension without the dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "mp4".to_string()
}

impl EncoderProfile {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            extension: default_extension(),
        }
    }

    /// ffmpeg with the NVENC HEVC encoder, copying audio and subtitles.
    pub fn default_file() -> Self {
        Self::new(
            "ffmpeg",
            &[
                "-hide_banner", "-y", "-i", "{input}", "-map", "0", "-c:v", "hevc_nvenc",
                "-preset", "p5", "-cq", "23", "-c:a", "copy", "-c:s", "copy", "{output}",
            ],
        )
    }

    /// HandBrakeCLI reading a DVD folder.
    pub fn default_dvd() -> Self {
        Self::new(
            "HandBrakeCLI",
            &[
                "-i", "{input}", "-o", "{output}", "--main-feature", "-e", "nvenc_h265",
                "-q", "22", "--audio-lang-list", "{audio_langs}", "--all-audio",
                "--subtitle-lang-list", "{subtitle_langs}", "--all-subtitles",
            ],
        )
    }

    /// HandBrakeCLI reading a ripped Blu-ray title.
    pub fn default_bluray() -> Self {
        Self::new(
            "HandBrakeCLI",
            &[
                "-i", "{input}", "-o", "{output}", "-e", "nvenc_h265", "-q", "22",
                "--audio-lang-list", "{audio_langs}", "--all-audio",
                "--subtitle-lang-list", "{subtitle_langs}", "--all-subtitles",
            ],
        )
    }

    /// Software x265 used when the primary encoder fails.
    pub fn default_fallback() -> Self {
        Self::new(
            "ffmpeg",
            &[
                "-hide_banner", "-y", "-i", "{input}", "-map", "0", "-c:v", "libx265",
                "-preset", "medium", "-crf", "22", "-c:a", "copy", "-c:s", "copy", "{output}",
            ],
        )
    }
}

/// Encoder selection and output handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Sources below this bitrate trigger the low-bitrate policy (None disables it)
    #[serde(default)]
    pub target_bitrate_kbps: Option<u32>,
    #[serde(default = "EncoderProfile::default_file")]
    pub file_profile: EncoderProfile,
    #[serde(default = "EncoderProfile::default_dvd")]
    pub dvd_profile: EncoderProfile,
    #[serde(default = "EncoderProfile::default_bluray")]
    pub bluray_profile: EncoderProfile,
    #[serde(default = "default_fallback_profile")]
    pub fallback_profile: Option<EncoderProfile>,
    /// Delete the original and its sidecar subtitles after a successful encode
    #[serde(default)]
    pub delete_original: bool,
}

fn default_fallback_profile() -> Option<EncoderProfile> {
    Some(EncoderProfile::default_fallback())
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            target_bitrate_kbps: None,
            file_profile: EncoderProfile::default_file(),
            dvd_profile: EncoderProfile::default_dvd(),
            bluray_profile: EncoderProfile::default_bluray(),
            fallback_profile: default_fallback_profile(),
            delete_original: false,
        }
    }
}

/// Unattended decisions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    #[serde(default)]
    pub low_bitrate_auto_proceed: bool,
    /// Takes precedence over `low_bitrate_auto_proceed`
    #[serde(default)]
    pub low_bitrate_auto_skip: bool,
    #[serde(default = "default_langs")]
    pub preferred_audio_langs: Vec<String>,
    #[serde(default = "default_langs")]
    pub preferred_subtitle_langs: Vec<String>,
}

fn default_langs() -> Vec<String> {
    vec!["eng".to_string()]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            low_bitrate_auto_proceed: false,
            low_bitrate_auto_skip: false,
            preferred_audio_langs: default_langs(),
            preferred_subtitle_langs: default_langs(),
        }
    }
}

/// Optical drive handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscConfig {
    /// Rip the longest titles of an inserted disc without asking
    #[serde(default)]
    pub auto_rip: bool,
    #[serde(default = "default_auto_rip_count")]
    pub auto_rip_count: usize,
    /// Titles shorter than this are never auto-ripped
    #[serde(default = "default_min_title_secs")]
    pub min_title_secs: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Minimum spacing between successful disc scans
    #[serde(default = "default_min_scan_interval_secs")]
    pub min_scan_interval_secs: u64,
    /// Populated disc info older than this is refreshed on the next permitted scan
    #[serde(default = "default_info_max_age_secs")]
    pub info_max_age_secs: u64,
    /// How long a killed process gets to exit before the job is finalized anyway
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_auto_rip_count() -> usize {
    2
}

fn default_min_title_secs() -> u64 {
    1200
}

fn default_scan_timeout_secs() -> u64 {
    60
}

fn default_min_scan_interval_secs() -> u64 {
    10
}

fn default_info_max_age_secs() -> u64 {
    600
}

fn default_cancel_grace_secs() -> u64 {
    10
}

impl Default for DiscConfig {
    fn default() -> Self {
        Self {
            auto_rip: false,
            auto_rip_count: default_auto_rip_count(),
            min_title_secs: default_min_title_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            min_scan_interval_secs: default_min_scan_interval_secs(),
            info_max_age_secs: default_info_max_age_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Status tracking and the control surface listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// File the daemon log is written to; served by the log tail endpoint.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_history_size() -> usize {
    100
}

fn default_event_capacity() -> usize {
    200
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5959
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            event_capacity: default_event_capacity(),
            bind: default_bind(),
            port: default_port(),
            log_file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub disc: DiscConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Parse a boolean the way environment overrides spell them.
fn parse_env_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODER_OUTPUT_DIR -> paths.output_dir
    /// - ENCODER_RIP_DIR -> paths.rip_dir
    /// - ENCODER_FINAL_DIR -> paths.final_dir
    /// - ENCODER_TARGET_BITRATE_KBPS -> encode.target_bitrate_kbps
    /// - ENCODER_AUTO_RIP -> disc.auto_rip
    /// - ENCODER_LOW_BITRATE_AUTO_PROCEED -> policy.low_bitrate_auto_proceed
    /// - ENCODER_LOW_BITRATE_AUTO_SKIP -> policy.low_bitrate_auto_skip
    /// - ENCODER_RESCAN_INTERVAL_SECS -> scan.rescan_interval_secs
    /// - ENCODER_WEB_PORT -> status.port
    /// - ENCODER_LOG_FILE -> status.log_file
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCODER_OUTPUT_DIR") {
            if !val.trim().is_empty() {
                self.paths.output_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODER_RIP_DIR") {
            if !val.trim().is_empty() {
                self.paths.rip_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENCODER_FINAL_DIR") {
            // Empty string clears the final move
            self.paths.final_dir = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = env::var("ENCODER_TARGET_BITRATE_KBPS") {
            if let Ok(kbps) = val.trim().parse::<u32>() {
                self.encode.target_bitrate_kbps = Some(kbps);
            }
        }

        if let Ok(val) = env::var("ENCODER_AUTO_RIP") {
            if let Some(b) = parse_env_bool(&val) {
                self.disc.auto_rip = b;
            }
        }

        if let Ok(val) = env::var("ENCODER_LOW_BITRATE_AUTO_PROCEED") {
            if let Some(b) = parse_env_bool(&val) {
                self.policy.low_bitrate_auto_proceed = b;
            }
        }

        if let Ok(val) = env::var("ENCODER_LOW_BITRATE_AUTO_SKIP") {
            if let Some(b) = parse_env_bool(&val) {
                self.policy.low_bitrate_auto_skip = b;
            }
        }

        if let Ok(val) = env::var("ENCODER_RESCAN_INTERVAL_SECS") {
            if let Ok(secs) = val.trim().parse::<u64>() {
                self.scan.rescan_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("ENCODER_WEB_PORT") {
            if let Ok(port) = val.trim().parse::<u16>() {
                self.status.port = port;
            }
        }

        if let Ok(val) = env::var("ENCODER_LOG_FILE") {
            self.status.log_file = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.rescan_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scan.rescan_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.status.history_size == 0 {
            return Err(ConfigError::Invalid(
                "status.history_size must be greater than zero".to_string(),
            ));
        }
        if self.status.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "status.event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.disc.scan_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "disc.scan_timeout_secs must be greater than zero".to_string(),
            ));
        }

        let mut profiles = vec![
            ("encode.file_profile", &self.encode.file_profile),
            ("encode.dvd_profile", &self.encode.dvd_profile),
            ("encode.bluray_profile", &self.encode.bluray_profile),
        ];
        if let Some(fallback) = &self.encode.fallback_profile {
            profiles.push(("encode.fallback_profile", fallback));
        }
        for (name, profile) in profiles {
            validate_profile(name, profile)?;
        }

        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn validate_profile(name: &str, profile: &EncoderProfile) -> Result<(), ConfigError> {
    if profile.program.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{}.program is empty", name)));
    }
    for placeholder in ["{input}", "{output}"] {
        if !profile.args.iter().any(|a| a.contains(placeholder)) {
            return Err(ConfigError::Invalid(format!(
                "{}.args must contain {}",
                name, placeholder
            )));
        }
    }
    Ok(())
}
