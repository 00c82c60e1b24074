//! Job model for the orchestration loop.
//!
//! A job is keyed by a stable source identifier: a filesystem path for
//! file-backed work, or `disc:<index>` / `dev:<devnode>` for a physical disc.
//! State is a closed enum whose transitions only move forward; `confirm`
//! is the one branch point and may resolve to either `running` or `canceled`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Discovered and waiting for its turn.
    Queued,
    /// Policy gates are being evaluated.
    Starting,
    /// Parked until an external proceed/cancel decision arrives.
    Confirm,
    /// Physical disc is being ripped to an intermediate file.
    Ripping,
    /// Transcoder is running.
    Running,
    Success,
    Error,
    Canceled,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobState {
    /// Stable lowercase name used on the wire and in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Confirm => "confirm",
            JobState::Ripping => "ripping",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Error => "error",
            JobState::Canceled => "canceled",
        }
    }

    /// Check if the state is final (success, error, or canceled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Error | JobState::Canceled
        )
    }

    /// States during which an external process is attached to the job.
    pub fn has_process(&self) -> bool {
        matches!(self, JobState::Ripping | JobState::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Starting => 1,
            JobState::Confirm => 2,
            JobState::Ripping => 3,
            JobState::Running => 4,
            JobState::Success | JobState::Error | JobState::Canceled => 5,
        }
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Transitions are strictly forward. Re-entering the current state is
    /// allowed so repeated calls stay harmless; terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown job state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "starting" => Ok(JobState::Starting),
            "confirm" => Ok(JobState::Confirm),
            "ripping" => Ok(JobState::Ripping),
            "running" => Ok(JobState::Running),
            "success" => Ok(JobState::Success),
            "error" => Ok(JobState::Error),
            "canceled" => Ok(JobState::Canceled),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// One unit of discovered work.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    /// Source key (path, `disc:<n>` or `dev:<node>`).
    pub source: String,
    /// Identifier of this particular run of the source (UUID).
    pub run_id: String,
    /// Where the output is expected to land.
    pub destination: Option<PathBuf>,
    pub state: JobState,
    /// Unix timestamp (milliseconds) when the job was registered.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Percent complete of the current phase, 0..=100.
    pub progress: f32,
    /// Remaining seconds, explicit or extrapolated.
    pub eta_secs: Option<u64>,
    pub message: String,
    pub info: Option<String>,
    /// Final file name to use instead of the derived one.
    pub rename_to: Option<String>,
    pub canceled: bool,
    #[serde(skip)]
    pub(crate) phase_started_at: i64,
    #[serde(skip)]
    pub(crate) eta_explicit: bool,
}

impl Job {
    pub fn new(
        source: &str,
        run_id: String,
        destination: Option<PathBuf>,
        info: Option<String>,
        state: JobState,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            source: source.to_string(),
            run_id,
            destination,
            state,
            created_at: now,
            started_at: None,
            finished_at: None,
            progress: 0.0,
            eta_secs: None,
            message: String::new(),
            info,
            rename_to: None,
            canceled: false,
            phase_started_at: now,
            eta_explicit: false,
        }
    }

    /// Seconds since the job was registered (or until it finished).
    pub fn duration_secs(&self, now_ms: i64) -> u64 {
        let end = self.finished_at.unwrap_or(now_ms);
        ((end - self.created_at).max(0) / 1000) as u64
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Severity of an event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLevel::Info => write!(f, "info"),
            EventLevel::Warn => write!(f, "warn"),
            EventLevel::Error => write!(f, "error"),
        }
    }
}

/// Human-readable audit trail entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub ts: i64,
    pub level: EventLevel,
    pub message: String,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
