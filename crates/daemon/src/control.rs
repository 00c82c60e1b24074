//! Control operations behind the HTTP adapter.
//!
//! Each operation validates its input, mutates the store and wakes the
//! engine when there is new work for it.

use crate::classify::SourceKey;
use crate::disc_info::DiscInfo;
use crate::engine::{is_staged, Engine};
use crate::governor::GovernorStatus;
use crate::job_store::{Decision, RipMode, RipRequest, StatusSnapshot, StopOutcome, StoreError};
use crate::jobs::{current_timestamp_ms, EventLevel};
use crate::markers;
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned to control-surface callers.
#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("no active job for {0}")]
    UnknownJob(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("optical drive busy ({0})")]
    GovernorBusy(String),

    #[error("{0}")]
    BadInput(String),
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownJob(key) => ControlError::UnknownJob(key),
            other => ControlError::InvalidState(other.to_string()),
        }
    }
}

/// Disc information returned by `disc_info`.
#[derive(Debug, Clone, Serialize)]
pub struct DiscInfoReply {
    pub present: bool,
    /// Whether a scan ran for this request.
    pub scanned: bool,
    pub info: Option<DiscInfo>,
    pub governor: GovernorStatus,
}

/// Default number of log lines returned by `tail_logs`.
pub const DEFAULT_LOG_LINES: usize = 400;

/// Only this much of the end of the log file is read.
const LOG_TAIL_BYTES: u64 = 512 * 1024;

/// Framework-agnostic control surface.
pub struct Control {
    engine: Arc<Engine>,
}

fn require_source(source: &str) -> Result<&str, ControlError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(ControlError::BadInput("source is required".to_string()));
    }
    Ok(source)
}

impl Control {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn wake(&self) {
        self.engine.waker().notify_one();
    }

    pub fn status(&self) -> StatusSnapshot {
        self.engine.store().snapshot()
    }

    /// Cancel a job, leaving a `.stopped` marker next to file sources.
    ///
    /// With `delete_source` a staged working copy is removed as well; sources
    /// outside the staging roots are never deleted.
    pub fn stop(&self, source: &str, delete_source: bool) -> Result<StopOutcome, ControlError> {
        let source = require_source(source)?;
        let outcome = self.engine.store().stop(source)?;

        if let SourceKey::File(path) = SourceKey::parse(source) {
            if let Err(e) = markers::write_stopped_marker(&path, "canceled by user") {
                log::warn!("Could not write stop marker for {}: {}", path.display(), e);
            }
            if delete_source {
                if is_staged(self.engine.config(), &path) {
                    for victim in [path.clone(), markers::origin_sidecar_path(&path)] {
                        match fs::remove_file(&victim) {
                            Ok(()) => log::info!("Deleted staged {}", victim.display()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => log::warn!("Could not delete {}: {}", victim.display(), e),
                        }
                    }
                } else {
                    log::warn!("Not deleting {}: not a staged copy", path.display());
                }
            }
        }
        Ok(outcome)
    }

    /// Resolve a job waiting in `confirm`. `action` is `proceed` or `cancel`.
    pub fn confirm(&self, source: &str, action: &str) -> Result<(), ControlError> {
        let source = require_source(source)?;
        let decision = match action.trim().to_ascii_lowercase().as_str() {
            "proceed" => Decision::Proceed,
            "cancel" => Decision::Cancel,
            other => {
                return Err(ControlError::BadInput(format!(
                    "unknown action '{}', expected proceed or cancel",
                    other
                )))
            }
        };
        self.engine.store().decide(source, decision)?;
        if decision == Decision::Proceed {
            self.wake();
        }
        Ok(())
    }

    /// Re-queue a finished file source, or request a fresh rip for a disc key.
    pub fn retry(&self, source: &str) -> Result<(), ControlError> {
        let source = require_source(source)?;
        let store = self.engine.store();
        if store.is_active(source) {
            return Err(ControlError::InvalidState(format!("{} is still active", source)));
        }

        let key = SourceKey::parse(source);
        if key.is_physical() {
            let queued = store.request_rip(RipRequest {
                source: source.to_string(),
                mode: RipMode::Manual,
                requested_at: current_timestamp_ms(),
            });
            if !queued {
                return Err(ControlError::InvalidState("a rip is already pending".to_string()));
            }
        } else {
            if let Some(path) = key.as_path() {
                if let Err(e) = markers::remove_stopped_marker(path) {
                    log::warn!("Could not clear stop marker for {}: {}", path.display(), e);
                }
            }
            store.requeue(source)?;
        }
        self.wake();
        Ok(())
    }

    /// Ask for the inserted disc to be ripped. `mode` is `manual` or `auto`.
    ///
    /// Refused while a scan or another rip holds the drive; the refusal is
    /// shown as `blocked` in the status snapshot until the next request.
    pub fn rip(&self, mode: &str) -> Result<RipRequest, ControlError> {
        let mode = match mode.trim().to_ascii_lowercase().as_str() {
            "" | "manual" => RipMode::Manual,
            "auto" => RipMode::Auto,
            other => {
                return Err(ControlError::BadInput(format!(
                    "unknown mode '{}', expected manual or auto",
                    other
                )))
            }
        };

        let store = self.engine.store();
        let governor = store.governor().status();
        if governor.in_flight {
            store.set_disc_blocked(true);
            let holder = governor.holder.unwrap_or_else(|| "scan".to_string());
            store.event(
                EventLevel::Warn,
                format!("Rip request refused; drive held by {}", holder),
            );
            return Err(ControlError::GovernorBusy(holder));
        }

        let index = self.engine.drive().current_index().unwrap_or(0);
        let request = RipRequest {
            source: format!("disc:{}", index),
            mode,
            requested_at: current_timestamp_ms(),
        };
        if store.is_active(&request.source) {
            return Err(ControlError::InvalidState(format!(
                "{} is already being ripped",
                request.source
            )));
        }
        if !store.request_rip(request.clone()) {
            return Err(ControlError::InvalidState("a rip is already pending".to_string()));
        }
        self.wake();
        Ok(request)
    }

    /// Scan the disc if the governor allows it (or `force`), then return the cache.
    pub async fn disc_info(&self, force: bool) -> DiscInfoReply {
        let drive = self.engine.drive();
        let store = self.engine.store();
        let index = drive.current_index().unwrap_or(0);

        let scanned = if force || drive.needs_refresh() {
            match drive.scan(index, force).await {
                Ok(info) => info.is_some(),
                Err(e) => {
                    log::warn!("Disc scan failed: {}", e);
                    false
                }
            }
        } else {
            false
        };

        DiscInfoReply {
            present: store.disc_present(),
            scanned,
            info: store.disc_info(),
            governor: store.governor().status(),
        }
    }

    /// Stop scanning and auto-ripping until resumed.
    pub fn pause_scans(&self) {
        let store = self.engine.store();
        store.governor().pause();
        store.event(EventLevel::Info, "Disc scans paused");
    }

    pub fn resume_scans(&self) {
        let store = self.engine.store();
        store.governor().resume();
        store.event(EventLevel::Info, "Disc scans resumed");
        self.wake();
    }

    /// Last `lines` lines of the daemon log, without HTTP access lines.
    ///
    /// Empty when no log file is configured or it cannot be read. `0`
    /// returns everything in the tail window.
    pub fn tail_logs(&self, lines: usize) -> Vec<String> {
        let Some(path) = &self.engine.config().status.log_file else {
            return Vec::new();
        };
        let mut tail: Vec<String> = match read_tail(path, LOG_TAIL_BYTES) {
            Ok(text) => text
                .lines()
                .filter(|line| !is_access_line(line))
                .map(str::to_string)
                .collect(),
            Err(e) => {
                log::debug!("Cannot read log file {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        if lines > 0 && tail.len() > lines {
            tail.drain(..tail.len() - lines);
        }
        tail
    }
}

fn is_access_line(line: &str) -> bool {
    line.contains("GET /api/") || line.contains("GET / ") || line.contains("GET /favicon.ico")
}

/// The last `max_bytes` of a file, starting at a line boundary.
fn read_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    if start > 0 {
        // First line is partial
        return Ok(text.split_once('\n').map_or(String::new(), |(_, rest)| rest.to_string()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::ScanGovernor;
    use crate::job_store::JobStore;
    use crate::jobs::JobState;
    use crate::probe::FixedProbe;
    use crate::process::testing::{FakeLauncher, FakeScript};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use video_encoder_config::Config;

    fn setup(dir: &TempDir) -> (Control, Arc<JobStore>, Arc<FakeLauncher>) {
        let mut config = Config::default();
        config.paths.output_dir = dir.path().join("out");
        config.paths.rip_dir = dir.path().join("rips");
        config.paths.staging_roots = vec![dir.path().join("staging")];
        config.status.log_file = Some(dir.path().join("daemon.log"));
        let store = Arc::new(JobStore::new(20, 50, Arc::new(ScanGovernor::default())));
        let launcher = Arc::new(FakeLauncher::new());
        let engine = Arc::new(Engine::new(
            config,
            store.clone(),
            launcher.clone(),
            Arc::new(FixedProbe(None)),
        ));
        (Control::new(engine), store, launcher)
    }

    fn staged(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join("staging").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"video").unwrap();
        path
    }

    #[test]
    fn test_stop_unknown_job() {
        let dir = TempDir::new().unwrap();
        let (control, _, _) = setup(&dir);
        assert_eq!(
            control.stop("/nowhere.mkv", false),
            Err(ControlError::UnknownJob("/nowhere.mkv".into()))
        );
        assert!(matches!(control.stop("  ", false), Err(ControlError::BadInput(_))));
    }

    #[test]
    fn test_stop_queued_writes_marker_and_deletes_staged() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        let path = staged(&dir, "movie.mkv");
        let key = path.to_string_lossy().into_owned();
        store.start(&key, None, None, JobState::Queued);

        assert_eq!(control.stop(&key, true), Ok(StopOutcome::Finalized));
        assert!(markers::has_stopped_marker(&path));
        assert!(!path.exists());
        assert_eq!(store.last_finished(&key).unwrap().state, JobState::Canceled);
    }

    #[test]
    fn test_stop_never_deletes_library_files() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        let path = dir.path().join("library/movie.mkv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"video").unwrap();
        let key = path.to_string_lossy().into_owned();
        store.start(&key, None, None, JobState::Queued);

        control.stop(&key, true).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_confirm_validates_action_and_state() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        store.start("/a.mkv", None, None, JobState::Queued);

        assert!(matches!(
            control.confirm("/a.mkv", "maybe"),
            Err(ControlError::BadInput(_))
        ));
        assert!(matches!(
            control.confirm("/a.mkv", "proceed"),
            Err(ControlError::InvalidState(_))
        ));

        store.set_state("/a.mkv", JobState::Confirm).unwrap();
        control.confirm("/a.mkv", "Proceed").unwrap();
        assert_eq!(store.decision("/a.mkv"), Some(Decision::Proceed));
    }

    #[test]
    fn test_retry_file_clears_marker_and_requeues() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        let path = staged(&dir, "movie.mkv");
        let key = path.to_string_lossy().into_owned();
        store.start(&key, None, None, JobState::Queued);
        control.stop(&key, false).unwrap();
        assert!(store.is_settled(&key));

        control.retry(&key).unwrap();
        assert!(!markers::has_stopped_marker(&path));
        assert!(!store.is_settled(&key));
        assert_eq!(store.take_retries(), vec![key]);
    }

    #[test]
    fn test_retry_disc_requests_rip() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        control.retry("disc:0").unwrap();
        let pending = store.pending_rip().unwrap();
        assert_eq!(pending.source, "disc:0");
        assert_eq!(pending.mode, RipMode::Manual);

        assert!(matches!(control.retry("disc:0"), Err(ControlError::InvalidState(_))));
    }

    #[test]
    fn test_rip_refused_while_drive_busy() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        let permit = store.governor().try_acquire("scan").unwrap();

        assert_eq!(
            control.rip("manual"),
            Err(ControlError::GovernorBusy("scan".into()))
        );
        assert!(store.snapshot().disc.blocked);

        drop(permit);
        let request = control.rip("auto").unwrap();
        assert_eq!(request.mode, RipMode::Auto);
        assert!(!store.snapshot().disc.blocked);
        assert!(matches!(control.rip("bogus"), Err(ControlError::BadInput(_))));
    }

    #[tokio::test]
    async fn test_disc_info_scans_and_returns_cache() {
        let dir = TempDir::new().unwrap();
        let (control, _, launcher) = setup(&dir);
        launcher.script(
            "makemkvcon",
            FakeScript::exits(0).with_lines(&[
                r#"DRV:0,2,999,12,"BD-RE DRIVE","MOVIE_DISC","/dev/sr0""#,
                r#"TINFO:0,9,0,"1:30:00""#,
            ]),
        );

        let reply = control.disc_info(true).await;
        assert!(reply.scanned);
        assert!(reply.present);
        assert_eq!(reply.info.unwrap().titles.len(), 1);
        assert!(!reply.governor.in_flight);
    }

    #[test]
    fn test_pause_and_resume_scans() {
        let dir = TempDir::new().unwrap();
        let (control, store, _) = setup(&dir);
        control.pause_scans();
        assert!(store.governor().is_paused());
        assert!(control.status().disc.scan_paused);
        control.resume_scans();
        assert!(!store.governor().is_paused());
    }

    #[test]
    fn test_tail_logs_skips_access_lines_and_keeps_the_end() {
        let dir = TempDir::new().unwrap();
        let (control, _, _) = setup(&dir);
        assert!(control.tail_logs(DEFAULT_LOG_LINES).is_empty());

        let mut log = String::new();
        for i in 0..10 {
            log.push_str(&format!("[INFO] line {}\n", i));
            log.push_str("127.0.0.1 - - \"GET /api/status HTTP/1.1\" 200 -\n");
        }
        log.push_str("\"GET /favicon.ico HTTP/1.1\" 404\n");
        fs::write(dir.path().join("daemon.log"), log).unwrap();

        let lines = control.tail_logs(3);
        assert_eq!(lines, vec!["[INFO] line 7", "[INFO] line 8", "[INFO] line 9"]);
        assert_eq!(control.tail_logs(0).len(), 10);
    }

    #[test]
    fn test_read_tail_drops_partial_first_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.log");
        fs::write(&path, "first line\nsecond\nthird\n").unwrap();

        assert_eq!(read_tail(&path, 10).unwrap(), "third\n");
        assert_eq!(read_tail(&path, 1024).unwrap(), "first line\nsecond\nthird\n");
    }
}
