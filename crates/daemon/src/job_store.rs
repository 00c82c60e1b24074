//! Shared registry of jobs, history, events and disc state.
//!
//! Every component reads and writes through one `JobStore`. All state sits
//! behind a single mutex so `snapshot()` never observes a half-updated job.

use crate::disc_info::{DiscInfo, DriveInfo};
use crate::governor::{GovernorStatus, ScanGovernor};
use crate::jobs::{current_timestamp_ms, Event, EventLevel, Job, JobState};
use crate::title_select::AutoRipQueue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use video_encoder_config::StatusConfig;

/// Identical completions closer together than this are recorded once.
const COMPLETION_DEDUP_WINDOW_MS: i64 = 5_000;

/// Errors from store mutations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("no active job for {0}")]
    UnknownJob(String),

    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: JobState,
        to: JobState,
    },

    #[error("job {key} is {state}, expected {expected}")]
    WrongState {
        key: String,
        state: JobState,
        expected: JobState,
    },

    #[error("job {0} is still active")]
    StillActive(String),
}

/// Resolution of a low-bitrate confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Proceed,
    Cancel,
}

/// How a disc rip was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RipMode {
    /// Rip every title above the minimum length.
    Manual,
    /// Rip the selector's titles one at a time.
    Auto,
}

/// A pending request to rip the inserted disc.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RipRequest {
    /// `disc:<n>` or `dev:<node>`
    pub source: String,
    pub mode: RipMode,
    pub requested_at: i64,
}

/// Handle returned by `start`.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub run_id: String,
    pub token: CancellationToken,
    /// False when an existing job was re-armed.
    pub created: bool,
}

/// What `stop` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No process was attached; the job is already in history.
    Finalized,
    /// The process was signalled; the supervisor finalizes once it exits.
    Signalled,
}

/// Health of a storage collaborator (USB staging, network share).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubsystemStatus {
    pub available: bool,
    pub detail: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    #[serde(flatten)]
    pub job: Job,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscStatus {
    pub info: Option<DiscInfo>,
    pub present: bool,
    pub drives: Vec<DriveInfo>,
    pub rip_pending: Option<RipRequest>,
    /// A rip request was refused because the drive was busy.
    pub blocked: bool,
    pub scan_paused: bool,
    pub auto_rip: Vec<AutoRipQueue>,
}

/// Everything the control surface shows, as of one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp_ms: i64,
    pub active: Vec<ActiveJob>,
    /// Finished jobs, newest first.
    pub recent: Vec<Job>,
    /// Event log, newest first.
    pub events: Vec<Event>,
    pub disc: DiscStatus,
    pub governor: GovernorStatus,
    pub subsystems: BTreeMap<String, SubsystemStatus>,
}

struct ActiveEntry {
    job: Job,
    token: CancellationToken,
    /// Current step and step count of the phase, for scaling progress.
    step: (usize, usize),
}

#[derive(Default)]
struct DiscState {
    info: Option<DiscInfo>,
    present: bool,
    drives: Vec<DriveInfo>,
    rip_request: Option<RipRequest>,
    blocked: bool,
    auto_rip: HashMap<String, AutoRipQueue>,
}

#[derive(Default)]
struct StoreInner {
    active: HashMap<String, ActiveEntry>,
    history: VecDeque<Job>,
    events: VecDeque<Event>,
    disc: DiscState,
    decisions: HashMap<String, Decision>,
    /// Keys that reached a terminal state; not re-queued until retried.
    settled: HashSet<String>,
    retries: VecDeque<String>,
    subsystems: BTreeMap<String, SubsystemStatus>,
}

/// Concurrency-safe job registry.
pub struct JobStore {
    inner: Mutex<StoreInner>,
    history_size: usize,
    event_capacity: usize,
    governor: Arc<ScanGovernor>,
}

impl JobStore {
    pub fn new(history_size: usize, event_capacity: usize, governor: Arc<ScanGovernor>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            history_size: history_size.max(1),
            event_capacity: event_capacity.max(1),
            governor,
        }
    }

    pub fn from_config(config: &StatusConfig, governor: Arc<ScanGovernor>) -> Self {
        Self::new(config.history_size, config.event_capacity, governor)
    }

    pub fn governor(&self) -> &Arc<ScanGovernor> {
        &self.governor
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_event(&self, inner: &mut StoreInner, level: EventLevel, message: String) {
        inner.events.push_back(Event {
            ts: current_timestamp_ms(),
            level,
            message,
        });
        while inner.events.len() > self.event_capacity {
            inner.events.pop_front();
        }
    }

    /// Append an event to the audit trail.
    pub fn event(&self, level: EventLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        self.push_event(&mut inner, level, message.into());
    }

    /// Register a job, or re-arm the existing one for `key`.
    ///
    /// A second call while the job is live keeps its state, timestamps and
    /// cancellation token and only refreshes the destination and info.
    pub fn start(
        &self,
        key: &str,
        destination: Option<PathBuf>,
        info: Option<String>,
        state: JobState,
    ) -> JobTicket {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.get_mut(key) {
            if destination.is_some() {
                entry.job.destination = destination;
            }
            if info.is_some() {
                entry.job.info = info;
            }
            return JobTicket {
                run_id: entry.job.run_id.clone(),
                token: entry.token.clone(),
                created: false,
            };
        }

        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let job = Job::new(key, run_id.clone(), destination, info, state);
        inner.active.insert(
            key.to_string(),
            ActiveEntry {
                job,
                token: token.clone(),
                step: (0, 1),
            },
        );
        self.push_event(&mut inner, EventLevel::Info, format!("Queued {}", key));
        JobTicket {
            run_id,
            token,
            created: true,
        }
    }

    /// Move a live job to a non-terminal state.
    ///
    /// Terminal states are reached through `complete`, `cancel_complete` or `stop`.
    pub fn set_state(&self, key: &str, state: JobState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .active
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
        let from = entry.job.state;
        if state.is_terminal() || !from.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                key: key.to_string(),
                from,
                to: state,
            });
        }
        if from == state {
            return Ok(());
        }

        let now = current_timestamp_ms();
        entry.step = (0, 1);
        let job = &mut entry.job;
        job.state = state;
        if job.started_at.is_none() && state != JobState::Queued {
            job.started_at = Some(now);
        }
        if state.has_process() {
            job.progress = 0.0;
            job.eta_secs = None;
            job.eta_explicit = false;
            job.phase_started_at = now;
        }
        log::debug!("{}: {} -> {}", key, from, state);
        Ok(())
    }

    pub fn set_message(&self, key: &str, message: impl Into<String>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .active
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
        entry.job.message = message.into();
        Ok(())
    }

    pub fn set_destination(&self, key: &str, destination: PathBuf) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .active
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
        entry.job.destination = Some(destination);
        Ok(())
    }

    pub fn set_rename(&self, key: &str, name: impl Into<String>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .active
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
        entry.job.rename_to = Some(name.into());
        Ok(())
    }

    /// Record percent complete for the current step of the phase.
    ///
    /// The value is clamped to 0..=100, scaled into the step's share of the
    /// phase (see `begin_step`) and never decreases while a process is
    /// attached. Unless an explicit ETA was reported, the ETA is extrapolated
    /// linearly as `elapsed * (100 - pct) / pct`.
    pub fn update_progress(&self, key: &str, pct: f32) {
        self.update_progress_at(key, pct, current_timestamp_ms());
    }

    pub(crate) fn update_progress_at(&self, key: &str, pct: f32, now_ms: i64) {
        if !pct.is_finite() {
            return;
        }
        let mut inner = self.lock();
        let Some(entry) = inner.active.get_mut(key) else {
            return;
        };
        let (step, steps) = entry.step;
        let job = &mut entry.job;
        if job.state.is_terminal() {
            return;
        }
        let pct = ((step as f32 * 100.0 + pct.clamp(0.0, 100.0)) / steps as f32).clamp(0.0, 100.0);
        job.progress = if job.state.has_process() {
            job.progress.max(pct)
        } else {
            pct
        };
        if !job.eta_explicit && job.progress > 0.0 {
            let elapsed_ms = (now_ms - job.phase_started_at).max(0) as f64;
            let p = job.progress as f64;
            job.eta_secs = Some((elapsed_ms * (100.0 - p) / p / 1000.0).round() as u64);
        }
    }

    /// Move to step `step` (0-based) of `steps` within the current phase.
    ///
    /// Later reports cover only that step's share of the phase, so a job that
    /// rips or encodes several titles keeps a rising overall progress.
    pub fn begin_step(&self, key: &str, step: usize, steps: usize) {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.get_mut(key) {
            let steps = steps.max(1);
            entry.step = (step.min(steps - 1), steps);
            entry.job.eta_secs = None;
            entry.job.eta_explicit = false;
        }
    }

    /// Drop the ETA when a step is restarted (fallback encoder).
    ///
    /// Progress is kept; the restarted step only moves it once it passes the
    /// value already reached.
    pub fn clear_eta(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.get_mut(key) {
            entry.job.eta_secs = None;
            entry.job.eta_explicit = false;
        }
    }

    /// Explicit ETA reported by the tool; wins over extrapolation.
    pub fn update_eta(&self, key: &str, secs: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.get_mut(key) {
            entry.job.eta_secs = Some(secs);
            entry.job.eta_explicit = true;
        }
    }

    /// Finish a job as success or error and move it into history.
    ///
    /// Returns false when the record was dropped as an immediate duplicate.
    pub fn complete(
        &self,
        key: &str,
        success: bool,
        destination: Option<PathBuf>,
        message: impl Into<String>,
    ) -> bool {
        let state = if success {
            JobState::Success
        } else {
            JobState::Error
        };
        self.finalize(key, state, destination, message.into())
    }

    /// Finish a job as canceled, keeping the progress it had reached.
    pub fn cancel_complete(&self, key: &str, message: impl Into<String>) -> bool {
        self.finalize(key, JobState::Canceled, None, message.into())
    }

    fn finalize(
        &self,
        key: &str,
        state: JobState,
        destination: Option<PathBuf>,
        message: String,
    ) -> bool {
        let now = current_timestamp_ms();
        let mut inner = self.lock();

        let job = match inner.active.remove(key) {
            Some(entry) => {
                let mut job = entry.job;
                job.state = state;
                job.finished_at = Some(now);
                job.message = message.clone();
                if destination.is_some() {
                    job.destination = destination;
                }
                if state == JobState::Canceled {
                    job.canceled = true;
                }
                job.eta_secs = None;
                job
            }
            None => {
                let duplicate = inner.history.front().map_or(false, |last| {
                    last.source == key
                        && last.state == state
                        && last.message == message
                        && now - last.finished_at.unwrap_or(0) < COMPLETION_DEDUP_WINDOW_MS
                });
                if duplicate {
                    log::debug!("Dropping repeated completion for {}", key);
                    return false;
                }
                let mut job = Job::new(key, Uuid::new_v4().to_string(), destination, None, state);
                job.finished_at = Some(now);
                job.message = message.clone();
                job.canceled = state == JobState::Canceled;
                job
            }
        };

        inner.history.push_front(job);
        inner.history.truncate(self.history_size);
        inner.settled.insert(key.to_string());
        inner.decisions.remove(key);

        let level = match state {
            JobState::Error => EventLevel::Error,
            JobState::Canceled => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        let text = if message.is_empty() {
            format!("{} {}", key, state)
        } else {
            format!("{} {}: {}", key, state, message)
        };
        log::info!("{}", text);
        self.push_event(&mut inner, level, text);
        true
    }

    /// Cancel a job.
    ///
    /// Jobs with no process attached (queued, or parked in confirm) are
    /// finalized immediately. Otherwise the cancellation token fires and the
    /// supervising task records `canceled` once the process has exited.
    pub fn stop(&self, key: &str) -> Result<StopOutcome, StoreError> {
        let state = {
            let mut inner = self.lock();
            let entry = inner
                .active
                .get_mut(key)
                .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
            entry.job.canceled = true;
            entry.token.cancel();
            let state = entry.job.state;
            self.push_event(&mut inner, EventLevel::Warn, format!("Stop requested for {}", key));
            state
        };

        if matches!(state, JobState::Queued | JobState::Confirm) {
            self.cancel_complete(key, "canceled by user");
            Ok(StopOutcome::Finalized)
        } else {
            Ok(StopOutcome::Signalled)
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().active.contains_key(key)
    }

    pub fn job(&self, key: &str) -> Option<Job> {
        self.lock().active.get(key).map(|e| e.job.clone())
    }

    pub fn token(&self, key: &str) -> Option<CancellationToken> {
        self.lock().active.get(key).map(|e| e.token.clone())
    }

    /// Most recent history entry for `key`.
    pub fn last_finished(&self, key: &str) -> Option<Job> {
        self.lock()
            .history
            .iter()
            .find(|j| j.source == key)
            .cloned()
    }

    /// Resolve a job parked in `confirm`.
    pub fn decide(&self, key: &str, decision: Decision) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let entry = inner
                .active
                .get(key)
                .ok_or_else(|| StoreError::UnknownJob(key.to_string()))?;
            if entry.job.state != JobState::Confirm {
                return Err(StoreError::WrongState {
                    key: key.to_string(),
                    state: entry.job.state,
                    expected: JobState::Confirm,
                });
            }
            if decision == Decision::Proceed {
                inner.decisions.insert(key.to_string(), Decision::Proceed);
                if let Some(entry) = inner.active.get_mut(key) {
                    entry.job.message = "proceed confirmed".to_string();
                }
                self.push_event(&mut inner, EventLevel::Info, format!("Confirmed {}", key));
                return Ok(());
            }
        }
        self.cancel_complete(key, "declined at confirmation");
        Ok(())
    }

    /// Jobs parked in `confirm` that have since been told to proceed, oldest first.
    pub fn confirmed_keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut parked: Vec<&Job> = inner
            .active
            .values()
            .map(|e| &e.job)
            .filter(|j| {
                j.state == JobState::Confirm
                    && inner.decisions.get(&j.source) == Some(&Decision::Proceed)
            })
            .collect();
        parked.sort_by_key(|j| j.created_at);
        parked.into_iter().map(|j| j.source.clone()).collect()
    }

    /// Record a decision without requiring the job to be parked.
    pub fn set_decision(&self, key: &str, decision: Decision) {
        self.lock().decisions.insert(key.to_string(), decision);
    }

    pub fn decision(&self, key: &str) -> Option<Decision> {
        self.lock().decisions.get(key).copied()
    }

    /// Whether `key` reached a terminal state and has not been retried.
    pub fn is_settled(&self, key: &str) -> bool {
        self.lock().settled.contains(key)
    }

    /// Re-queue a terminal source as brand new.
    pub fn requeue(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.active.contains_key(key) {
            return Err(StoreError::StillActive(key.to_string()));
        }
        inner.settled.remove(key);
        inner.decisions.remove(key);
        if !inner.retries.iter().any(|k| k == key) {
            inner.retries.push_back(key.to_string());
        }
        self.push_event(&mut inner, EventLevel::Info, format!("Retry requested for {}", key));
        Ok(())
    }

    /// Drain retry requests in the order they arrived.
    pub fn take_retries(&self) -> Vec<String> {
        self.lock().retries.drain(..).collect()
    }

    /// Queue a disc rip. Returns false if one is already pending.
    pub fn request_rip(&self, request: RipRequest) -> bool {
        let mut inner = self.lock();
        if inner.disc.rip_request.is_some() {
            return false;
        }
        inner.disc.blocked = false;
        let text = format!("Rip requested for {} ({:?})", request.source, request.mode);
        inner.disc.rip_request = Some(request);
        self.push_event(&mut inner, EventLevel::Info, text);
        true
    }

    pub fn pending_rip(&self) -> Option<RipRequest> {
        self.lock().disc.rip_request.clone()
    }

    pub fn take_rip_request(&self) -> Option<RipRequest> {
        self.lock().disc.rip_request.take()
    }

    pub fn set_disc_blocked(&self, blocked: bool) {
        self.lock().disc.blocked = blocked;
    }

    /// Store a scan result, refusing to replace titles with an empty scan.
    ///
    /// Returns false when the incoming result was discarded. Removing the
    /// disc clears the cache first (see `set_disc_present`), so the guard
    /// only protects against a bad scan of a disc that is still inserted.
    pub fn update_disc_info(&self, info: DiscInfo) -> bool {
        let mut inner = self.lock();
        if let Some(current) = &inner.disc.info {
            if current.has_titles() && !info.has_titles() {
                log::warn!(
                    "Ignoring empty disc scan for {}; keeping {} cached titles",
                    info.source,
                    current.titles.len()
                );
                return false;
            }
        }
        inner.disc.present = true;
        inner.disc.info = Some(info);
        true
    }

    pub fn disc_info(&self) -> Option<DiscInfo> {
        self.lock().disc.info.clone()
    }

    /// Record drive presence; a transition to absent clears the cache.
    pub fn set_disc_present(&self, present: bool, drives: Vec<DriveInfo>) {
        let mut inner = self.lock();
        let was_present = inner.disc.present;
        inner.disc.present = present;
        inner.disc.drives = drives;
        if was_present && !present {
            inner.disc.info = None;
            inner.disc.auto_rip.clear();
            self.push_event(&mut inner, EventLevel::Info, "Disc removed".to_string());
        } else if !was_present && present {
            self.push_event(&mut inner, EventLevel::Info, "Disc inserted".to_string());
        }
    }

    /// Flag the cached info for a rescan without touching its contents.
    pub fn mark_disc_scan_pending(&self) {
        if let Some(info) = self.lock().disc.info.as_mut() {
            info.scan_pending = true;
        }
    }

    pub fn disc_present(&self) -> bool {
        self.lock().disc.present
    }

    pub fn drives(&self) -> Vec<DriveInfo> {
        self.lock().disc.drives.clone()
    }

    pub fn auto_rip_queue(&self, identity: &str) -> Option<AutoRipQueue> {
        self.lock().disc.auto_rip.get(identity).cloned()
    }

    /// Install a queue for a disc unless one already exists.
    pub fn ensure_auto_rip_queue(&self, queue: AutoRipQueue) -> AutoRipQueue {
        let mut inner = self.lock();
        inner
            .disc
            .auto_rip
            .entry(queue.identity.clone())
            .or_insert(queue)
            .clone()
    }

    pub fn next_auto_rip_title(&self, identity: &str) -> Option<u32> {
        self.lock()
            .disc
            .auto_rip
            .get_mut(identity)
            .and_then(|q| q.next_title())
    }

    pub fn mark_auto_rip_complete(&self, identity: &str) {
        let mut inner = self.lock();
        if let Some(q) = inner.disc.auto_rip.get_mut(identity) {
            q.remaining.clear();
            q.complete = true;
        }
        self.push_event(
            &mut inner,
            EventLevel::Info,
            format!("Auto-rip finished for {}", identity),
        );
    }

    pub fn set_subsystem(&self, name: &str, available: bool, detail: impl Into<String>) {
        let mut inner = self.lock();
        inner.subsystems.insert(
            name.to_string(),
            SubsystemStatus {
                available,
                detail: detail.into(),
                updated_at: current_timestamp_ms(),
            },
        );
    }

    /// Consistent view of everything, read under the store lock.
    pub fn snapshot(&self) -> StatusSnapshot {
        let now = current_timestamp_ms();
        let inner = self.lock();

        let mut active: Vec<ActiveJob> = inner
            .active
            .values()
            .map(|e| ActiveJob {
                duration_secs: e.job.duration_secs(now),
                job: e.job.clone(),
            })
            .collect();
        active.sort_by(|a, b| {
            a.job
                .created_at
                .cmp(&b.job.created_at)
                .then_with(|| a.job.source.cmp(&b.job.source))
        });

        let mut auto_rip: Vec<AutoRipQueue> = inner.disc.auto_rip.values().cloned().collect();
        auto_rip.sort_by(|a, b| a.identity.cmp(&b.identity));

        StatusSnapshot {
            timestamp_ms: now,
            active,
            recent: inner.history.iter().cloned().collect(),
            events: inner.events.iter().rev().cloned().collect(),
            disc: DiscStatus {
                info: inner.disc.info.clone(),
                present: inner.disc.present,
                drives: inner.disc.drives.clone(),
                rip_pending: inner.disc.rip_request.clone(),
                blocked: inner.disc.blocked,
                scan_paused: self.governor.is_paused(),
                auto_rip,
            },
            governor: self.governor.status(),
            subsystems: inner.subsystems.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc_info::{DiscSummary, DiscType, Title};
    use proptest::prelude::*;

    fn make_store() -> JobStore {
        JobStore::new(100, 50, Arc::new(ScanGovernor::default()))
    }

    fn make_disc_info(titles: usize) -> DiscInfo {
        DiscInfo {
            source: "disc:0".to_string(),
            raw: String::new(),
            titles: (0..titles as u32)
                .map(|id| Title {
                    id,
                    duration_secs: Some(3600),
                    ..Title::default()
                })
                .collect(),
            summary: DiscSummary::default(),
            formatted: String::new(),
            scan_pending: false,
            disc_type: DiscType::Bluray,
            scanned_at: 0,
        }
    }

    #[test]
    fn test_start_twice_rearms_single_job() {
        let store = make_store();
        let first = store.start("/m/a.mkv", None, None, JobState::Queued);
        store.set_state("/m/a.mkv", JobState::Starting).unwrap();
        let second = store.start(
            "/m/a.mkv",
            Some(PathBuf::from("/out/a.mp4")),
            Some("again".into()),
            JobState::Queued,
        );

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.run_id, second.run_id);
        let snap = store.snapshot();
        assert_eq!(snap.active.len(), 1);
        let job = &snap.active[0].job;
        assert_eq!(job.state, JobState::Starting);
        assert_eq!(job.destination, Some(PathBuf::from("/out/a.mp4")));
        assert_eq!(job.info.as_deref(), Some("again"));

        second.token.cancel();
        assert!(first.token.is_cancelled());
    }

    #[test]
    fn test_set_state_rejects_backwards_and_terminal() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();
        assert!(matches!(
            store.set_state("k", JobState::Starting),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.set_state("k", JobState::Success),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(
            store.set_state("missing", JobState::Running),
            Err(StoreError::UnknownJob("missing".into()))
        );
    }

    #[test]
    fn test_entering_new_phase_resets_progress() {
        let store = make_store();
        store.start("disc:0", None, None, JobState::Queued);
        store.set_state("disc:0", JobState::Ripping).unwrap();
        store.update_progress("disc:0", 80.0);
        store.update_eta("disc:0", 30);
        store.set_state("disc:0", JobState::Running).unwrap();

        let job = store.job("disc:0").unwrap();
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.eta_secs, None);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_progress_derives_linear_eta() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();
        let started = store.job("k").unwrap().phase_started_at;

        store.update_progress_at("k", 25.0, started + 60_000);
        let job = store.job("k").unwrap();
        assert_eq!(job.progress, 25.0);
        assert_eq!(job.eta_secs, Some(180));
    }

    #[test]
    fn test_explicit_eta_overrides_extrapolation() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();
        let started = store.job("k").unwrap().phase_started_at;

        store.update_eta("k", 42);
        store.update_progress_at("k", 50.0, started + 1_000_000);
        assert_eq!(store.job("k").unwrap().eta_secs, Some(42));
    }

    #[test]
    fn test_complete_moves_to_history_and_dedups() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        assert!(store.complete("k", false, None, "encoder exited with 1"));
        assert!(!store.complete("k", false, None, "encoder exited with 1"));
        assert!(store.complete("k", false, None, "different message"));

        let snap = store.snapshot();
        assert!(snap.active.is_empty());
        assert_eq!(snap.recent.len(), 2);
        assert_eq!(snap.recent[0].message, "different message");
        assert!(store.is_settled("k"));
    }

    #[test]
    fn test_history_is_capped_newest_first() {
        let store = JobStore::new(3, 50, Arc::new(ScanGovernor::default()));
        for i in 0..5 {
            let key = format!("/m/{}.mkv", i);
            store.start(&key, None, None, JobState::Queued);
            store.complete(&key, true, None, "done");
        }
        let recent = store.snapshot().recent;
        let keys: Vec<&str> = recent.iter().map(|j| j.source.as_str()).collect();
        assert_eq!(keys, vec!["/m/4.mkv", "/m/3.mkv", "/m/2.mkv"]);
    }

    #[test]
    fn test_events_ring_evicts_oldest() {
        let store = JobStore::new(10, 3, Arc::new(ScanGovernor::default()));
        for i in 0..5 {
            store.event(EventLevel::Info, format!("e{}", i));
        }
        let events: Vec<String> = store.snapshot().events.into_iter().map(|e| e.message).collect();
        assert_eq!(events, vec!["e4", "e3", "e2"]);
    }

    #[test]
    fn test_stop_queued_job_finalizes_immediately() {
        let store = make_store();
        let ticket = store.start("k", None, None, JobState::Queued);
        store.update_progress("k", 10.0);

        assert_eq!(store.stop("k"), Ok(StopOutcome::Finalized));
        assert!(ticket.token.is_cancelled());
        assert!(!store.is_active("k"));
        let last = store.last_finished("k").unwrap();
        assert_eq!(last.state, JobState::Canceled);
        assert!(last.canceled);
        assert_eq!(last.progress, 10.0);
    }

    #[test]
    fn test_stop_running_job_only_signals() {
        let store = make_store();
        let ticket = store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();

        assert_eq!(store.stop("k"), Ok(StopOutcome::Signalled));
        assert!(ticket.token.is_cancelled());
        let job = store.job("k").unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.canceled);
        assert_eq!(store.stop("nope"), Err(StoreError::UnknownJob("nope".into())));
    }

    #[test]
    fn test_decide_requires_confirm_state() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        assert!(matches!(
            store.decide("k", Decision::Proceed),
            Err(StoreError::WrongState { .. })
        ));

        store.set_state("k", JobState::Confirm).unwrap();
        store.decide("k", Decision::Proceed).unwrap();
        assert_eq!(store.decision("k"), Some(Decision::Proceed));
        assert!(store.is_active("k"));
    }

    #[test]
    fn test_confirmed_keys_only_lists_proceeded_jobs() {
        let store = make_store();
        for key in ["a", "b"] {
            store.start(key, None, None, JobState::Queued);
            store.set_state(key, JobState::Confirm).unwrap();
        }
        assert!(store.confirmed_keys().is_empty());
        store.decide("b", Decision::Proceed).unwrap();
        assert_eq!(store.confirmed_keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_steps_scale_progress_across_phase() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();
        store.begin_step("k", 0, 2);
        store.update_progress("k", 60.0);
        assert_eq!(store.job("k").unwrap().progress, 30.0);

        store.begin_step("k", 1, 2);
        store.update_progress("k", 5.0);
        assert_eq!(store.job("k").unwrap().progress, 52.5);
        store.update_progress("k", 100.0);
        assert_eq!(store.job("k").unwrap().progress, 100.0);
    }

    #[test]
    fn test_restarted_step_never_lowers_progress() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Running).unwrap();
        store.update_progress("k", 60.0);
        store.update_eta("k", 90);
        store.clear_eta("k");
        store.update_progress("k", 5.0);
        let job = store.job("k").unwrap();
        assert_eq!(job.progress, 60.0);
        assert_ne!(job.eta_secs, Some(90));
    }

    #[test]
    fn test_decide_cancel_finalizes() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        store.set_state("k", JobState::Confirm).unwrap();
        store.decide("k", Decision::Cancel).unwrap();

        assert!(!store.is_active("k"));
        assert_eq!(store.last_finished("k").unwrap().state, JobState::Canceled);
    }

    #[test]
    fn test_requeue_clears_settlement() {
        let store = make_store();
        store.start("k", None, None, JobState::Queued);
        assert_eq!(store.requeue("k"), Err(StoreError::StillActive("k".into())));

        store.cancel_complete("k", "stopped");
        assert!(store.is_settled("k"));
        store.requeue("k").unwrap();
        store.requeue("k").unwrap();
        assert!(!store.is_settled("k"));
        assert_eq!(store.take_retries(), vec!["k".to_string()]);
        assert!(store.take_retries().is_empty());
    }

    #[test]
    fn test_empty_scan_never_replaces_titles() {
        let store = make_store();
        assert!(store.update_disc_info(make_disc_info(3)));
        assert!(!store.update_disc_info(make_disc_info(0)));
        assert_eq!(store.disc_info().unwrap().titles.len(), 3);

        assert!(store.update_disc_info(make_disc_info(1)));
        assert_eq!(store.disc_info().unwrap().titles.len(), 1);
    }

    #[test]
    fn test_disc_removal_clears_cache() {
        let store = make_store();
        store.set_disc_present(true, Vec::new());
        store.update_disc_info(make_disc_info(2));
        store.ensure_auto_rip_queue(AutoRipQueue::new("x".into(), vec![1]));

        store.set_disc_present(false, Vec::new());
        assert!(store.disc_info().is_none());
        assert!(store.auto_rip_queue("x").is_none());

        // After removal an empty result is accepted
        assert!(store.update_disc_info(make_disc_info(0)));
    }

    #[test]
    fn test_rip_request_single_pending() {
        let store = make_store();
        let req = RipRequest {
            source: "disc:0".into(),
            mode: RipMode::Manual,
            requested_at: 0,
        };
        assert!(store.request_rip(req.clone()));
        assert!(!store.request_rip(req.clone()));
        assert_eq!(store.snapshot().disc.rip_pending, Some(req.clone()));
        assert_eq!(store.take_rip_request(), Some(req));
        assert!(store.pending_rip().is_none());
    }

    #[test]
    fn test_auto_rip_queue_is_not_rebuilt() {
        let store = make_store();
        store.ensure_auto_rip_queue(AutoRipQueue::new("d".into(), vec![3, 1]));
        assert_eq!(store.next_auto_rip_title("d"), Some(3));

        let existing = store.ensure_auto_rip_queue(AutoRipQueue::new("d".into(), vec![9, 8]));
        assert_eq!(existing.remaining, vec![1]);
        store.mark_auto_rip_complete("d");
        assert!(store.auto_rip_queue("d").unwrap().complete);
        assert_eq!(store.next_auto_rip_title("d"), None);
    }

    #[test]
    fn test_snapshot_serializes_flat_active_jobs() {
        let store = make_store();
        store.start("/m/a.mkv", None, None, JobState::Queued);
        store.set_subsystem("usb", true, "mounted");
        let json = serde_json::to_value(store.snapshot()).unwrap();

        assert_eq!(json["active"][0]["source"], "/m/a.mkv");
        assert_eq!(json["active"][0]["state"], "queued");
        assert!(json["active"][0]["duration_secs"].is_u64());
        assert_eq!(json["subsystems"]["usb"]["available"], true);
        assert_eq!(json["governor"]["in_flight"], false);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_clamped_and_monotonic(
            updates in proptest::collection::vec(-50.0f32..200.0, 1..30),
            ripping in proptest::bool::ANY,
        ) {
            let store = make_store();
            store.start("k", None, None, JobState::Queued);
            let phase = if ripping { JobState::Ripping } else { JobState::Running };
            store.set_state("k", phase).unwrap();

            let mut last = 0.0f32;
            for pct in updates {
                store.update_progress("k", pct);
                let p = store.job("k").unwrap().progress;
                prop_assert!((0.0..=100.0).contains(&p));
                prop_assert!(p >= last);
                last = p;
            }
        }

        #[test]
        fn prop_repeated_start_keeps_one_job(n in 1usize..10) {
            let store = make_store();
            let mut ids = HashSet::new();
            for _ in 0..n {
                ids.insert(store.start("k", None, None, JobState::Queued).run_id);
            }
            prop_assert_eq!(ids.len(), 1);
            prop_assert_eq!(store.snapshot().active.len(), 1);
        }
    }
}
