//! Disc scan governor.
//!
//! The optical drive is a singleton. A disc-info scan can block for tens of
//! seconds, so every scan and every rip claims the one in-flight slot here.
//! Failed or timed-out scans push the next permitted scan out by
//! `min(300, 60 * failures)` seconds.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Upper bound for the failure backoff.
pub const MAX_BACKOFF_SECS: u64 = 300;

/// Backoff added per consecutive failure.
pub const BACKOFF_STEP_SECS: u64 = 60;

/// Cooldown after `failures` consecutive failed or timed-out scans.
pub fn backoff_secs(failures: u32) -> u64 {
    (BACKOFF_STEP_SECS.saturating_mul(failures as u64)).min(MAX_BACKOFF_SECS)
}

#[derive(Debug, Default)]
struct GovernorState {
    in_flight: bool,
    holder: Option<String>,
    cooldown_until: Option<Instant>,
    failures: u32,
    paused: bool,
}

/// Point-in-time view for the status snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GovernorStatus {
    pub in_flight: bool,
    /// What currently holds the drive ("scan" or a job key).
    pub holder: Option<String>,
    pub paused: bool,
    pub failures: u32,
    pub cooldown_remaining_secs: u64,
}

/// Rate-limited gate in front of the optical drive.
#[derive(Debug)]
pub struct ScanGovernor {
    state: Mutex<GovernorState>,
    released: Notify,
    /// Spacing enforced after a successful scan.
    min_interval: Duration,
}

impl Default for ScanGovernor {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ScanGovernor {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            state: Mutex::new(GovernorState::default()),
            released: Notify::new(),
            min_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a scan may start now.
    ///
    /// Always false while another scan or rip holds the drive. `force`
    /// bypasses the pause flag and the cooldown deadline.
    pub fn can_start(&self, force: bool) -> bool {
        self.can_start_at(force, Instant::now())
    }

    pub fn can_start_at(&self, force: bool, now: Instant) -> bool {
        let state = self.lock();
        if state.in_flight {
            return false;
        }
        if force {
            return true;
        }
        if state.paused {
            return false;
        }
        match state.cooldown_until {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Atomically claim the in-flight slot for a scan.
    ///
    /// Returns false if the slot is already held.
    pub fn start_scan(&self) -> bool {
        self.claim("scan")
    }

    fn claim(&self, holder: &str) -> bool {
        let mut state = self.lock();
        if state.in_flight {
            return false;
        }
        state.in_flight = true;
        state.holder = Some(holder.to_string());
        true
    }

    /// Release the slot and record the outcome of a scan.
    pub fn finish_scan(&self, success: bool, timed_out: bool) {
        self.finish_scan_at(success, timed_out, Instant::now());
    }

    pub fn finish_scan_at(&self, success: bool, timed_out: bool, now: Instant) {
        {
            let mut state = self.lock();
            state.in_flight = false;
            state.holder = None;
            if success && !timed_out {
                state.failures = 0;
                state.cooldown_until = if self.min_interval.is_zero() {
                    None
                } else {
                    Some(now + self.min_interval)
                };
            } else {
                state.failures = state.failures.saturating_add(1);
                let wait = Duration::from_secs(backoff_secs(state.failures));
                state.cooldown_until = Some(now + wait);
                log::warn!(
                    "Disc scan {} ({} consecutive); next scan in {}s",
                    if timed_out { "timed out" } else { "failed" },
                    state.failures,
                    wait.as_secs()
                );
            }
        }
        self.released.notify_waiters();
    }

    /// Release the slot without touching the failure counter or cooldown.
    pub fn release(&self) {
        {
            let mut state = self.lock();
            state.in_flight = false;
            state.holder = None;
        }
        self.released.notify_waiters();
    }

    /// Stop automatic scans until `resume` is called.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.released.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn status(&self) -> GovernorStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> GovernorStatus {
        let state = self.lock();
        let cooldown_remaining_secs = state
            .cooldown_until
            .map(|deadline| deadline.saturating_duration_since(now).as_secs())
            .unwrap_or(0);
        GovernorStatus {
            in_flight: state.in_flight,
            holder: state.holder.clone(),
            paused: state.paused,
            failures: state.failures,
            cooldown_remaining_secs,
        }
    }

    /// Try to take the drive for `holder` without waiting.
    ///
    /// Cooldown and pause do not apply; only an in-flight scan or rip blocks.
    pub fn try_acquire(&self, holder: &str) -> Option<DrivePermit<'_>> {
        if self.claim(holder) {
            Some(DrivePermit {
                governor: self,
                done: false,
            })
        } else {
            None
        }
    }

    /// Wait until the drive is free, then take it for `holder`.
    pub async fn acquire(&self, holder: &str) -> DrivePermit<'_> {
        loop {
            let released = self.released.notified();
            if let Some(permit) = self.try_acquire(holder) {
                return permit;
            }
            released.await;
        }
    }
}

/// Exclusive hold on the drive; released on drop.
#[derive(Debug)]
pub struct DrivePermit<'a> {
    governor: &'a ScanGovernor,
    done: bool,
}

impl DrivePermit<'_> {
    /// Finish a scan and feed its outcome into the backoff.
    pub fn finish_scan(mut self, success: bool, timed_out: bool) {
        self.done = true;
        self.governor.finish_scan(success, timed_out);
    }
}

impl Drop for DrivePermit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.governor.release();
        }
    }
}
