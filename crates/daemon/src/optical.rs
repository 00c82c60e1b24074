//! Optical drive access: governed disc-info scans and disc presence.

use crate::classify::SourceKey;
use crate::disc_info::{self, DiscInfo};
use crate::encode::info_command;
use crate::job_store::JobStore;
use crate::jobs::{current_timestamp_ms, EventLevel};
use crate::process::{capture, LaunchError, Launcher};
use std::sync::Arc;
use std::time::Duration;
use video_encoder_config::DiscConfig;

/// Scans the disc through the governor and keeps the store's disc cache current.
pub struct OpticalDrive {
    store: Arc<JobStore>,
    launcher: Arc<dyn Launcher>,
    scan_timeout: Duration,
    info_max_age: Duration,
}

impl OpticalDrive {
    pub fn new(
        store: Arc<JobStore>,
        launcher: Arc<dyn Launcher>,
        scan_timeout: Duration,
        info_max_age: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            scan_timeout,
            info_max_age,
        }
    }

    pub fn from_config(config: &DiscConfig, store: Arc<JobStore>, launcher: Arc<dyn Launcher>) -> Self {
        Self::new(
            store,
            launcher,
            Duration::from_secs(config.scan_timeout_secs),
            Duration::from_secs(config.info_max_age_secs),
        )
    }

    /// Run a disc-info scan of `disc:<index>` if the governor allows it.
    ///
    /// Returns Ok(None) when the scan was deferred (drive busy, paused or
    /// cooling down) or produced no usable result. A timed-out scan still
    /// parses whatever was printed and is stored with `scan_pending` set.
    /// The disc only counts as removed when a scan that ran to completion
    /// lists the drives and none of them holds a disc; a timed-out or failed
    /// scan with nothing to show leaves presence and the cache untouched.
    pub async fn scan(&self, index: u32, force: bool) -> Result<Option<DiscInfo>, LaunchError> {
        let governor = self.store.governor();
        if !governor.can_start(force) {
            log::debug!("Disc scan deferred by governor");
            return Ok(None);
        }
        let Some(permit) = governor.try_acquire("scan") else {
            return Ok(None);
        };

        let source = format!("disc:{}", index);
        let captured = match capture(self.launcher.as_ref(), &info_command(index), self.scan_timeout).await {
            Ok(captured) => captured,
            Err(e) => {
                permit.finish_scan(false, false);
                self.store.set_subsystem("optical", false, e.to_string());
                return Err(e);
            }
        };

        let parsed = disc_info::parse(&captured.output);
        let loaded = parsed.loaded_drive().is_some() || !parsed.titles.is_empty();
        let exited_ok = captured.exit.map_or(false, |e| e.success());
        let completed = exited_ok && !captured.timed_out;
        permit.finish_scan(exited_ok || loaded, captured.timed_out);

        if !loaded {
            if completed && !parsed.drives.is_empty() {
                self.store.set_disc_present(false, parsed.drives);
                self.store.set_subsystem("optical", true, "no disc");
            } else {
                self.store.mark_disc_scan_pending();
                self.store.event(
                    EventLevel::Warn,
                    format!("Disc scan of {} was inconclusive; keeping cached state", source),
                );
            }
            return Ok(None);
        }

        self.store.set_disc_present(true, parsed.drives.clone());
        self.store.set_subsystem("optical", true, "disc inserted");

        if captured.timed_out {
            self.store.event(
                EventLevel::Warn,
                format!("Disc scan of {} timed out; results pending", source),
            );
        }
        let info = DiscInfo::from_parsed(&source, captured.output, parsed, captured.timed_out);
        log::info!(
            "Scanned {}: {} titles ({})",
            source,
            info.titles.len(),
            info.summary.label.as_deref().unwrap_or("no label")
        );
        self.store.update_disc_info(info);
        Ok(self.store.disc_info())
    }

    /// Whether the cached info is missing, partial or older than the max age.
    pub fn needs_refresh(&self) -> bool {
        match self.store.disc_info() {
            None => true,
            Some(info) => {
                info.scan_pending
                    || current_timestamp_ms() - info.scanned_at
                        >= self.info_max_age.as_millis() as i64
            }
        }
    }

    /// Scan if the cache needs it; errors are logged, not returned.
    pub async fn refresh_if_due(&self) {
        if !self.needs_refresh() {
            return;
        }
        let index = self.current_index().unwrap_or(0);
        if let Err(e) = self.scan(index, false).await {
            log::debug!("Disc scan unavailable: {}", e);
        }
    }

    /// Index of the drive holding a disc, from the last scan.
    pub fn current_index(&self) -> Option<u32> {
        self.store
            .drives()
            .iter()
            .find(|d| d.has_disc())
            .map(|d| d.index)
    }

    /// Disc index a key refers to.
    ///
    /// `dev:` keys are looked up in the drive records; file keys (mounted
    /// Blu-ray folders) use the loaded drive.
    pub fn resolve_index(&self, key: &SourceKey) -> Option<u32> {
        match key {
            SourceKey::Disc(index) => Some(*index),
            SourceKey::Device(node) => self
                .store
                .drives()
                .iter()
                .find(|d| d.device == *node)
                .map(|d| d.index),
            SourceKey::File(_) => self
                .current_index()
                .or_else(|| self.store.disc_present().then_some(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::ScanGovernor;
    use crate::process::testing::{FakeLauncher, FakeScript};
    use crate::title_select::AutoRipQueue;

    const DISC_OUTPUT: &[&str] = &[
        r#"DRV:0,2,999,12,"BD-RE DRIVE","MOVIE_DISC","/dev/sr0""#,
        r#"CINFO:1,6209,"Blu-ray disc""#,
        r#"CINFO:2,0,"MOVIE_DISC""#,
        r#"TINFO:0,9,0,"2:01:05""#,
        r#"TINFO:1,9,0,"0:04:30""#,
    ];

    const EMPTY_DRIVE: &[&str] = &[r#"DRV:0,0,999,0,"BD-RE DRIVE","","/dev/sr0""#];

    fn setup(interval: Duration) -> (Arc<JobStore>, Arc<FakeLauncher>, OpticalDrive) {
        let store = Arc::new(JobStore::new(10, 10, Arc::new(ScanGovernor::new(interval))));
        let launcher = Arc::new(FakeLauncher::new());
        let drive = OpticalDrive::new(
            store.clone(),
            launcher.clone(),
            Duration::from_secs(5),
            Duration::from_secs(600),
        );
        (store, launcher, drive)
    }

    #[tokio::test]
    async fn test_scan_stores_info_and_presence() {
        let (store, launcher, drive) = setup(Duration::ZERO);
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(DISC_OUTPUT));

        let info = drive.scan(0, false).await.unwrap().unwrap();
        assert_eq!(info.titles.len(), 2);
        assert!(!info.scan_pending);
        assert!(store.disc_present());
        assert_eq!(drive.current_index(), Some(0));
        assert_eq!(
            drive.resolve_index(&SourceKey::Device("/dev/sr0".into())),
            Some(0)
        );
        assert!(!drive.needs_refresh());
        assert!(!store.governor().status().in_flight);
    }

    #[tokio::test]
    async fn test_empty_rescan_keeps_titles_and_removal_clears() {
        let (store, launcher, drive) = setup(Duration::ZERO);
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(DISC_OUTPUT));
        launcher.script(
            "makemkvcon",
            FakeScript::exits(0).with_lines(&[DISC_OUTPUT[0]]),
        );
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(EMPTY_DRIVE));

        drive.scan(0, false).await.unwrap();
        let kept = drive.scan(0, false).await.unwrap().unwrap();
        assert_eq!(kept.titles.len(), 2);

        assert!(drive.scan(0, false).await.unwrap().is_none());
        assert!(!store.disc_present());
        assert!(store.disc_info().is_none());
    }

    #[tokio::test]
    async fn test_governor_defers_second_scan() {
        let (store, launcher, drive) = setup(Duration::from_secs(60));
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(DISC_OUTPUT));
        drive.scan(0, false).await.unwrap();

        assert!(drive.scan(0, false).await.unwrap().is_none());
        assert_eq!(launcher.launched_programs().len(), 1);

        // Forced scans bypass the interval
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(DISC_OUTPUT));
        assert!(drive.scan(0, true).await.unwrap().is_some());
        assert_eq!(store.governor().status().failures, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_pending_and_backs_off() {
        let store = Arc::new(JobStore::new(10, 10, Arc::new(ScanGovernor::default())));
        let launcher = Arc::new(FakeLauncher::new());
        let drive = OpticalDrive::new(
            store.clone(),
            launcher.clone(),
            Duration::from_millis(50),
            Duration::from_secs(600),
        );
        launcher.script("makemkvcon", FakeScript::hangs().with_lines(DISC_OUTPUT));

        let info = drive.scan(0, false).await.unwrap().unwrap();
        assert!(info.scan_pending);
        assert!(drive.needs_refresh());
        let status = store.governor().status();
        assert_eq!(status.failures, 1);
        assert!(status.cooldown_remaining_secs > 0);
    }

    #[tokio::test]
    async fn test_inconclusive_scan_keeps_cache_and_presence() {
        let store = Arc::new(JobStore::new(10, 10, Arc::new(ScanGovernor::default())));
        let launcher = Arc::new(FakeLauncher::new());
        let drive = OpticalDrive::new(
            store.clone(),
            launcher.clone(),
            Duration::from_millis(50),
            Duration::from_secs(600),
        );
        launcher.script("makemkvcon", FakeScript::exits(0).with_lines(DISC_OUTPUT));
        launcher.script("makemkvcon", FakeScript::hangs());
        launcher.script("makemkvcon", FakeScript::exits(1));

        drive.scan(0, true).await.unwrap().unwrap();
        store.ensure_auto_rip_queue(AutoRipQueue::new("MOVIE_DISC@0".into(), vec![0]));
        store.mark_auto_rip_complete("MOVIE_DISC@0");

        // Timed out without printing anything
        assert!(drive.scan(0, true).await.unwrap().is_none());
        assert!(store.disc_present());
        let info = store.disc_info().unwrap();
        assert_eq!(info.titles.len(), 2);
        assert!(info.scan_pending);

        // Failed without printing anything
        assert!(drive.scan(0, true).await.unwrap().is_none());
        assert!(store.disc_present());
        assert_eq!(store.disc_info().unwrap().titles.len(), 2);
        assert!(store.auto_rip_queue("MOVIE_DISC@0").unwrap().complete);
        assert_eq!(store.governor().status().failures, 2);
    }

    #[tokio::test]
    async fn test_missing_ripper_counts_as_failure() {
        let (store, launcher, drive) = setup(Duration::ZERO);
        launcher.script("makemkvcon", FakeScript::missing());

        let err = drive.scan(0, false).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)));
        assert_eq!(store.governor().status().failures, 1);
        assert!(!store.snapshot().subsystems["optical"].available);
    }
}
