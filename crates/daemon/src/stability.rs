//! Copy-in-progress detection.
//!
//! A file still being written to (a USB copy, a network transfer) must not be
//! queued. `StabilityTracker` remembers each file's size across scan passes
//! and only reports it stable once the size has held for a full window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Result of comparing two size observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    Stable,
    Unstable {
        initial_size: u64,
        current_size: u64,
    },
}

#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    size: u64,
    since: Instant,
}

/// Per-path size history across scans.
#[derive(Debug)]
pub struct StabilityTracker {
    window: Duration,
    seen: HashMap<PathBuf, Observation>,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `size` for `path` and report whether it has been unchanged for
    /// at least the window.
    pub fn observe(&mut self, path: &Path, size: u64, now: Instant) -> bool {
        match self.seen.get_mut(path) {
            Some(obs) => match compare_sizes(obs.size, size) {
                StabilityResult::Stable => now.saturating_duration_since(obs.since) >= self.window,
                StabilityResult::Unstable { current_size, .. } => {
                    log::debug!(
                        "{} still growing ({} -> {} bytes)",
                        path.display(),
                        obs.size,
                        current_size
                    );
                    *obs = Observation {
                        size: current_size,
                        since: now,
                    };
                    self.window.is_zero()
                }
            },
            None => {
                self.seen
                    .insert(path.to_path_buf(), Observation { size, since: now });
                self.window.is_zero()
            }
        }
    }

    /// Forget paths that were not seen in the latest pass.
    pub fn retain_only(&mut self, present: &[PathBuf]) {
        self.seen.retain(|p, _| present.contains(p));
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);
            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(result, StabilityResult::Unstable { initial_size, current_size });
            }
        }
    }

    #[test]
    fn test_stable_after_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(20));
        let path = Path::new("/media/usb/movie.mkv");
        let t0 = Instant::now();

        assert!(!tracker.observe(path, 1000, t0));
        assert!(!tracker.observe(path, 1000, t0 + Duration::from_secs(10)));
        assert!(tracker.observe(path, 1000, t0 + Duration::from_secs(20)));
    }

    #[test]
    fn test_growth_restarts_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(20));
        let path = Path::new("/media/usb/movie.mkv");
        let t0 = Instant::now();

        tracker.observe(path, 1000, t0);
        assert!(!tracker.observe(path, 2000, t0 + Duration::from_secs(25)));
        assert!(!tracker.observe(path, 2000, t0 + Duration::from_secs(40)));
        assert!(tracker.observe(path, 2000, t0 + Duration::from_secs(45)));
    }

    #[test]
    fn test_zero_window_is_immediately_stable() {
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        assert!(tracker.observe(Path::new("/a.mkv"), 5, Instant::now()));
    }

    #[test]
    fn test_retain_only_forgets_removed_files() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let now = Instant::now();
        tracker.observe(Path::new("/a.mkv"), 1, now);
        tracker.observe(Path::new("/b.mkv"), 1, now);
        tracker.retain_only(&[PathBuf::from("/b.mkv")]);
        assert_eq!(tracker.tracked(), 1);
    }
}
