//! Unattended title selection for auto-rip.

use crate::disc_info::{DiscInfo, Title};
use serde::Serialize;

/// Pick the titles to rip without asking.
///
/// Titles shorter than `min_duration_secs` (or with no known duration) are
/// dropped, the rest are ordered longest first with ties broken by id, and
/// at most `count` ids are returned.
pub fn select_titles(titles: &[Title], count: usize, min_duration_secs: u64) -> Vec<u32> {
    let mut candidates: Vec<(u64, u32)> = titles
        .iter()
        .filter_map(|t| t.duration_secs.map(|d| (d, t.id)))
        .filter(|(d, _)| *d >= min_duration_secs)
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    candidates.into_iter().take(count).map(|(_, id)| id).collect()
}

/// Stable identity of a physical disc: label plus drive, else the disc index.
pub fn disc_identity(info: &DiscInfo, index: u32) -> String {
    let label = info.summary.label.as_deref().unwrap_or("").trim();
    let drive = info.summary.drive.as_deref().unwrap_or("").trim();
    if label.is_empty() && drive.is_empty() {
        format!("disc:{}", index)
    } else {
        format!("{}@{}", label, drive)
    }
}

/// Per-disc auto-rip progress.
///
/// Built once from the selector so later scans of the same disc never
/// re-rank or re-dispatch titles.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AutoRipQueue {
    pub identity: String,
    /// Titles not yet handed to a job, in rip order.
    pub remaining: Vec<u32>,
    pub dispatched: Vec<u32>,
    /// Every selected title has been dispatched and finished.
    pub complete: bool,
}

impl AutoRipQueue {
    pub fn new(identity: String, titles: Vec<u32>) -> Self {
        let complete = titles.is_empty();
        Self {
            identity,
            remaining: titles,
            dispatched: Vec::new(),
            complete,
        }
    }

    /// Hand out the next title in order.
    pub fn next_title(&mut self) -> Option<u32> {
        if self.remaining.is_empty() {
            return None;
        }
        let id = self.remaining.remove(0);
        self.dispatched.push(id);
        Some(id)
    }

    pub fn is_drained(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc_info::{DiscSummary, DiscType};
    use proptest::prelude::*;

    fn make_title(id: u32, minutes: u64) -> Title {
        Title {
            id,
            duration_secs: Some(minutes * 60),
            ..Title::default()
        }
    }

    fn make_info(label: Option<&str>, drive: Option<&str>) -> DiscInfo {
        DiscInfo {
            source: "disc:0".to_string(),
            raw: String::new(),
            titles: Vec::new(),
            summary: DiscSummary {
                label: label.map(String::from),
                drive: drive.map(String::from),
                ..DiscSummary::default()
            },
            formatted: String::new(),
            scan_pending: false,
            disc_type: DiscType::Unknown,
            scanned_at: 0,
        }
    }

    #[test]
    fn test_two_longest_qualifying_titles() {
        let titles = vec![
            make_title(0, 30),
            make_title(1, 45),
            make_title(2, 5),
            make_title(3, 50),
        ];
        assert_eq!(select_titles(&titles, 2, 20 * 60), vec![3, 1]);
    }

    #[test]
    fn test_unknown_duration_is_never_selected() {
        let titles = vec![
            Title {
                id: 7,
                ..Title::default()
            },
            make_title(1, 40),
        ];
        assert_eq!(select_titles(&titles, 5, 0), vec![1]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let titles = vec![make_title(4, 60), make_title(2, 60), make_title(9, 60)];
        assert_eq!(select_titles(&titles, 3, 0), vec![2, 4, 9]);
    }

    #[test]
    fn test_identity_prefers_label_and_drive() {
        assert_eq!(
            disc_identity(&make_info(Some("MOVIE"), Some("BD-RE")), 0),
            "MOVIE@BD-RE"
        );
        assert_eq!(disc_identity(&make_info(None, None), 3), "disc:3");
    }

    #[test]
    fn test_queue_hands_out_in_order() {
        let mut q = AutoRipQueue::new("id".into(), vec![3, 1]);
        assert!(!q.complete);
        assert_eq!(q.next_title(), Some(3));
        assert_eq!(q.next_title(), Some(1));
        assert_eq!(q.next_title(), None);
        assert!(q.is_drained());
        assert_eq!(q.dispatched, vec![3, 1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_selection_sorted_filtered_truncated(
            minutes in proptest::collection::vec(0u64..200, 0..15),
            count in 0usize..6,
            min in 0u64..120,
        ) {
            let titles: Vec<Title> = minutes
                .iter()
                .enumerate()
                .map(|(i, m)| make_title(i as u32, *m))
                .collect();
            let picked = select_titles(&titles, count, min * 60);

            prop_assert!(picked.len() <= count);
            let durations: Vec<u64> = picked.iter().map(|id| minutes[*id as usize]).collect();
            prop_assert!(durations.iter().all(|m| *m >= min));
            prop_assert!(durations.windows(2).all(|w| w[0] >= w[1]));

            let qualifying = minutes.iter().filter(|m| **m >= min).count();
            prop_assert_eq!(picked.len(), qualifying.min(count));
        }
    }
}
