//! Progress and ETA extraction from streamed tool output.
//!
//! Encoders redraw their status line with `\r`, so both `\r` and `\n` end a
//! logical line. Each line may carry a percentage (`42%`, `42.5 %`), an
//! `ETA 01h02m03s` style estimate, or a ripper `PRGV:current,total,max`
//! record.

use crate::disc_info::hms_secs;
use crate::job_store::JobStore;
use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\d.])(\d{1,3}(?:\.\d+)?)\s?%").expect("percent pattern"));
static ETA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bETA[:\s]+([0-9hms:]+)").expect("eta pattern"));
static HMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("hms pattern")
});
static PRGV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PRGV:(\d+),(\d+),(\d+)").expect("prgv pattern"));

/// Splits a byte stream into logical lines on `\r` and `\n`.
///
/// Bytes after the last terminator are held until more data arrives or
/// `finish` is called.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the complete, non-empty lines it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\r' || b == b'\n' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Return whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !text.is_empty() {
            lines.push(text);
        }
    }
}

/// Last percentage on the line, if any.
pub fn parse_percent(line: &str) -> Option<f32> {
    PERCENT_RE
        .captures_iter(line)
        .filter_map(|c| c[1].parse::<f32>().ok())
        .filter(|p| (0.0..=100.0).contains(p))
        .last()
}

/// `HH:MM:SS`, `MM:SS` or `NhNmNs` to seconds.
pub fn parse_eta_token(token: &str) -> Option<u64> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }
    if token.contains(':') {
        let parts: Vec<u64> = token
            .split(':')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        return match parts.as_slice() {
            [h, m, s] => hms_secs(*h, *m, *s),
            [m, s] => hms_secs(0, *m, *s),
            _ => None,
        };
    }
    let caps = HMS_RE.captures(&token)?;
    if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() {
        return None;
    }
    let n = |i: usize| caps.get(i).map_or(Some(0), |m| m.as_str().parse::<u64>().ok());
    hms_secs(n(1)?, n(2)?, n(3)?)
}

/// Seconds from an `ETA <token>` on the line.
pub fn parse_eta(line: &str) -> Option<u64> {
    let caps = ETA_RE.captures(line)?;
    parse_eta_token(&caps[1])
}

/// Percentage from a ripper `PRGV:current,total,max` record.
///
/// Uses the total-progress field so the value does not restart per sub-task.
pub fn parse_prgv(line: &str) -> Option<f32> {
    let caps = PRGV_RE.captures(line.trim())?;
    let total: f64 = caps[2].parse().ok()?;
    let max: f64 = caps[3].parse().ok()?;
    if max <= 0.0 {
        return None;
    }
    Some(((total / max) * 100.0).clamp(0.0, 100.0) as f32)
}

/// What a single line contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineUpdate {
    pub percent: Option<f32>,
    pub eta_secs: Option<u64>,
}

pub fn parse_line(line: &str) -> LineUpdate {
    LineUpdate {
        percent: parse_prgv(line).or_else(|| parse_percent(line)),
        eta_secs: parse_eta(line),
    }
}

/// Parse one line and forward anything found to the store.
pub fn apply_line(store: &JobStore, key: &str, line: &str) -> LineUpdate {
    let update = parse_line(line);
    if let Some(pct) = update.percent {
        store.update_progress(key, pct);
    }
    if let Some(eta) = update.eta_secs {
        store.update_eta(key, eta);
    }
    update
}
