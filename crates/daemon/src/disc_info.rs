//! Parser for the ripper's machine-readable disc info dump.
//!
//! The dump is line oriented. Recognised records:
//! - `TINFO:<title>,<field>,<code>[,<lang>],"<value>"` per-title attributes
//! - `SINFO:<title>,<stream>,<field>,<code>,"<value>"` per-stream attributes
//! - `CINFO:<field>,<code>,"<value>"` disc attributes
//! - `DRV:<index>,<state>,<x>,<flags>,"<drive>","<label>","<device>"` drive slots
//! - `MSG:` free text, of which "Title #N ... length H:MM:SS ... K chapters"
//!   lines fill in durations and chapter counts missing from `TINFO`
//!
//! Anything else is ignored, so a partial or noisy dump still yields whatever
//! could be recognised.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

static TINFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^TINFO:(\d+),(\d+),(\d+),(?:([^,"]*),)?"(.*)"$"#).expect("TINFO pattern")
});
static SINFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^SINFO:(\d+),(\d+),(\d+),(?:(\d+),)?"(.*)"$"#).expect("SINFO pattern")
});
static CINFO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^CINFO:(\d+),(\d+),"(.*)"$"#).expect("CINFO pattern"));
static DRV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^DRV:(\d+),(\d+),(\d+),(\d+),"([^"]*)"(?:,"([^"]*)")?(?:,"([^"]*)")?"#)
        .expect("DRV pattern")
});
static MSG_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Title #(\d+)[^\n]*?length ([0-9:]+)(?:\D+(\d+) chapters)?")
        .expect("title message pattern")
});
static PLAYLIST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#(\d+)").expect("playlist pattern"));
static SOURCE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#?0*([0-9]{1,5})").expect("source number pattern"));
static ISO_DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$").expect("iso duration pattern")
});

/// Drive state value the ripper reports when a disc is inserted.
pub const DRIVE_STATE_INSERTED: u32 = 2;

/// Titles at least this long are listed in the overview.
const OVERVIEW_MIN_SECS: u64 = 600;

/// One stream within a title.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StreamInfo {
    /// "Video", "Audio" or "Subtitles" as reported.
    pub kind: Option<String>,
    pub lang_code: Option<String>,
    pub lang_name: Option<String>,
    pub codec: Option<String>,
    pub channels: Option<String>,
    pub resolution: Option<String>,
    pub aspect: Option<String>,
    pub framerate: Option<String>,
}

impl StreamInfo {
    fn is_kind(&self, prefix: &str) -> bool {
        self.kind
            .as_deref()
            .map(|k| k.to_lowercase().starts_with(prefix))
            .unwrap_or(false)
    }

    pub fn is_video(&self) -> bool {
        self.is_kind("video")
    }

    pub fn is_audio(&self) -> bool {
        self.is_kind("audio")
    }

    pub fn is_subtitle(&self) -> bool {
        self.is_kind("subtitle")
    }

    /// Language code, falling back to the language name, then "und".
    pub fn language(&self) -> &str {
        self.lang_code
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.lang_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("und")
    }
}

/// One selectable program on the disc.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Title {
    pub id: u32,
    /// Playlist or program number with leading zeros removed.
    pub playlist: Option<String>,
    /// Source file reference, e.g. `00800.mpls`.
    pub source: Option<String>,
    pub duration_secs: Option<u64>,
    pub chapters: Option<u32>,
    pub video: Option<String>,
    pub audio_tracks: Vec<String>,
    pub audio_langs: Vec<String>,
    pub subtitle_tracks: Vec<String>,
    pub subtitle_langs: Vec<String>,
    pub streams: BTreeMap<u32, StreamInfo>,
}

impl Title {
    fn new(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.values().filter(|s| s.is_audio())
    }

    pub fn subtitle_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.values().filter(|s| s.is_subtitle())
    }

    /// Duration formatted as `HH:MM:SS`.
    pub fn duration_label(&self) -> Option<String> {
        self.duration_secs.map(format_duration)
    }
}

/// The longest title on the disc.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MainFeature {
    pub id: u32,
    pub playlist: Option<String>,
    pub duration: Option<String>,
    pub chapters: Option<u32>,
}

/// Disc-wide facts gathered from the dump.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DiscSummary {
    pub label: Option<String>,
    pub drive: Option<String>,
    pub device: Option<String>,
    pub disc_type: Option<String>,
    /// Count of "was added as title" messages, or of parsed titles.
    pub titles_detected: usize,
    pub title_count: usize,
    pub main_feature: Option<MainFeature>,
}

/// One drive slot from a `DRV` record.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DriveInfo {
    pub index: u32,
    pub state: u32,
    pub name: String,
    pub label: String,
    pub device: String,
}

impl DriveInfo {
    pub fn has_disc(&self) -> bool {
        self.state == DRIVE_STATE_INSERTED
    }
}

/// Detected physical format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscType {
    Dvd,
    Bluray,
    #[default]
    Unknown,
}

impl DiscType {
    fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("blu-ray") || lower.contains("bluray") || lower.contains("bdmv") {
            DiscType::Bluray
        } else if lower.contains("dvd") {
            DiscType::Dvd
        } else {
            DiscType::Unknown
        }
    }
}

/// Result of parsing one dump.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ParsedDisc {
    pub titles: Vec<Title>,
    pub summary: DiscSummary,
    pub drives: Vec<DriveInfo>,
    pub disc_type: DiscType,
    /// Human-readable multi-line overview.
    pub formatted: String,
}

impl ParsedDisc {
    /// First drive that reports an inserted disc.
    pub fn loaded_drive(&self) -> Option<&DriveInfo> {
        self.drives.iter().find(|d| d.has_disc())
    }
}

/// Cached result of a disc scan.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscInfo {
    /// Source key the scan was run against (`disc:<n>`).
    pub source: String,
    pub raw: String,
    pub titles: Vec<Title>,
    pub summary: DiscSummary,
    pub formatted: String,
    /// The scan was cut off by its timeout; contents may be partial.
    pub scan_pending: bool,
    pub disc_type: DiscType,
    /// Unix timestamp (milliseconds) of the scan.
    pub scanned_at: i64,
}

impl DiscInfo {
    pub fn from_parsed(source: &str, raw: String, parsed: ParsedDisc, scan_pending: bool) -> Self {
        Self {
            source: source.to_string(),
            raw,
            titles: parsed.titles,
            summary: parsed.summary,
            formatted: parsed.formatted,
            scan_pending,
            disc_type: parsed.disc_type,
            scanned_at: crate::jobs::current_timestamp_ms(),
        }
    }

    pub fn has_titles(&self) -> bool {
        !self.titles.is_empty()
    }
}

/// Durations from free text: `H:MM:SS`, `MM:SS`, `PT#H#M#S` or plain seconds.
pub fn parse_duration(val: &str) -> Option<u64> {
    let v = val.trim().to_uppercase();
    if v.is_empty() {
        return None;
    }
    if let Some(caps) = ISO_DURATION_RE.captures(&v) {
        let field = |i: usize| caps.get(i).map_or(Some(0), |m| m.as_str().parse::<u64>().ok());
        let s = caps.get(3).map_or(Some(0.0), |m| m.as_str().parse::<f64>().ok())?;
        return hms_secs(field(1)?, field(2)?, whole_secs(s)?);
    }
    if v.contains(':') {
        let mut total = 0f64;
        for part in v.split(':') {
            let n: f64 = part.trim().parse().ok()?;
            total = total * 60.0 + n;
        }
        return whole_secs(total);
    }
    v.parse::<f64>().ok().and_then(whole_secs)
}

/// `h:m:s` to seconds, None on overflow.
pub fn hms_secs(h: u64, m: u64, s: u64) -> Option<u64> {
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

fn whole_secs(secs: f64) -> Option<u64> {
    (secs.is_finite() && secs >= 0.0 && secs < u64::MAX as f64).then(|| secs.round() as u64)
}

/// Seconds as `HH:MM:SS`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn strip_leading_zeros(s: &str) -> String {
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        s.to_string()
    } else {
        trimmed.to_string()
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// After the first `:`, or the whole value when there is none.
fn after_colon(value: &str) -> &str {
    match value.split_once(':') {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim(),
        _ => value,
    }
}

#[derive(Default)]
struct MessageTitle {
    duration_secs: Option<u64>,
    chapters: Option<u32>,
}

/// Parse a raw disc info dump.
pub fn parse(raw: &str) -> ParsedDisc {
    let mut titles: BTreeMap<u32, Title> = BTreeMap::new();
    let mut msg_titles: HashMap<String, MessageTitle> = HashMap::new();
    let mut summary = DiscSummary::default();
    let mut drives = Vec::new();
    let mut added_titles = 0usize;
    let mut type_hint = DiscType::Unknown;

    for line in raw.lines() {
        let ln = line.trim();
        if ln.is_empty() {
            continue;
        }

        if let Some(caps) = DRV_RE.captures(ln) {
            let field = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
            let drive = DriveInfo {
                index: field(1).parse().unwrap_or(0),
                state: field(2).parse().unwrap_or(0),
                name: field(5),
                label: field(6),
                device: field(7),
            };
            if !drive.name.is_empty() {
                summary.drive.get_or_insert_with(|| drive.name.clone());
                if !drive.label.is_empty() {
                    summary.label.get_or_insert_with(|| drive.label.clone());
                }
                if !drive.device.is_empty() {
                    summary.device.get_or_insert_with(|| drive.device.clone());
                }
                drives.push(drive);
            }
            continue;
        }

        if ln.contains("was added as title") {
            added_titles += 1;
        }

        if let Some(caps) = MSG_TITLE_RE.captures(ln) {
            let playlist = strip_leading_zeros(&caps[1]);
            let entry = msg_titles.entry(playlist).or_default();
            if let Some(d) = parse_duration(&caps[2]).filter(|d| *d > 0) {
                entry.duration_secs = Some(d);
            }
            if let Some(ch) = caps.get(3).and_then(|m| m.as_str().parse().ok()) {
                entry.chapters = Some(ch);
            }
        }

        if let Some(caps) = TINFO_RE.captures(ln) {
            let (Ok(title_id), Ok(field)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
                continue;
            };
            let value = caps[5].trim();
            let title = titles.entry(title_id).or_insert_with(|| Title::new(title_id));
            apply_title_field(title, field, value);
            continue;
        }

        if let Some(caps) = SINFO_RE.captures(ln) {
            let (Ok(title_id), Ok(stream_id), Ok(field)) = (
                caps[1].parse::<u32>(),
                caps[2].parse::<u32>(),
                caps[3].parse::<u32>(),
            ) else {
                continue;
            };
            let value = caps[5].trim();
            let title = titles.entry(title_id).or_insert_with(|| Title::new(title_id));
            apply_stream_field(title, stream_id, field, value);
            continue;
        }

        if let Some(caps) = CINFO_RE.captures(ln) {
            let value = caps[3].trim();
            match caps[1].parse::<u32>() {
                Ok(1) if !value.is_empty() => {
                    type_hint = DiscType::from_text(value);
                    summary.disc_type = Some(value.to_string());
                }
                Ok(2) if !value.is_empty() => {
                    summary.label.get_or_insert_with(|| value.to_string());
                }
                _ => {}
            }
        }
    }

    let mut titles: Vec<Title> = titles.into_values().collect();
    for title in &mut titles {
        finish_title(title, &msg_titles);
    }

    summary.titles_detected = if added_titles > 0 {
        added_titles
    } else {
        titles.len()
    };
    summary.title_count = titles.len();
    summary.main_feature = titles
        .iter()
        .filter(|t| t.duration_secs.unwrap_or(0) > 0)
        .max_by(|a, b| {
            a.duration_secs
                .cmp(&b.duration_secs)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|t| MainFeature {
            id: t.id,
            playlist: t.playlist.clone(),
            duration: t.duration_label(),
            chapters: t.chapters,
        });

    let disc_type = if type_hint != DiscType::Unknown {
        type_hint
    } else {
        infer_disc_type(&titles)
    };

    let mut parsed = ParsedDisc {
        titles,
        summary,
        drives,
        disc_type,
        formatted: String::new(),
    };
    parsed.formatted = format_overview(&parsed.summary, &parsed.titles);
    parsed
}

fn apply_title_field(title: &mut Title, field: u32, value: &str) {
    match field {
        2 if !value.is_empty() => {
            title.source = Some(value.to_string());
            if let Some(caps) = PLAYLIST_RE.captures(value) {
                title.playlist = Some(strip_leading_zeros(&caps[1]));
            }
        }
        // Chapters on most drives, a duration on some
        8 => {
            if let Ok(ch) = value.parse::<u32>() {
                title.chapters = Some(ch);
            } else if let Some(d) = parse_duration(value).filter(|d| *d > 0) {
                title.duration_secs = Some(d);
            }
        }
        9 => {
            if let Some(d) = parse_duration(value).filter(|d| *d > 0) {
                title.duration_secs = Some(d);
            }
        }
        // Output file name, e.g. `title_t00.mkv`; keeps `source` for the playlist fallback
        16 if !value.is_empty() => {
            title.source.get_or_insert_with(|| value.to_string());
        }
        10 if !value.is_empty() => title.video = Some(value.to_string()),
        11 => push_unique(&mut title.audio_langs, value),
        12 => push_unique(&mut title.audio_tracks, value),
        13 => push_unique(&mut title.subtitle_langs, value),
        _ => {}
    }
}

fn apply_stream_field(title: &mut Title, stream_id: u32, field: u32, value: &str) {
    let stream = title.streams.entry(stream_id).or_default();
    let owned = || Some(value.to_string());
    match field {
        1 => stream.kind = owned(),
        3 => stream.lang_code = owned(),
        4 => stream.lang_name = owned(),
        5..=7 => {
            if stream.codec.is_none() && !value.is_empty() {
                stream.codec = owned();
            }
        }
        14 => stream.channels = owned(),
        19 => stream.resolution = owned(),
        20 => stream.aspect = owned(),
        21 => stream.framerate = owned(),
        _ => {}
    }

    let lower = value.to_lowercase();
    if lower.starts_with("audio:") {
        push_unique(&mut title.audio_tracks, after_colon(value));
    } else if lower.starts_with("subtitle") && value.contains(':') {
        push_unique(&mut title.subtitle_tracks, after_colon(value));
    } else if lower.starts_with("video") && value.contains(':') && title.video.is_none() {
        title.video = Some(after_colon(value).to_string());
    }
}

fn finish_title(title: &mut Title, msg_titles: &HashMap<String, MessageTitle>) {
    if title.playlist.is_none() {
        if let Some(source) = &title.source {
            if let Some(caps) = SOURCE_NUMBER_RE.captures(source) {
                title.playlist = Some(caps[1].to_string());
            }
        }
    }
    if let Some(playlist) = &title.playlist {
        if let Some(msg) = msg_titles.get(&strip_leading_zeros(playlist)) {
            if title.duration_secs.is_none() {
                title.duration_secs = msg.duration_secs;
            }
            if title.chapters.is_none() {
                title.chapters = msg.chapters;
            }
        }
    }

    let audio_langs: Vec<String> = title
        .audio_streams()
        .map(|s| s.language().to_string())
        .filter(|l| l != "und")
        .collect();
    for lang in audio_langs {
        push_unique(&mut title.audio_langs, &lang);
    }
    let subtitle_langs: Vec<String> = title
        .subtitle_streams()
        .map(|s| s.language().to_string())
        .filter(|l| l != "und")
        .collect();
    for lang in subtitle_langs {
        push_unique(&mut title.subtitle_langs, &lang);
    }
}

fn infer_disc_type(titles: &[Title]) -> DiscType {
    for title in titles {
        if let Some(source) = &title.source {
            let lower = source.to_lowercase();
            if lower.ends_with(".mpls") || lower.ends_with(".m2ts") {
                return DiscType::Bluray;
            }
            if lower.ends_with(".vob") || lower.ends_with(".ifo") {
                return DiscType::Dvd;
            }
        }
    }
    DiscType::Unknown
}

/// Build the human-readable overview.
///
/// The header names label, drive, title count and main feature. Titles of ten
/// minutes or more are listed longest first; when there are none the three
/// longest are listed instead.
pub fn format_overview(summary: &DiscSummary, titles: &[Title]) -> String {
    let mut lines = Vec::new();

    let mut head = Vec::new();
    if let Some(label) = &summary.label {
        head.push(format!("Label: {}", label));
    }
    if let Some(drive) = &summary.drive {
        head.push(format!("Drive: {}", drive));
    }
    let count = if summary.titles_detected > 0 {
        summary.titles_detected
    } else {
        summary.title_count
    };
    if count > 0 {
        head.push(format!("Titles: {}", count));
    }
    if let Some(mf) = &summary.main_feature {
        let mut parts = vec![format!("id {}", mf.id)];
        if let Some(p) = &mf.playlist {
            parts.push(p.clone());
        }
        if let Some(d) = &mf.duration {
            parts.push(d.clone());
        }
        if let Some(c) = mf.chapters {
            parts.push(format!("{} chapters", c));
        }
        head.push(format!("Main: {}", parts.join(" | ")));
    }
    if !head.is_empty() {
        lines.push(head.join(" | "));
    }

    let duration = |t: &&Title| t.duration_secs.unwrap_or(0);
    let mut selected: Vec<&Title> = titles
        .iter()
        .filter(|t| duration(t) >= OVERVIEW_MIN_SECS)
        .collect();
    if selected.is_empty() {
        selected = titles.iter().collect();
        selected.sort_by_key(|t| std::cmp::Reverse(duration(t)));
        selected.truncate(3);
    }
    selected.sort_by_key(|t| std::cmp::Reverse(duration(t)));

    for title in selected {
        lines.push(format_title_line(title));
    }

    lines.join("\n")
}

fn format_title_line(title: &Title) -> String {
    let mut parts = Vec::new();
    let mut label = format!("Title {}", title.id);
    if let Some(p) = &title.playlist {
        label.push_str(&format!(" ({})", p));
    }
    parts.push(label);
    if let Some(d) = title.duration_label() {
        parts.push(d);
    }
    if let Some(c) = title.chapters {
        parts.push(format!("{} chapters", c));
    }

    if let Some(v) = title.streams.values().find(|s| s.is_video()) {
        let bits: Vec<&str> = [
            v.codec.as_deref(),
            v.resolution.as_deref(),
            v.framerate.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|b| !b.is_empty())
        .collect();
        if !bits.is_empty() {
            parts.push(format!("video: {}", bits.join(" ")));
        }
    } else if let Some(video) = &title.video {
        parts.push(format!("video: {}", video));
    }

    let audio: Vec<&StreamInfo> = title.audio_streams().collect();
    if !audio.is_empty() {
        // Group identical language/codec/channel combinations, keeping first-seen order on ties
        let mut groups: Vec<(String, usize)> = Vec::new();
        for a in audio {
            let mut desc = a.language().to_string();
            for extra in [&a.codec, &a.channels].into_iter().flatten() {
                if !extra.is_empty() {
                    desc.push(' ');
                    desc.push_str(extra);
                }
            }
            match groups.iter_mut().find(|(d, _)| *d == desc) {
                Some((_, n)) => *n += 1,
                None => groups.push((desc, 1)),
            }
        }
        groups.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
        let bits: Vec<String> = groups
            .iter()
            .map(|(d, n)| if *n > 1 { format!("{} x{}", d, n) } else { d.clone() })
            .collect();
        let mut short = bits.iter().take(4).cloned().collect::<Vec<_>>().join(", ");
        if bits.len() > 4 {
            short.push_str(" …");
        }
        parts.push(format!("audio: {}", short));
    } else if !title.audio_tracks.is_empty() {
        let suffix = if title.audio_tracks.len() > 2 { "…" } else { "" };
        parts.push(format!(
            "audio: {}{}",
            title.audio_tracks.iter().take(2).cloned().collect::<Vec<_>>().join("; "),
            suffix
        ));
    }

    let mut seen = HashSet::new();
    let subs: Vec<&str> = title
        .subtitle_streams()
        .map(|s| s.language())
        .filter(|l| seen.insert(*l))
        .collect();
    if !subs.is_empty() {
        let mut short = subs.iter().take(6).copied().collect::<Vec<_>>().join(", ");
        if subs.len() > 6 {
            short.push_str(" …");
        }
        parts.push(format!("subs: {}", short));
    } else if !title.subtitle_tracks.is_empty() {
        let suffix = if title.subtitle_tracks.len() > 2 { "…" } else { "" };
        parts.push(format!(
            "subs: {}{}",
            title.subtitle_tracks.iter().take(2).cloned().collect::<Vec<_>>().join("; "),
            suffix
        ));
    }

    parts.join(" | ")
}
