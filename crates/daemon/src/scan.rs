//! Library scanner: discovers candidate sources under the configured roots.
//!
//! Mounted DVD (`VIDEO_TS`) and Blu-ray (`BDMV/STREAM`) structures at a root
//! or one level below it are reported as a single folder source. Everything
//! else is walked recursively for video files by extension, skipping hidden
//! directories, `._*` resource forks, small files, files whose origin is
//! already encoded and files whose size has not yet settled.

use crate::markers::has_encoded_marker;
use crate::stability::StabilityTracker;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use video_encoder_config::Config;
use walkdir::{DirEntry, WalkDir};

/// Scanner settings, usually taken from `Config`.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub roots: Vec<PathBuf>,
    /// Lowercase, with leading dot.
    pub extensions: Vec<String>,
    pub min_size_bytes: u64,
    pub stable_window: Duration,
    /// Directories never scanned (encoder output, rip scratch space).
    pub exclude: Vec<PathBuf>,
}

impl ScanOptions {
    pub fn from_config(config: &Config) -> Self {
        let mut roots = config.paths.library_roots.clone();
        roots.extend(config.paths.staging_roots.iter().cloned());
        let mut exclude = vec![config.paths.output_dir.clone(), config.paths.rip_dir.clone()];
        exclude.extend(config.paths.final_dir.iter().cloned());
        Self {
            roots,
            extensions: config
                .scan
                .video_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            min_size_bytes: config.scan.min_size_mb.saturating_mul(1024 * 1024),
            stable_window: Duration::from_secs(config.scan.stable_window_secs),
            exclude,
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Checks if a file has one of the given extensions (case-insensitive).
pub fn is_video_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| *e == ext_lower)
        })
        .unwrap_or(false)
}

fn dir_has_file_with(dir: &Path, suffixes: &[&str]) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        let name = e.file_name().to_string_lossy().to_lowercase();
        suffixes.iter().any(|s| name.ends_with(s))
    })
}

/// `VIDEO_TS` or `BDMV/STREAM` source inside `mount`, if it looks like a disc.
pub fn disc_structure(mount: &Path) -> Option<PathBuf> {
    let video_ts = mount.join("VIDEO_TS");
    if video_ts.is_dir() && dir_has_file_with(&video_ts, &[".vob", ".ifo", ".bup"]) {
        return Some(video_ts);
    }
    let stream = mount.join("BDMV").join("STREAM");
    if stream.is_dir() && dir_has_file_with(&stream, &[".m2ts"]) {
        return Some(stream);
    }
    None
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map_or(false, |n| n.starts_with('.') || n.eq_ignore_ascii_case("$RECYCLE.BIN"))
}

/// Stateful scanner; keeps size history between passes.
pub struct LibraryScanner {
    options: ScanOptions,
    stability: StabilityTracker,
}

impl LibraryScanner {
    pub fn new(options: ScanOptions) -> Self {
        let stability = StabilityTracker::new(options.stable_window);
        Self { options, stability }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ScanOptions::from_config(config))
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// One discovery pass, in root order then path order.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        self.scan_at(Instant::now())
    }

    pub fn scan_at(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut seen_files = Vec::new();

        for root in &self.options.roots {
            if !root.is_dir() {
                log::debug!("Scan root {} is not available", root.display());
                continue;
            }

            let mut disc_mounts: Vec<PathBuf> = Vec::new();
            if let Some(source) = disc_structure(root) {
                found.push(source);
                continue;
            }
            let mut children: Vec<PathBuf> = std::fs::read_dir(root)
                .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
                .unwrap_or_default();
            children.sort();
            for child in children.iter().filter(|c| c.is_dir()) {
                if let Some(source) = disc_structure(child) {
                    found.push(source);
                    disc_mounts.push(child.clone());
                }
            }

            let exclude = &self.options.exclude;
            let walker = WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    !is_hidden_dir(e)
                        && !disc_mounts.iter().any(|m| m == e.path())
                        && !exclude.iter().any(|x| x == e.path())
                });

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let name = entry.file_name().to_string_lossy();
                if name.starts_with("._") || !is_video_file(path, &self.options.extensions) {
                    continue;
                }
                if has_encoded_marker(path) {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.len() < self.options.min_size_bytes {
                    continue;
                }
                seen_files.push(path.to_path_buf());
                if self.stability.observe(path, metadata.len(), now) {
                    found.push(path.to_path_buf());
                }
            }
        }

        self.stability.retain_only(&seen_files);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn options(root: &Path) -> ScanOptions {
        ScanOptions {
            roots: vec![root.to_path_buf()],
            extensions: vec![".mkv".into(), ".mp4".into()],
            min_size_bytes: 10,
            stable_window: Duration::ZERO,
            exclude: Vec::new(),
        }
    }

    fn write(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn test_finds_video_files_in_order() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("b.mkv"), 100);
        write(&dir.path().join("sub/a.MP4"), 100);
        write(&dir.path().join("notes.txt"), 100);

        let found = LibraryScanner::new(options(dir.path())).scan();
        assert_eq!(
            found,
            vec![dir.path().join("b.mkv"), dir.path().join("sub/a.MP4")]
        );
    }

    #[test]
    fn test_skips_hidden_small_forks_and_encoded() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join(".Trash/x.mkv"), 100);
        write(&dir.path().join("._movie.mkv"), 100);
        write(&dir.path().join("tiny.mkv"), 5);
        write(&dir.path().join("done.mkv"), 100);
        write(&dir.path().join("done.mkv.encoded"), 0);
        write(&dir.path().join("keep.mkv"), 100);

        let found = LibraryScanner::new(options(dir.path())).scan();
        assert_eq!(found, vec![dir.path().join("keep.mkv")]);
    }

    #[test]
    fn test_disc_structures_reported_once() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("SHREK/VIDEO_TS/VTS_01_1.VOB"), 100);
        write(&dir.path().join("DUNE/BDMV/STREAM/00001.m2ts"), 100);
        write(&dir.path().join("DUNE/BDMV/STREAM/extra.mkv"), 100);

        let found = LibraryScanner::new(options(dir.path())).scan();
        assert_eq!(
            found,
            vec![
                dir.path().join("DUNE/BDMV/STREAM"),
                dir.path().join("SHREK/VIDEO_TS"),
            ]
        );
    }

    #[test]
    fn test_unstable_files_wait_for_second_pass() {
        let dir = TempDir::new().unwrap();
        let movie = dir.path().join("copying.mkv");
        write(&movie, 100);
        let mut opts = options(dir.path());
        opts.stable_window = Duration::from_secs(20);
        let mut scanner = LibraryScanner::new(opts);

        let t0 = Instant::now();
        assert!(scanner.scan_at(t0).is_empty());
        write(&movie, 200);
        assert!(scanner.scan_at(t0 + Duration::from_secs(20)).is_empty());
        assert_eq!(scanner.scan_at(t0 + Duration::from_secs(40)), vec![movie]);
    }

    #[test]
    fn test_excluded_dirs_are_not_walked() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("out/encoded.mkv"), 100);
        write(&dir.path().join("in/movie.mkv"), 100);
        let mut opts = options(dir.path());
        opts.exclude = vec![dir.path().join("out")];

        let found = LibraryScanner::new(opts).scan();
        assert_eq!(found, vec![dir.path().join("in/movie.mkv")]);
    }

    #[test]
    fn test_options_from_config_normalize_extensions() {
        let mut config = Config::default();
        config.scan.video_extensions = vec!["MKV".into(), ".Mp4".into()];
        config.paths.staging_roots = vec![PathBuf::from("/staging")];
        let opts = ScanOptions::from_config(&config);
        assert_eq!(opts.extensions, vec![".mkv", ".mp4"]);
        assert!(opts.roots.contains(&PathBuf::from("/staging")));
        assert!(opts.exclude.contains(&config.paths.output_dir));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("Mp4"),
                Just("txt"), Just("srt"), Just("jpg"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let expected = matches!(ext.to_lowercase().as_str(), "mkv" | "mp4");
            prop_assert_eq!(is_video_file(&path, &[".mkv".into(), ".mp4".into()]), expected);
        }
    }
}
