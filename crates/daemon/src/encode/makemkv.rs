//! Ripper command lines.

use crate::process::CommandSpec;
use std::path::Path;

pub const RIPPER_PROGRAM: &str = "makemkvcon";

/// Rip one title, or every title when `title` is None, into `dir`.
pub fn rip_command(index: u32, title: Option<u32>, dir: &Path, min_secs: u64) -> CommandSpec {
    let title = title.map_or_else(|| "all".to_string(), |t| t.to_string());
    CommandSpec::new(
        RIPPER_PROGRAM,
        vec![
            "-r".to_string(),
            "--progress=-same".to_string(),
            "mkv".to_string(),
            format!("disc:{}", index),
            title,
            dir.to_string_lossy().into_owned(),
            format!("--minlength={}", min_secs),
        ],
    )
    .with_output(dir.to_path_buf())
}

/// Dump disc and title information for `disc:<index>`.
pub fn info_command(index: u32) -> CommandSpec {
    CommandSpec::new(
        RIPPER_PROGRAM,
        vec!["-r".to_string(), "info".to_string(), format!("disc:{}", index)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rip_single_title() {
        let spec = rip_command(0, Some(3), Path::new("/rips/MOVIE"), 1200);
        assert_eq!(
            spec.display(),
            "makemkvcon -r --progress=-same mkv disc:0 3 /rips/MOVIE --minlength=1200"
        );
    }

    #[test]
    fn test_rip_all_titles() {
        let spec = rip_command(1, None, Path::new("/rips"), 0);
        assert_eq!(spec.args[4], "all");
        assert_eq!(spec.args[3], "disc:1");
    }

    #[test]
    fn test_info_command() {
        assert_eq!(info_command(2).display(), "makemkvcon -r info disc:2");
    }
}
