//! Encoder command lines built from configured profiles.

use crate::process::CommandSpec;
use std::path::{Path, PathBuf};
use video_encoder_config::EncoderProfile;

/// Inputs for one encode.
#[derive(Debug, Clone)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub audio_langs: &'a [String],
    pub subtitle_langs: &'a [String],
}

/// Expand `{input}`, `{output}`, `{audio_langs}` and `{subtitle_langs}` in
/// the profile's arguments.
///
/// Placeholders may appear inside a larger argument (`-map=0:{input}`).
/// Language lists are comma-joined; an empty list expands to `und`.
pub fn build_command(profile: &EncoderProfile, request: &EncodeRequest<'_>) -> CommandSpec {
    let input = request.input.to_string_lossy();
    let output = request.output.to_string_lossy();
    let audio = join_langs(request.audio_langs);
    let subs = join_langs(request.subtitle_langs);

    let args = profile
        .args
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{audio_langs}", &audio)
                .replace("{subtitle_langs}", &subs)
        })
        .collect();

    CommandSpec::new(profile.program.clone(), args).with_output(request.output.to_path_buf())
}

fn join_langs(langs: &[String]) -> String {
    let cleaned: Vec<&str> = langs
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if cleaned.is_empty() {
        "und".to_string()
    } else {
        cleaned.join(",")
    }
}

/// `<dir>/<name>.<profile extension>`
pub fn output_path(dir: &Path, name: &str, profile: &EncoderProfile) -> PathBuf {
    let ext = profile.extension.trim_start_matches('.');
    dir.join(format!("{}.{}", name, ext))
}
