//! Job lifecycle engine.
//!
//! One pass gathers work (retries, a pending rip request, confirmed jobs,
//! an unattended disc rip, then newly discovered sources) and processes it
//! strictly one job at a time. Each job runs the same steps: skip if already
//! encoded, skip if stopped, apply the low-bitrate policy, rip if the source
//! is a disc, encode with one fallback attempt, then move and clean up.

use crate::classify::{destination_name, media_kind, rip_name, MediaKind, SourceKey};
use crate::disc_info::{DiscInfo, DiscType};
use crate::encode::{build_command, output_path, rip_command, EncodeRequest};
use crate::job_store::{Decision, JobStore, RipMode};
use crate::jobs::{EventLevel, JobState};
use crate::markers;
use crate::optical::OpticalDrive;
use crate::probe::BitrateProbe;
use crate::process::{supervise, CommandSpec, LaunchError, Launcher, ProcessExit, Supervised};
use crate::progress::apply_line;
use crate::relocate::{delete_with_sidecars, safe_move};
use crate::title_select::{disc_identity, select_titles, AutoRipQueue};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use video_encoder_config::{Config, EncoderProfile};

/// Why a job stopped short of the success path.
#[derive(Debug)]
enum Halt {
    /// Cancellation observed; finalize as canceled.
    Canceled,
    /// Finalize as error.
    Failed(String),
    /// Finalize as success without encoding.
    Skipped(String),
    /// Finalize as canceled by policy.
    Declined(String),
    /// Left in `confirm`; nothing to record.
    Parked,
}

/// A ripped file and the output name it will be encoded to.
#[derive(Debug, Clone)]
struct Ripped {
    file: PathBuf,
    name: String,
}

/// Per-job working state.
struct Run<'a> {
    key: &'a str,
    source: SourceKey,
    kind: MediaKind,
    token: CancellationToken,
    /// Partial outputs and rip directories removed if the job is canceled.
    scratch: Vec<PathBuf>,
}

/// Drives discovered sources through their lifecycle.
pub struct Engine {
    config: Config,
    store: Arc<JobStore>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn BitrateProbe>,
    drive: Arc<OpticalDrive>,
    wake: Arc<Notify>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<JobStore>,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn BitrateProbe>,
    ) -> Self {
        let drive = Arc::new(OpticalDrive::from_config(
            &config.disc,
            store.clone(),
            launcher.clone(),
        ));
        Self {
            config,
            store,
            launcher,
            probe,
            drive,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn drive(&self) -> &Arc<OpticalDrive> {
        &self.drive
    }

    /// Handle used to cut the wait between passes short.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.disc.cancel_grace_secs)
    }

    /// Process everything that is due, one job at a time.
    ///
    /// Returns the number of jobs that were looked at.
    pub async fn run_pass(&self, discovered: &[PathBuf]) -> usize {
        let mut work: Vec<(String, RipMode)> = Vec::new();
        let push = |work: &mut Vec<(String, RipMode)>, key: String, mode: RipMode| {
            if !work.iter().any(|(k, _)| *k == key) {
                work.push((key, mode));
            }
        };

        for key in self.store.take_retries() {
            push(&mut work, key, RipMode::Manual);
        }
        if let Some(request) = self.store.take_rip_request() {
            push(&mut work, request.source, request.mode);
        }
        for key in self.store.confirmed_keys() {
            push(&mut work, key, RipMode::Manual);
        }
        if let Some(key) = self.auto_rip_candidate() {
            push(&mut work, key, RipMode::Auto);
        }
        for path in discovered {
            let key = path.to_string_lossy().into_owned();
            if self.store.is_settled(&key) || self.store.is_active(&key) {
                continue;
            }
            push(&mut work, key, RipMode::Manual);
        }

        for (key, mode) in &work {
            self.process(key, *mode).await;
        }
        work.len()
    }

    /// `disc:<n>` when unattended ripping is on and the inserted disc still
    /// has titles to rip.
    fn auto_rip_candidate(&self) -> Option<String> {
        if !self.config.disc.auto_rip || self.store.governor().is_paused() {
            return None;
        }
        let info = self.store.disc_info()?;
        if !self.store.disc_present() || !info.has_titles() || info.scan_pending {
            return None;
        }
        let index = self.drive.current_index().unwrap_or(0);
        let key = format!("disc:{}", index);
        if self.store.is_active(&key) {
            return None;
        }
        match self.store.auto_rip_queue(&disc_identity(&info, index)) {
            Some(queue) if queue.complete => None,
            _ => Some(key),
        }
    }

    /// Run one job to a terminal state (or park it in `confirm`).
    pub async fn process(&self, key: &str, mode: RipMode) {
        let source = SourceKey::parse(key);
        let kind = media_kind(&source);
        let destination = match kind {
            MediaKind::Disc => None,
            _ => Some(output_path(
                &self.config.paths.output_dir,
                &destination_name(&source),
                self.profile_for(kind, None),
            )),
        };

        let ticket = self
            .store
            .start(key, destination.clone(), Some(kind.to_string()), JobState::Queued);
        let resumed = if ticket.created {
            false
        } else {
            let parked = self.store.job(key).map(|j| j.state) == Some(JobState::Confirm);
            if !parked || self.store.decision(key) != Some(Decision::Proceed) {
                return;
            }
            true
        };

        let mut run = Run {
            key,
            source,
            kind,
            token: ticket.token,
            scratch: Vec::new(),
        };

        let result = self.execute(&mut run, mode, destination, resumed).await;
        match result {
            Ok((dest, message)) => {
                self.store.complete(key, true, Some(dest), message);
            }
            Err(Halt::Canceled) => {
                self.cleanup(&run);
                self.store.cancel_complete(key, "canceled by user");
            }
            Err(Halt::Failed(message)) => {
                self.store.complete(key, false, None, message);
            }
            Err(Halt::Skipped(message)) => {
                self.store.complete(key, true, None, message);
            }
            Err(Halt::Declined(message)) => {
                self.store.cancel_complete(key, message);
            }
            Err(Halt::Parked) => {}
        }
    }

    async fn execute(
        &self,
        run: &mut Run<'_>,
        mode: RipMode,
        destination: Option<PathBuf>,
        resumed: bool,
    ) -> Result<(PathBuf, String), Halt> {
        if !resumed {
            if let Some(dest) = &destination {
                if dest.exists() {
                    log::info!("Skipping already-encoded source {}", run.key);
                    return Err(Halt::Skipped("skipped, already encoded".to_string()));
                }
            }
            if let Some(path) = run.source.as_path() {
                if markers::has_stopped_marker(path) {
                    return Err(Halt::Failed("skipped: stopped marker present".to_string()));
                }
            }
            self.advance(run, JobState::Starting)?;
            self.bitrate_gate(run).await?;
        }

        if run.kind.needs_rip() {
            let ripped = self.rip(run, mode).await?;
            self.encode_ripped(run, ripped).await
        } else {
            let input = match run.source.as_path() {
                Some(path) => path.to_path_buf(),
                None => return Err(Halt::Failed("source is not a file".to_string())),
            };
            let output = destination
                .ok_or_else(|| Halt::Failed("no destination for source".to_string()))?;
            let profile = self.profile_for(run.kind, None);
            self.advance(run, JobState::Running)?;
            let message = self.encode(run, &input, &output, profile).await?;
            let placed = self.place_output(run.key, &output);
            self.finish_source(run, &input);
            Ok((placed, message))
        }
    }

    fn advance(&self, run: &Run<'_>, state: JobState) -> Result<(), Halt> {
        if run.token.is_cancelled() {
            return Err(Halt::Canceled);
        }
        self.store
            .set_state(run.key, state)
            .map_err(|e| Halt::Failed(e.to_string()))
    }

    fn profile_for(&self, kind: MediaKind, disc_type: Option<DiscType>) -> &EncoderProfile {
        match (kind, disc_type) {
            (MediaKind::File, _) => &self.config.encode.file_profile,
            (MediaKind::DvdFolder, _) | (MediaKind::Disc, Some(DiscType::Dvd)) => {
                &self.config.encode.dvd_profile
            }
            _ => &self.config.encode.bluray_profile,
        }
    }

    fn is_staged(&self, path: &Path) -> bool {
        is_staged(&self.config, path)
    }

    /// Low-bitrate policy for plain files.
    async fn bitrate_gate(&self, run: &Run<'_>) -> Result<(), Halt> {
        let Some(target) = self.config.encode.target_bitrate_kbps else {
            return Ok(());
        };
        if run.kind != MediaKind::File || self.store.decision(run.key).is_some() {
            return Ok(());
        }
        let Some(path) = run.source.as_path() else {
            return Ok(());
        };

        let probe = self.probe.clone();
        let probe_path = path.to_path_buf();
        let bitrate = match tokio::task::spawn_blocking(move || probe.bitrate_kbps(&probe_path)).await {
            Ok(Ok(Some(kbps))) => kbps,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                log::warn!("Could not probe {}: {}", run.key, e);
                return Ok(());
            }
            Err(e) => {
                log::warn!("Probe task for {} failed: {}", run.key, e);
                return Ok(());
            }
        };
        if bitrate >= target {
            return Ok(());
        }

        let mismatch = format!(
            "source bitrate {} kbps is below target {} kbps",
            bitrate, target
        );
        let policy = &self.config.policy;
        if policy.low_bitrate_auto_skip {
            if self.is_staged(path) {
                remove_quietly(path);
                remove_quietly(&markers::origin_sidecar_path(path));
            }
            return Err(Halt::Declined(format!("auto-skipped: {}", mismatch)));
        }
        if policy.low_bitrate_auto_proceed {
            self.store.set_decision(run.key, Decision::Proceed);
            self.store.event(
                EventLevel::Info,
                format!("{}: {}; proceeding automatically", run.key, mismatch),
            );
            return Ok(());
        }

        self.advance(run, JobState::Confirm)?;
        let _ = self
            .store
            .set_message(run.key, format!("{}; confirm to proceed", mismatch));
        self.store.event(
            EventLevel::Warn,
            format!("{} awaiting confirmation: {}", run.key, mismatch),
        );
        Err(Halt::Parked)
    }

    /// Launch a command and stream it into the store until it exits or the
    /// job is canceled.
    async fn run_process(&self, run: &Run<'_>, spec: &CommandSpec) -> Result<ProcessExit, Halt> {
        log::info!("[{}] running {}", run.key, spec.display());
        let handle = self.launcher.launch(spec).map_err(|e| {
            let message = match &e {
                LaunchError::NotFound(_) => e.to_string(),
                LaunchError::Io { .. } => format!("could not start {}: {}", spec.program, e),
            };
            Halt::Failed(message)
        })?;

        let store = &self.store;
        let key = run.key;
        let outcome = supervise(handle, &run.token, self.grace(), |line| {
            log::debug!("[{}] {}", key, line);
            apply_line(store, key, line);
        })
        .await;

        match outcome {
            Supervised::Exited(exit) => {
                log::debug!("[{}] {} finished: {}", key, spec.program, exit);
                if run.token.is_cancelled() {
                    return Err(Halt::Canceled);
                }
                Ok(exit)
            }
            Supervised::Canceled { exited } => {
                if !exited {
                    log::warn!(
                        "[{}] {} did not exit within {}s of being killed",
                        key,
                        spec.program,
                        self.grace().as_secs()
                    );
                }
                Err(Halt::Canceled)
            }
        }
    }

    /// Encode `input` to `output`, retrying once with the fallback profile.
    async fn encode(
        &self,
        run: &mut Run<'_>,
        input: &Path,
        output: &Path,
        profile: &EncoderProfile,
    ) -> Result<String, Halt> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Halt::Failed(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        run.scratch.push(output.to_path_buf());
        let request = EncodeRequest {
            input,
            output,
            audio_langs: &self.config.policy.preferred_audio_langs,
            subtitle_langs: &self.config.policy.preferred_subtitle_langs,
        };

        let exit = self.run_process(run, &build_command(profile, &request)).await?;
        if exit.success() && has_output(output) {
            return Ok("encode complete".to_string());
        }
        let primary_failure = if exit.success() {
            format!("{} produced no output", profile.program)
        } else {
            format!("{} failed ({})", profile.program, exit)
        };

        let Some(fallback) = &self.config.encode.fallback_profile else {
            return Err(Halt::Failed(primary_failure));
        };
        self.store.event(
            EventLevel::Warn,
            format!(
                "{}: {}; trying fallback {}",
                run.key, primary_failure, fallback.program
            ),
        );
        remove_quietly(output);
        self.store.clear_eta(run.key);

        let exit = self.run_process(run, &build_command(fallback, &request)).await?;
        if exit.success() && has_output(output) {
            Ok("fallback encoder succeeded".to_string())
        } else {
            remove_quietly(output);
            Err(Halt::Failed(format!(
                "{}; fallback {} failed ({})",
                primary_failure, fallback.program, exit
            )))
        }
    }

    /// Rip the disc behind `run` while holding the drive.
    async fn rip(&self, run: &mut Run<'_>, mode: RipMode) -> Result<Vec<Ripped>, Halt> {
        let index = self
            .drive
            .resolve_index(&run.source)
            .ok_or_else(|| Halt::Failed("no disc detected".to_string()))?;
        let info = match self.store.disc_info() {
            Some(info) => Some(info),
            None => self.drive.scan(index, false).await.ok().flatten(),
        };
        let label = info.as_ref().and_then(|i| i.summary.label.clone());

        let auto = match mode {
            RipMode::Auto => {
                let info = info
                    .as_ref()
                    .ok_or_else(|| Halt::Failed("no disc information available".to_string()))?;
                Some(self.auto_rip_queue(info, index)?)
            }
            RipMode::Manual => None,
        };

        let governor = self.store.governor().clone();
        let permit = tokio::select! {
            biased;
            _ = run.token.cancelled() => return Err(Halt::Canceled),
            permit = governor.acquire(run.key) => permit,
        };
        self.advance(run, JobState::Ripping)?;

        let steps = auto
            .as_deref()
            .and_then(|identity| self.store.auto_rip_queue(identity))
            .map_or(1, |q| q.remaining.len());
        let mut ripped = Vec::new();
        let mut failures = Vec::new();
        let mut step = 0;
        loop {
            let title = match &auto {
                Some(identity) => match self.store.next_auto_rip_title(identity) {
                    Some(title) => Some(title),
                    None => break,
                },
                None if step == 0 => None,
                None => break,
            };
            self.store.begin_step(run.key, step, steps);
            step += 1;

            let name = match (run.kind, title) {
                (MediaKind::BlurayFolder, None) => destination_name(&run.source),
                _ => rip_name(label.as_deref(), title),
            };
            match self.rip_title(run, index, title, &name).await {
                Ok(files) => ripped.extend(files),
                Err(Halt::Canceled) => {
                    if let Some(identity) = &auto {
                        self.store.mark_auto_rip_complete(identity);
                    }
                    return Err(Halt::Canceled);
                }
                Err(Halt::Failed(message)) if auto.is_some() => {
                    self.store.event(EventLevel::Error, format!("{}: {}", run.key, message));
                    failures.push(message);
                }
                Err(other) => return Err(other),
            }
        }
        if let Some(identity) = &auto {
            self.store.mark_auto_rip_complete(identity);
        }
        drop(permit);

        if ripped.is_empty() {
            return Err(Halt::Failed(if failures.is_empty() {
                "rip produced no output file".to_string()
            } else {
                failures.join("; ")
            }));
        }
        Ok(ripped)
    }

    /// Identity of the disc's auto-rip queue, creating the queue on first use.
    fn auto_rip_queue(&self, info: &DiscInfo, index: u32) -> Result<String, Halt> {
        let identity = disc_identity(info, index);
        let selected = select_titles(
            &info.titles,
            self.config.disc.auto_rip_count,
            self.config.disc.min_title_secs,
        );
        let queue = self
            .store
            .ensure_auto_rip_queue(AutoRipQueue::new(identity.clone(), selected));
        if queue.complete {
            if queue.dispatched.is_empty() {
                self.store.mark_auto_rip_complete(&identity);
                return Err(Halt::Failed(format!(
                    "no titles of at least {}s on {}",
                    self.config.disc.min_title_secs, identity
                )));
            }
            return Err(Halt::Skipped(format!("{} already auto-ripped", identity)));
        }
        Ok(identity)
    }

    async fn rip_title(
        &self,
        run: &mut Run<'_>,
        index: u32,
        title: Option<u32>,
        name: &str,
    ) -> Result<Vec<Ripped>, Halt> {
        let dir = self.config.paths.rip_dir.join(name);
        if dir.exists() {
            let _ = fs::remove_dir_all(&dir);
        }
        fs::create_dir_all(&dir)
            .map_err(|e| Halt::Failed(format!("cannot create {}: {}", dir.display(), e)))?;
        run.scratch.push(dir.clone());

        let what = title.map_or_else(|| "all titles".to_string(), |t| format!("title {}", t));
        let _ = self.store.set_message(run.key, format!("ripping {}", what));

        let spec = rip_command(index, title, &dir, self.config.disc.min_title_secs);
        let exit = self.run_process(run, &spec).await?;
        if !exit.success() {
            return Err(Halt::Failed(format!("rip of {} failed ({})", what, exit)));
        }

        let files = ripped_files(&dir);
        match files.len() {
            0 => Err(Halt::Failed(format!("rip of {} produced no output file", what))),
            1 => Ok(vec![Ripped {
                file: files[0].clone(),
                name: name.to_string(),
            }]),
            _ => Ok(files
                .into_iter()
                .map(|file| {
                    let stem = file
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Ripped {
                        name: format!("{}_{}", name, stem),
                        file,
                    }
                })
                .collect()),
        }
    }

    /// Encode every ripped file, deleting each rip once it is encoded.
    async fn encode_ripped(
        &self,
        run: &mut Run<'_>,
        ripped: Vec<Ripped>,
    ) -> Result<(PathBuf, String), Halt> {
        let disc_type = self.store.disc_info().map(|i| i.disc_type);
        let profile = self.profile_for(run.kind, disc_type);
        self.advance(run, JobState::Running)?;

        let total = ripped.len();
        let mut last = None;
        let mut message = String::new();
        for (i, item) in ripped.iter().enumerate() {
            let output = output_path(&self.config.paths.output_dir, &item.name, profile);
            let _ = self.store.set_destination(run.key, output.clone());
            if output.exists() {
                log::info!("{} already encoded; skipping", output.display());
                message = "skipped, already encoded".to_string();
                last = Some(output);
                continue;
            }
            if total > 1 {
                let _ = self
                    .store
                    .set_message(run.key, format!("encoding {} of {}", i + 1, total));
            }
            let _ = self.store.set_rename(run.key, item.name.clone());
            self.store.begin_step(run.key, i, total);
            message = self.encode(run, &item.file, &output, profile).await?;
            last = Some(self.place_output(run.key, &output));
            remove_quietly(&item.file);
        }
        if let Some(parent) = ripped.first().and_then(|r| r.file.parent()) {
            let _ = fs::remove_dir(parent);
        }

        let dest = last.ok_or_else(|| Halt::Failed("nothing to encode".to_string()))?;
        if total > 1 {
            message = format!("{} ({} titles)", message, total);
        }
        Ok((dest, message))
    }

    /// Move the output into the final directory if one is configured.
    ///
    /// A placeholder stays at the output path so the source is still seen as
    /// encoded. A failed move leaves the output where it is.
    fn place_output(&self, key: &str, output: &Path) -> PathBuf {
        let Some(final_dir) = &self.config.paths.final_dir else {
            return output.to_path_buf();
        };
        let name = match self.store.job(key).and_then(|j| j.rename_to) {
            Some(stem) => {
                let mut name = OsString::from(stem);
                if let Some(ext) = output.extension() {
                    name.push(".");
                    name.push(ext);
                }
                name
            }
            None => match output.file_name() {
                Some(name) => name.to_os_string(),
                None => return output.to_path_buf(),
            },
        };
        let target = final_dir.join(name);
        match safe_move(output, &target) {
            Ok(()) => {
                if let Err(e) = fs::File::create(output) {
                    log::debug!("Could not leave placeholder at {}: {}", output.display(), e);
                }
                log::info!("Moved {} to {}", output.display(), target.display());
                target
            }
            Err(e) => {
                self.store
                    .event(EventLevel::Warn, format!("{}: final move failed: {}", key, e));
                output.to_path_buf()
            }
        }
    }

    /// Post-steps on the original after a successful encode.
    fn finish_source(&self, run: &Run<'_>, input: &Path) {
        match markers::mark_origin_encoded(input) {
            Ok(Some(origin)) => log::info!("Marked {} as encoded", origin.display()),
            Ok(None) => {}
            Err(e) => log::warn!("Could not mark origin of {}: {}", input.display(), e),
        }
        if self.config.encode.delete_original && run.kind == MediaKind::File {
            match delete_with_sidecars(input) {
                Ok(removed) => log::info!("Deleted {} original file(s) for {}", removed.len(), run.key),
                Err(e) => self
                    .store
                    .event(EventLevel::Warn, format!("{}: {}", run.key, e)),
            }
        }
    }

    fn cleanup(&self, run: &Run<'_>) {
        for path in &run.scratch {
            if path.is_dir() {
                if let Err(e) = fs::remove_dir_all(path) {
                    log::debug!("Could not remove {}: {}", path.display(), e);
                }
            } else {
                remove_quietly(path);
            }
        }
    }
}

/// Whether `path` is a working copy under one of the staging roots.
pub(crate) fn is_staged(config: &Config, path: &Path) -> bool {
    config
        .paths
        .staging_roots
        .iter()
        .any(|root| path.starts_with(root))
}

fn has_output(path: &Path) -> bool {
    fs::metadata(path).map_or(false, |m| m.is_file() && m.len() > 0)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Non-empty `.mkv` files in `dir`, by name.
fn ripped_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case("mkv"))
                && has_output(p)
        })
        .collect();
    files.sort();
    files
}
