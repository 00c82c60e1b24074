//! External process launching and supervision.
//!
//! Rippers and encoders are started through the `Launcher` trait, which hands
//! back a line stream (stdout and stderr merged), an exit receiver and a kill
//! token. `supervise` drives one process to completion or cancellation;
//! `capture` runs a short command under a timeout and keeps its output.

use crate::progress::LineSplitter;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How long to keep reading output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// File or directory the command is expected to produce.
    pub output: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output: None,
        }
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if arg.contains(' ') {
                parts.push(format!("'{}'", arg));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with a status code.
    Code(i32),
    /// Terminated by a signal it did not get from us.
    Signalled,
    /// Killed through the handle's kill token.
    Killed,
    /// The exit status could not be observed.
    Lost,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signalled => write!(f, "terminated by signal"),
            ProcessExit::Killed => write!(f, "killed"),
            ProcessExit::Lost => write!(f, "exit status unavailable"),
        }
    }
}

/// Errors starting a process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program is not installed or not on PATH.
    #[error("{0} not found; is it installed and in PATH?")]
    NotFound(String),

    #[error("failed to start {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A running process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Combined stdout and stderr, split into logical lines.
    pub lines: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<ProcessExit>,
    /// Cancel to kill the process.
    pub kill: CancellationToken,
}

/// Starts external commands.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line).await;
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    LaunchError::NotFound(spec.program.clone())
                } else {
                    LaunchError::Io {
                        program: spec.program.clone(),
                        source: e,
                    }
                }
            })?;

        let (line_tx, line_rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, line_tx));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_signal.cancelled() => None,
            };
            let exit = match waited {
                Some(Ok(status)) => match status.code() {
                    Some(code) => ProcessExit::Code(code),
                    None => ProcessExit::Signalled,
                },
                Some(Err(_)) => ProcessExit::Lost,
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    ProcessExit::Killed
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ProcessHandle {
            lines: line_rx,
            exit: exit_rx,
            kill,
        })
    }
}

/// Outcome of `supervise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervised {
    Exited(ProcessExit),
    /// Cancellation was requested; `exited` is false if the process outlived the grace period.
    Canceled { exited: bool },
}

enum Step {
    Cancel,
    Line(Option<String>),
    Exit(ProcessExit),
}

/// Stream a process's lines into `on_line` until it exits or `cancel` fires.
///
/// On cancellation the process is killed and given `grace` to exit.
pub async fn supervise<F>(
    handle: ProcessHandle,
    cancel: &CancellationToken,
    grace: Duration,
    mut on_line: F,
) -> Supervised
where
    F: FnMut(&str),
{
    let ProcessHandle {
        mut lines,
        mut exit,
        kill,
    } = handle;
    let mut lines_open = true;

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancel,
            line = lines.recv(), if lines_open => Step::Line(line),
            status = &mut exit => Step::Exit(status.unwrap_or(ProcessExit::Lost)),
        };

        match step {
            Step::Cancel => {
                kill.cancel();
                let exited = tokio::time::timeout(grace, &mut exit).await.is_ok();
                return Supervised::Canceled { exited };
            }
            Step::Line(Some(line)) => on_line(&line),
            Step::Line(None) => lines_open = false,
            Step::Exit(status) => {
                if lines_open {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                        while let Some(line) = lines.recv().await {
                            on_line(&line);
                        }
                    })
                    .await;
                }
                return Supervised::Exited(status);
            }
        }
    }
}

/// Output of `capture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub output: String,
    /// None when the command was killed at the deadline.
    pub exit: Option<ProcessExit>,
    pub timed_out: bool,
}

/// Run a command to completion, collecting its output.
///
/// On timeout the process is killed and whatever it printed so far is
/// returned with `timed_out` set.
pub async fn capture(
    launcher: &dyn Launcher,
    spec: &CommandSpec,
    timeout: Duration,
) -> Result<Captured, LaunchError> {
    let ProcessHandle {
        mut lines,
        mut exit,
        kill,
    } = launcher.launch(spec)?;
    let mut collected: Vec<String> = Vec::new();
    let mut lines_open = true;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    enum CaptureStep {
        Deadline,
        Line(Option<String>),
        Exit(ProcessExit),
    }

    loop {
        let step = tokio::select! {
            biased;
            line = lines.recv(), if lines_open => CaptureStep::Line(line),
            status = &mut exit => CaptureStep::Exit(status.unwrap_or(ProcessExit::Lost)),
            _ = &mut deadline => CaptureStep::Deadline,
        };

        match step {
            CaptureStep::Line(Some(line)) => collected.push(line),
            CaptureStep::Line(None) => lines_open = false,
            CaptureStep::Exit(status) => {
                if lines_open {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                        while let Some(line) = lines.recv().await {
                            collected.push(line);
                        }
                    })
                    .await;
                }
                return Ok(Captured {
                    output: collected.join("\n"),
                    exit: Some(status),
                    timed_out: false,
                });
            }
            CaptureStep::Deadline => {
                log::warn!("{} timed out after {}s", spec.program, timeout.as_secs());
                kill.cancel();
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut exit).await;
                while let Ok(line) = lines.try_recv() {
                    collected.push(line);
                }
                return Ok(Captured {
                    output: collected.join("\n"),
                    exit: None,
                    timed_out: true,
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory launcher.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// What one launch of a fake program does.
    #[derive(Debug, Clone, Default)]
    pub struct FakeScript {
        pub lines: Vec<String>,
        /// Exit code, or None to run until killed.
        pub exit: Option<i32>,
        /// Files created (with some content) before exiting.
        pub writes: Vec<PathBuf>,
        pub not_found: bool,
    }

    impl FakeScript {
        pub fn exits(code: i32) -> Self {
            Self {
                exit: Some(code),
                ..Self::default()
            }
        }

        pub fn hangs() -> Self {
            Self::default()
        }

        pub fn missing() -> Self {
            Self {
                not_found: true,
                ..Self::default()
            }
        }

        pub fn with_lines(mut self, lines: &[&str]) -> Self {
            self.lines = lines.iter().map(|l| l.to_string()).collect();
            self
        }

        pub fn writing(mut self, path: PathBuf) -> Self {
            self.writes.push(path);
            self
        }
    }

    /// Launcher that plays back scripts per program name.
    #[derive(Default)]
    pub struct FakeLauncher {
        scripts: Mutex<HashMap<String, VecDeque<FakeScript>>>,
        pub launched: Mutex<Vec<CommandSpec>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, program: &str, script: FakeScript) {
            self.scripts
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(script);
        }

        pub fn launched_programs(&self) -> Vec<String> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.program.clone())
                .collect()
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&spec.program)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| FakeScript::exits(0));
            if script.not_found {
                return Err(LaunchError::NotFound(spec.program.clone()));
            }
            self.launched.lock().unwrap().push(spec.clone());

            let (line_tx, line_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = oneshot::channel();
            let kill = CancellationToken::new();
            let killed = kill.clone();

            tokio::spawn(async move {
                for line in script.lines {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                for path in &script.writes {
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let _ = std::fs::write(path, vec![0u8; 2048]);
                }
                drop(line_tx);
                let exit = match script.exit {
                    Some(code) => ProcessExit::Code(code),
                    None => {
                        killed.cancelled().await;
                        ProcessExit::Killed
                    }
                };
                let _ = exit_tx.send(exit);
            });

            Ok(ProcessHandle {
                lines: line_rx,
                exit: exit_rx,
                kill,
            })
        }
    }
}
