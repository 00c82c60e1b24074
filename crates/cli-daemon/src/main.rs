//! CLI entry point for the video encoder daemon
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use env_logger::{Env, Target};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use video_encoder_daemon::{Config, Daemon};

/// Video encoder daemon - rips discs and encodes media libraries unattended
#[derive(Parser, Debug)]
#[command(name = "video-encoderd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level regardless of RUST_LOG
    #[arg(short, long)]
    verbose: bool,
}

/// Log to `log_file` when set (appending), otherwise to stderr.
fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    let mut open_error = None;
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => open_error = Some(e),
        }
    }
    builder.format_timestamp_secs().init();
    if let (Some(path), Some(e)) = (log_file, open_error) {
        log::warn!("Cannot open log file {}: {}; logging to stderr", path.display(), e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(args.verbose, None);
            log::error!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(args.verbose, config.status.log_file.as_deref());

    log::info!("Video encoder daemon starting");
    log::info!("Config file: {}", args.config.display());

    let daemon = Daemon::start(config);

    let status = &daemon.config().status;
    log::info!(
        "Control API on http://{}:{}/api/status",
        status.bind,
        status.port
    );

    if let Err(e) = daemon.run_with_server().await {
        log::error!("Daemon error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
