//! Daemon startup and main loop
//!
//! Wires the store, governor, engine and control surface together and runs
//! the scan-and-process cycle.

use crate::config::{Config, ConfigError};
use crate::control::Control;
use crate::engine::Engine;
use crate::governor::ScanGovernor;
use crate::job_store::JobStore;
use crate::probe::{BitrateProbe, FfprobeProbe};
use crate::process::{Launcher, SystemLauncher};
use crate::scan::LibraryScanner;
use crate::server::{run_server, ServerError};
use crate::startup::run_startup_checks;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control server error
    #[error("{0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    config: Config,
    store: Arc<JobStore>,
    engine: Arc<Engine>,
    control: Arc<Control>,
    scanner: LibraryScanner,
}

impl Daemon {
    /// Load `config_path`, check for the external tools and build the daemon.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        Ok(Self::start(Config::load(config_path)?))
    }

    /// Build from an already loaded config and check for the external tools.
    pub fn start(config: Config) -> Self {
        let daemon = Self::with_config(config);
        run_startup_checks(&daemon.config, &daemon.store);
        daemon
    }

    /// Build with the real process launcher and ffprobe.
    pub fn with_config(config: Config) -> Self {
        Self::with_collaborators(config, Arc::new(SystemLauncher::new()), Arc::new(FfprobeProbe))
    }

    /// Build with explicit collaborators; tools are not checked.
    pub fn with_collaborators(
        config: Config,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn BitrateProbe>,
    ) -> Self {
        let governor = Arc::new(ScanGovernor::new(Duration::from_secs(
            config.disc.min_scan_interval_secs,
        )));
        let store = Arc::new(JobStore::from_config(&config.status, governor));
        let engine = Arc::new(Engine::new(config.clone(), store.clone(), launcher, probe));
        let control = Arc::new(Control::new(engine.clone()));
        let scanner = LibraryScanner::from_config(&config);

        Self {
            config,
            store,
            engine,
            control,
            scanner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<JobStore> {
        self.store.clone()
    }

    pub fn control(&self) -> Arc<Control> {
        self.control.clone()
    }

    /// One cycle: refresh disc info if due, discover sources, process them.
    pub async fn run_pass(&mut self) -> usize {
        self.engine.drive().refresh_if_due().await;
        let found = self.scanner.scan();
        if !found.is_empty() {
            log::debug!("Discovered {} candidate source(s)", found.len());
        }
        self.engine.run_pass(&found).await
    }

    /// Run passes until interrupted, waiting between them for the rescan
    /// interval or a control request that needs the engine.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        let interval = Duration::from_secs(self.config.scan.rescan_interval_secs);
        let wake = self.engine.waker();
        log::info!(
            "Watching {} root(s), rescanning every {}s",
            self.scanner.options().roots.len(),
            interval.as_secs()
        );

        loop {
            let processed = self.run_pass().await;
            if processed > 0 {
                log::info!("Pass finished: {} job(s) processed", processed);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {
                    log::debug!("Woken by control request");
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupt received, shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Start the control server, then run the main loop.
    ///
    /// A server that fails to bind stops the daemon.
    pub async fn run_with_server(mut self) -> Result<(), DaemonError> {
        let control = self.control.clone();
        let bind = self.config.status.bind.clone();
        let port = self.config.status.port;
        let server = tokio::spawn(async move { run_server(control, &bind, port).await });

        tokio::select! {
            result = server => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        log::error!("Control server stopped: {}", e);
                        Err(e.into())
                    }
                    Err(e) => {
                        log::error!("Control server task failed: {}", e);
                        Ok(())
                    }
                }
            }
            result = self.run() => result,
        }
    }
}
