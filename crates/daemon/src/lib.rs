//! Video Encoder Daemon
//!
//! Background service that discovers video sources and optical discs, rips
//! and encodes them one job at a time, and exposes job status and control
//! over HTTP.

pub mod classify;
pub mod control;
pub mod daemon;
pub mod disc_info;
pub mod encode;
pub mod engine;
pub mod governor;
pub mod job_store;
pub mod jobs;
pub mod markers;
pub mod optical;
pub mod probe;
pub mod process;
pub mod progress;
pub mod relocate;
pub mod scan;
pub mod server;
pub mod stability;
pub mod startup;
pub mod title_select;

pub use video_encoder_config as config;
pub use video_encoder_config::Config;
pub use classify::{MediaKind, SourceKey};
pub use control::{Control, ControlError, DiscInfoReply};
pub use daemon::{Daemon, DaemonError};
pub use disc_info::{parse as parse_disc_info, DiscInfo, DiscType, DriveInfo, Title};
pub use engine::Engine;
pub use governor::{GovernorStatus, ScanGovernor};
pub use job_store::{Decision, JobStore, RipMode, RipRequest, StatusSnapshot, StopOutcome, StoreError};
pub use jobs::{Event, EventLevel, Job, JobState};
pub use process::{CommandSpec, LaunchError, Launcher, ProcessExit, SystemLauncher};
pub use server::{create_router, run_server, ServerError};
pub use title_select::{select_titles, AutoRipQueue};
