//! Configuration for the video encoder daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the loaded values.

pub mod config;

pub use config::*;
