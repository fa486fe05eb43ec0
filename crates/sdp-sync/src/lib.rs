//! Configuration and the refresh/fallback orchestration shared by the CLI and web surfaces.

pub mod config;
pub mod service;

pub use config::{AppConfig, PipelineSettings, DEFAULT_SETTINGS_FILE};
pub use service::{maybe_build_scheduler, DataService, ServiceStatus};

pub const CRATE_NAME: &str = "sdp-sync";
