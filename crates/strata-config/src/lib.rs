//! Configuration for the strata volume tools.
//!
//! Settings persist to disk as a RON file (`config.ron`) and can be
//! overridden from the command line via clap. Missing sections and fields
//! fall back to defaults, so older config files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, DebugConfig, DemoConfig, RegionConfig, VolumeConfig, default_config_dir,
};
pub use error::ConfigError;
