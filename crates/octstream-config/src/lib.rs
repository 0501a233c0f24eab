//! Configuration for the octstream server.
//!
//! Settings persist to disk as `config.ron`, missing fields fall back to
//! defaults, and command-line flags override whatever was loaded.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, StreamingConfig, default_config_dir};
pub use error::ConfigError;
