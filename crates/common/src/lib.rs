//! Livefire Common Library
//!
//! Snapshot-based VM reset against a remote hypervisor management endpoint,
//! plus the shared types, configuration and persistence used by the admin
//! service and CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod hypervisor;
pub mod revert;
pub mod snapshot;
pub mod task;
pub mod types;
pub mod vsphere;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

// Re-export commonly used types
pub use config::LivefireConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use hypervisor::{HypervisorConnector, HypervisorSession};
pub use revert::{RevertOptions, SnapshotRevert};
pub use types::*;
pub use vsphere::VsphereConnector;

/// Livefire version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".livefire")
}

/// Default config file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
