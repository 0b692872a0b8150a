//! Livefire Admin Service
//!
//! HTTP front end for the snapshot revert operation: maps revert targets to
//! VMs, serializes work per VM and keeps a revert history.

pub mod auth;
pub mod locks;
pub mod server;

pub use auth::AdminAuth;
pub use locks::VmLocks;
pub use server::{WebServer, WebServerConfig};
