//! Livefire CLI
//!
//! Runs snapshot reverts directly against the hypervisor, or drives the
//! admin service's revert targets.

pub mod client;
pub mod commands;
pub mod output;
