//! CLI Commands

pub mod revert;
pub mod target;
