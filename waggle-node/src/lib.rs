//! Waggle node agent library
//!
//! Broker topology management for an edge node: shovels to beehive,
//! per-plugin identities and the desired-state pass that ties them to
//! the running containers. The binary entry point is in main.rs.

pub mod config;
pub mod error;
pub mod execution;
pub mod images;
pub mod provisioner;
pub mod readiness;
pub mod reconciler;
pub mod report;
pub mod shovels;

pub use error::{BatchReport, Error, Result};
