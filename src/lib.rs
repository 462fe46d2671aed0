//! stoke: cluster node deployment.
//!
//! Resolves a cluster type's configuration questions, tracks every node's
//! deployment state, and runs the external provisioning jobs that apply or
//! remove node identities.

pub mod config;
pub mod domain;
pub mod error;
pub mod hostrange;
pub mod inventory;
pub mod logging;
pub mod process;
pub mod prompt;
pub mod store;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
