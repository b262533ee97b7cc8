//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use tracing::Level;

use crate::core::{Error, Result};

/// Installs a console subscriber for the library's traces
///
/// Fails if the process already has a global subscriber.
pub fn setup_trace(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::init(format!("Failed to install trace subscriber: {}", e)))
}

/// Hex rendering of a payload for trace output
pub fn hex(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{:02x}", b)).collect()
}
