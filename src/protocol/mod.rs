//! Control-package codecs
//!
//! Each codec parses a downlink for its port and produces at most one answer.
//! A payload may chain several commands; answers are concatenated. Commands
//! are decoded in full before any of them is applied, so a truncated command
//! leaves the package state untouched.

pub mod clock_sync;
pub mod compliance;
pub mod fragmentation;
pub mod multicast;

pub use self::clock_sync::ClockSyncControl;
pub use self::compliance::{ComplianceMode, ComplianceTest, ComplianceUplink};
pub use self::fragmentation::{CompletedSession, FragResponse, FragmentationControl};
pub use self::multicast::{ClassCSessionRequest, MulticastCallbacks, MulticastControl};

use bytes::Buf;

use crate::core::{Error, Result};

/// Package version answers carry `CID 0x00 | package id | version`
pub const PACKAGE_VERSION: u8 = 1;

/// Command identifier shared by every package for its version request
pub const PACKAGE_VERSION_REQ: u8 = 0x00;

/// Fails unless `buf` holds `len` more bytes of `command`
fn ensure(buf: &[u8], len: usize, command: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::protocol(format!(
            "{} truncated: {} of {} bytes",
            command,
            buf.remaining(),
            len
        )));
    }
    Ok(())
}
