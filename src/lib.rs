//! LoRa FUOTA: end-device session orchestration for firmware updates over LoRaWAN
//!
//! This library drives a class A device through the application layer clock
//! synchronization, remote multicast setup and fragmented data block transport
//! packages, switches it to class C for multicast windows, and reassembles
//! the fragments into a firmware image in a block store.

pub mod core;
pub mod network;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, Result};
pub use crate::network::{LoRaRadio, RadioEvent};
pub use crate::session::{AppEvent, Device, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
