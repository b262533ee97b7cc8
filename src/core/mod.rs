//! Core types and traits for the FUOTA session layer
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    Config,
    DeviceClass,
    MsgFlags,
    OtaaCredentials,
    PortConfig,
    RxFlags,
    RxMetadata,
    StorageConfig,
};

/// Largest application payload the LoRaMAC layer accepts
pub const MAX_PHY_PAYLOAD: usize = 242;

/// Port reserved for the certification test responder
pub const COMPLIANCE_TEST_PORT: u8 = 224;

/// Highest port carrying ordinary application traffic
pub const MAX_APP_PORT: u8 = 223;

/// Marker sent before the clock sync exchange
pub const CLOCK_SYNC_MAGIC: [u8; 4] = *b"CLKS";

/// Marker sent before the multicast setup exchange
pub const MULTICAST_MAGIC: [u8; 4] = *b"MCST";

/// Marker sent before the fragmentation exchange
pub const FRAGMENTATION_MAGIC: [u8; 4] = *b"FRAG";
