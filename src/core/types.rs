use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Receive windows only after an uplink
    A,
    /// Receiver kept open continuously
    C,
}

/// Delivery mode of an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgFlags {
    Unconfirmed,
    Confirmed,
}

/// Flags reported with a received downlink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxFlags {
    /// Network server asked for an acknowledgement
    pub confirmed: bool,
    /// Frame was addressed to a multicast group
    pub multicast: bool,
}

/// Metadata of the last received frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RxMetadata {
    /// Address the frame was sent to (own DevAddr or a multicast address)
    pub device_address: u32,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: i8,
}

/// Well-known application ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Ordinary application traffic and magic markers
    pub app: u8,
    /// Application layer clock synchronization
    pub clock_sync: u8,
    /// Remote multicast setup
    pub multicast: u8,
    /// Fragmented data block transport
    pub fragmentation: u8,
    /// Certification test responder
    pub compliance: u8,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            app: 15,
            clock_sync: 202,
            multicast: 200,
            fragmentation: 201,
            compliance: super::COMPLIANCE_TEST_PORT,
        }
    }
}

/// Sizing of the reassembly block store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Number of blocks in the region
    pub block_count: usize,
    /// Maximum number of parity fragments buffered per session
    pub redundancy: usize,
    /// Byte offset where the reassembled image starts
    pub write_offset: usize,
}

impl StorageConfig {
    /// Total bytes in the region
    pub fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            block_size: 512,
            block_count: 16,
            redundancy: 40,
            write_offset: 0,
        }
    }
}

/// Over-the-air activation credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaaCredentials {
    #[serde(serialize_with = "super::serde::serialize_hex")]
    #[serde(deserialize_with = "super::serde::deserialize_hex")]
    pub dev_eui: [u8; 8],
    #[serde(serialize_with = "super::serde::serialize_hex")]
    #[serde(deserialize_with = "super::serde::deserialize_hex")]
    pub app_eui: [u8; 8],
    #[serde(serialize_with = "super::serde::serialize_hex")]
    #[serde(deserialize_with = "super::serde::deserialize_hex")]
    pub app_key: [u8; 16],
    /// Join request attempts before the stack reports a failure
    pub nb_trials: u8,
}

/// Configuration for the end-device session layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ports: PortConfig,
    /// Cadence of the keep-alive uplink
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub keep_alive_period: Duration,
    /// Payload of the keep-alive uplink
    pub keep_alive_payload: String,
    /// Largest payload ever handed to `send`
    pub max_payload: usize,
    pub confirmed_msg_retries: u8,
    /// Compliance testing requires duty cycling to be off
    pub duty_cycle_on: bool,
    /// RX2 frequency restored when a class C window closes
    pub default_rx2_frequency: u32,
    pub storage: StorageConfig,
    /// Only fragmentation sessions carrying this descriptor are accepted
    pub expected_descriptor: Option<u32>,
    /// Credentials used when a rejoin is triggered; `None` leaves them to the stack
    pub otaa: Option<OtaaCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ports: PortConfig::default(),
            keep_alive_period: Duration::from_millis(5000),
            keep_alive_payload: "ANY_16_BYTE_LONG".to_string(),
            max_payload: super::MAX_PHY_PAYLOAD,
            confirmed_msg_retries: 3,
            duty_cycle_on: false,
            default_rx2_frequency: 869_525_000,
            storage: StorageConfig::default(),
            expected_descriptor: None,
            otaa: None,
        }
    }
}

impl Config {
    /// Checks that the configuration is consistent
    pub fn validate(&self) -> Result<()> {
        let ports = [
            self.ports.app,
            self.ports.clock_sync,
            self.ports.multicast,
            self.ports.fragmentation,
            self.ports.compliance,
        ];
        if ports.iter().any(|p| *p == 0 || *p > super::COMPLIANCE_TEST_PORT) {
            return Err(Error::config("Ports must be within 1..=224"));
        }
        if ports.iter().collect::<HashSet<_>>().len() != ports.len() {
            return Err(Error::config("Ports must be distinct"));
        }

        if self.max_payload == 0 || self.max_payload > super::MAX_PHY_PAYLOAD {
            return Err(Error::config(format!(
                "max_payload must be within 1..={}",
                super::MAX_PHY_PAYLOAD
            )));
        }
        if self.keep_alive_period.is_zero() {
            return Err(Error::config("Keep-alive period must be non-zero"));
        }
        if self.keep_alive_payload.is_empty() || self.keep_alive_payload.len() > self.max_payload {
            return Err(Error::config("Keep-alive payload must fit in max_payload"));
        }

        if self.storage.block_size == 0 || self.storage.block_count == 0 {
            return Err(Error::config("Block store must have a non-zero size"));
        }
        if self.storage.write_offset >= self.storage.capacity() {
            return Err(Error::config("Write offset lies outside the block store"));
        }

        Ok(())
    }
}
