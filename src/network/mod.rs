//! Radio/MAC façade
//!
//! The LoRaWAN stack (join, ADR, duty cycle, retransmission, encryption) lives
//! behind [`LoRaRadio`]. The session layer only sees connect/send/receive,
//! class switching and the GPS clock, plus the events the stack posts through
//! an [`EventSender`].

mod register;

#[cfg(test)]
pub(crate) mod mock;

pub use self::register::{McGroup, MulticastRegister, MAX_MULTICAST_GROUPS};

use thiserror::Error;

use crate::core::{DeviceClass, MsgFlags, OtaaCredentials, RxFlags, RxMetadata};
use crate::session::EventSender;

/// Status codes reported by the LoRaWAN stack
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    #[error("operation would block")]
    WouldBlock,
    #[error("stack busy")]
    Busy,
    #[error("invalid parameter")]
    ParameterInvalid,
    #[error("no active session")]
    NoActiveSessions,
    #[error("stack not initialized")]
    NotInitialized,
    #[error("not joined to a network")]
    NoNetworkJoined,
    #[error("data rate not supported")]
    DatarateInvalid,
    #[error("frequency not supported")]
    FrequencyInvalid,
    #[error("payload length error")]
    LengthError,
    #[error("crypto failure")]
    CryptoFail,
    #[error("timed out")]
    Timeout,
    #[error("unsupported")]
    Unsupported,
    #[error("status code {0}")]
    Status(i16),
}

/// Events posted by the LoRaWAN stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Connected,
    Disconnected,
    TxDone,
    TxTimeout,
    TxError,
    TxCryptoError,
    TxSchedulingError,
    RxDone,
    RxTimeout,
    RxError,
    JoinFailure,
    UplinkRequired,
}

/// Outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Already connected (ABP or an existing session)
    Connected,
    /// Join procedure started; `RadioEvent::Connected` follows
    InProgress,
}

/// A frame copied out of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the caller's buffer
    pub len: usize,
    pub port: u8,
    pub flags: RxFlags,
}

/// Device notion of GPS time, in seconds since the GPS epoch
pub trait GpsClock {
    fn current_gps_time(&self) -> u32;
    fn set_current_gps_time(&mut self, gps_seconds: u32);
}

/// The LoRaWAN stack as seen by the session layer
pub trait LoRaRadio: GpsClock {
    /// Initializes the stack and registers where its events go
    fn initialize(&mut self, events: EventSender) -> Result<(), RadioError>;

    fn set_confirmed_msg_retries(&mut self, retries: u8) -> Result<(), RadioError>;

    fn enable_adaptive_datarate(&mut self) -> Result<(), RadioError>;

    fn disable_adaptive_datarate(&mut self) -> Result<(), RadioError>;

    /// Connects using the given credentials, or the stack's own configuration
    fn connect(&mut self, otaa: Option<&OtaaCredentials>) -> Result<ConnectStatus, RadioError>;

    fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Schedules an uplink; returns the number of bytes accepted
    fn send(&mut self, port: u8, payload: &[u8], flags: MsgFlags) -> Result<usize, RadioError>;

    /// Copies the pending downlink into `buf`
    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, RadioError>;

    /// Drops any uplink still waiting for transmission
    fn cancel_sending(&mut self) -> Result<(), RadioError>;

    fn set_device_class(&mut self, class: DeviceClass) -> Result<(), RadioError>;

    fn set_datarate(&mut self, data_rate: u8) -> Result<(), RadioError>;

    fn set_rx2_frequency(&mut self, frequency: u32) -> Result<(), RadioError>;

    /// Regional check for a multicast downlink channel
    fn verify_multicast_freq_and_dr(&self, frequency: u32, data_rate: u8) -> Result<(), RadioError>;

    fn multicast_register(&self) -> MulticastRegister;

    fn set_multicast_register(&mut self, register: MulticastRegister);

    fn rx_metadata(&self) -> RxMetadata;
}
