//! LoRaWAN certification test responder on port 224

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::core::MsgFlags;

const DEACTIVATE: u8 = 0x00;
const ACTIVATE: u8 = 0x01;
const CONFIRMED: u8 = 0x02;
const UNCONFIRMED: u8 = 0x03;
const ECHO: u8 = 0x04;
const TRIGGER_JOIN: u8 = 0x06;

/// Test mode selected by the test server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComplianceMode {
    /// No test running; keep-alive traffic goes to the application port
    #[default]
    Idle,
    Activated,
    Deactivated,
    Echo,
    DownlinkCounter,
    Confirmed,
    TriggerJoin,
}

/// What the next keep-alive tick should transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceUplink {
    /// Regular keep-alive on the application port
    KeepAlive,
    /// Test frame on the compliance port
    Send { payload: Bytes, flags: MsgFlags },
    /// Stay silent
    HangOn,
    /// Leave the network and join again over the air
    Rejoin,
}

/// Compliance responder state
#[derive(Debug, Default)]
pub struct ComplianceTest {
    mode: ComplianceMode,
    downlink_counter: u16,
    last_downlink: Bytes,
}

impl ComplianceTest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ComplianceMode {
        self.mode
    }

    pub fn downlink_counter(&self) -> u16 {
        self.downlink_counter
    }

    /// Applies a downlink received on the compliance port
    pub fn on_downlink(&mut self, payload: &[u8]) {
        self.downlink_counter = self.downlink_counter.wrapping_add(1);
        self.last_downlink = Bytes::copy_from_slice(payload);

        let Some(&command) = payload.first() else {
            return;
        };
        let mode = match command {
            DEACTIVATE => {
                self.downlink_counter = 0;
                ComplianceMode::Deactivated
            }
            ACTIVATE => {
                self.downlink_counter = 0;
                ComplianceMode::Activated
            }
            CONFIRMED => ComplianceMode::Confirmed,
            UNCONFIRMED => ComplianceMode::DownlinkCounter,
            ECHO if payload.get(1) == Some(&0x01) => ComplianceMode::Echo,
            TRIGGER_JOIN => ComplianceMode::TriggerJoin,
            _ => {
                debug!(command, "compliance command ignored");
                return;
            }
        };
        info!(?mode, "compliance test mode");
        self.mode = mode;
    }

    /// Uplink owed by the current mode
    pub fn next_uplink(&self, max_payload: usize) -> ComplianceUplink {
        match self.mode {
            ComplianceMode::Idle => ComplianceUplink::KeepAlive,
            ComplianceMode::Activated | ComplianceMode::DownlinkCounter => ComplianceUplink::Send {
                payload: self.counter_payload(),
                flags: MsgFlags::Unconfirmed,
            },
            ComplianceMode::Confirmed => ComplianceUplink::Send {
                payload: self.counter_payload(),
                flags: MsgFlags::Confirmed,
            },
            ComplianceMode::Echo => {
                if self.last_downlink.len() > max_payload {
                    debug!(len = self.last_downlink.len(), "echo does not fit, skipped");
                    return ComplianceUplink::HangOn;
                }
                let mut payload = BytesMut::with_capacity(self.last_downlink.len().max(1));
                payload.put_u8(ECHO);
                for b in self.last_downlink.iter().skip(1) {
                    payload.put_u8(b.wrapping_add(1));
                }
                ComplianceUplink::Send {
                    payload: payload.freeze(),
                    flags: MsgFlags::Unconfirmed,
                }
            }
            ComplianceMode::Deactivated => ComplianceUplink::HangOn,
            ComplianceMode::TriggerJoin => ComplianceUplink::Rejoin,
        }
    }

    /// Records a successful compliance uplink
    pub fn on_sent(&mut self) {
        if self.mode != ComplianceMode::Idle {
            self.mode = ComplianceMode::Activated;
        }
    }

    /// Back to idle after the device left the network
    pub fn reset(&mut self) {
        self.mode = ComplianceMode::Idle;
        self.downlink_counter = 0;
        self.last_downlink = Bytes::new();
    }

    fn counter_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.downlink_counter.to_be_bytes())
    }
}
