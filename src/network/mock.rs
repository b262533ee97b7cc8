//! Recording façade used by the unit tests

use std::collections::VecDeque;

use super::{
    ConnectStatus, GpsClock, LoRaRadio, MulticastRegister, RadioError, Received,
};
use crate::core::{DeviceClass, MsgFlags, OtaaCredentials, RxFlags, RxMetadata};
use crate::session::EventSender;

/// An uplink handed to the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentFrame {
    pub port: u8,
    pub payload: Vec<u8>,
    pub flags: MsgFlags,
}

/// A downlink waiting to be received
#[derive(Debug, Clone)]
pub(crate) struct PendingFrame {
    pub port: u8,
    pub payload: Vec<u8>,
    pub flags: RxFlags,
    pub metadata: RxMetadata,
}

pub(crate) struct MockRadio {
    pub events: Option<EventSender>,
    pub sent: Vec<SentFrame>,
    pub inbox: VecDeque<PendingFrame>,
    pub last_metadata: RxMetadata,
    pub class: DeviceClass,
    pub adr: bool,
    pub data_rate: Option<u8>,
    pub rx2_frequency: Option<u32>,
    pub gps_time: u32,
    pub register: MulticastRegister,
    pub connects: Vec<Option<OtaaCredentials>>,
    pub disconnects: usize,
    pub cancels: usize,
    pub retries: Option<u8>,
    pub send_error: Option<RadioError>,
    pub init_error: Option<RadioError>,
    /// Accepted multicast frequencies, inclusive
    pub valid_frequencies: (u32, u32),
    pub max_data_rate: u8,
}

impl MockRadio {
    pub fn new() -> Self {
        MockRadio {
            events: None,
            sent: Vec::new(),
            inbox: VecDeque::new(),
            last_metadata: RxMetadata::default(),
            class: DeviceClass::A,
            adr: false,
            data_rate: None,
            rx2_frequency: None,
            gps_time: 1_000_000_000,
            register: MulticastRegister::default(),
            connects: Vec::new(),
            disconnects: 0,
            cancels: 0,
            retries: None,
            send_error: None,
            init_error: None,
            valid_frequencies: (863_000_000, 870_000_000),
            max_data_rate: 5,
        }
    }

    /// Queues a unicast downlink
    pub fn push_downlink(&mut self, port: u8, payload: &[u8]) {
        self.inbox.push_back(PendingFrame {
            port,
            payload: payload.to_vec(),
            flags: RxFlags::default(),
            metadata: RxMetadata {
                device_address: 0x2601_1F00,
                ..Default::default()
            },
        });
    }

    /// Frames sent on one port
    pub fn sent_on(&self, port: u8) -> Vec<&SentFrame> {
        self.sent.iter().filter(|f| f.port == port).collect()
    }
}

impl GpsClock for MockRadio {
    fn current_gps_time(&self) -> u32 {
        self.gps_time
    }

    fn set_current_gps_time(&mut self, gps_seconds: u32) {
        self.gps_time = gps_seconds;
    }
}

impl LoRaRadio for MockRadio {
    fn initialize(&mut self, events: EventSender) -> Result<(), RadioError> {
        if let Some(err) = self.init_error {
            return Err(err);
        }
        self.events = Some(events);
        Ok(())
    }

    fn set_confirmed_msg_retries(&mut self, retries: u8) -> Result<(), RadioError> {
        self.retries = Some(retries);
        Ok(())
    }

    fn enable_adaptive_datarate(&mut self) -> Result<(), RadioError> {
        self.adr = true;
        Ok(())
    }

    fn disable_adaptive_datarate(&mut self) -> Result<(), RadioError> {
        self.adr = false;
        Ok(())
    }

    fn connect(&mut self, otaa: Option<&OtaaCredentials>) -> Result<ConnectStatus, RadioError> {
        self.connects.push(otaa.cloned());
        Ok(ConnectStatus::InProgress)
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.disconnects += 1;
        Ok(())
    }

    fn send(&mut self, port: u8, payload: &[u8], flags: MsgFlags) -> Result<usize, RadioError> {
        if let Some(err) = self.send_error {
            return Err(err);
        }
        self.sent.push(SentFrame {
            port,
            payload: payload.to_vec(),
            flags,
        });
        Ok(payload.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, RadioError> {
        let frame = self.inbox.pop_front().ok_or(RadioError::WouldBlock)?;
        if frame.payload.len() > buf.len() {
            return Err(RadioError::LengthError);
        }
        buf[..frame.payload.len()].copy_from_slice(&frame.payload);
        self.last_metadata = frame.metadata;
        Ok(Received {
            len: frame.payload.len(),
            port: frame.port,
            flags: frame.flags,
        })
    }

    fn cancel_sending(&mut self) -> Result<(), RadioError> {
        self.cancels += 1;
        Ok(())
    }

    fn set_device_class(&mut self, class: DeviceClass) -> Result<(), RadioError> {
        self.class = class;
        Ok(())
    }

    fn set_datarate(&mut self, data_rate: u8) -> Result<(), RadioError> {
        self.data_rate = Some(data_rate);
        Ok(())
    }

    fn set_rx2_frequency(&mut self, frequency: u32) -> Result<(), RadioError> {
        self.rx2_frequency = Some(frequency);
        Ok(())
    }

    fn verify_multicast_freq_and_dr(&self, frequency: u32, data_rate: u8) -> Result<(), RadioError> {
        let (low, high) = self.valid_frequencies;
        if frequency < low || frequency > high {
            return Err(RadioError::FrequencyInvalid);
        }
        if data_rate > self.max_data_rate {
            return Err(RadioError::DatarateInvalid);
        }
        Ok(())
    }

    fn multicast_register(&self) -> MulticastRegister {
        self.register.clone()
    }

    fn set_multicast_register(&mut self, register: MulticastRegister) {
        self.register = register;
    }

    fn rx_metadata(&self) -> RxMetadata {
        self.last_metadata
    }
}
