//! Remote multicast setup package

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::{ensure, PACKAGE_VERSION, PACKAGE_VERSION_REQ};
use crate::core::Result;
use crate::network::{McGroup, MulticastRegister, RadioError};

/// Package identifier reported in the version answer
pub const PACKAGE_ID: u8 = 2;

const MC_GROUP_STATUS: u8 = 0x01;
const MC_GROUP_SETUP: u8 = 0x02;
const MC_GROUP_DELETE: u8 = 0x03;
const MC_CLASS_C_SESSION: u8 = 0x04;

const GROUP_ID_MASK: u8 = 0x03;

const STATUS_DR_ERROR: u8 = 1 << 2;
const STATUS_FREQ_ERROR: u8 = 1 << 3;
const STATUS_GROUP_UNDEFINED: u8 = 1 << 4;

const ID_ERROR: u8 = 1 << 2;

/// Downlink frequencies travel in units of 100 Hz
const FREQUENCY_STEP_HZ: u32 = 100;

const MAX_TIME_TO_START: u32 = 0x00FF_FFFF;

/// Class C window granted by a McClassCSessionReq
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCSessionRequest {
    pub group: u8,
    pub data_rate: u8,
    /// Downlink frequency in Hz
    pub frequency: u32,
    /// Seconds until the window opens
    pub switch_delay: u32,
    /// Seconds the window stays open
    pub lifetime: u32,
}

/// Device services the multicast package relies on
pub trait MulticastCallbacks {
    /// Current GPS time in seconds
    fn gps_time(&self) -> u32;

    /// Checks a class C frequency and data rate against the region
    fn check_params_validity(&self, frequency: u32, data_rate: u8) -> std::result::Result<(), RadioError>;

    /// Hands over an accepted class C session
    fn switch_class(&mut self, request: ClassCSessionRequest);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    PackageVersion,
    GroupStatus { mask: u8 },
    GroupSetup { id: u8, group: McGroup },
    GroupDelete { id: u8 },
    ClassCSession {
        id: u8,
        session_time: u32,
        timeout: u8,
        frequency: u32,
        data_rate: u8,
    },
}

/// Device side of the remote multicast setup package
#[derive(Debug, Default)]
pub struct MulticastControl;

impl MulticastControl {
    pub fn new() -> Self {
        MulticastControl
    }

    /// Parses a downlink against the multicast register
    pub fn parse(
        &mut self,
        payload: &[u8],
        table: &mut MulticastRegister,
        callbacks: &mut dyn MulticastCallbacks,
    ) -> Result<Option<Bytes>> {
        let commands = decode(payload)?;
        let mut answer = BytesMut::new();

        for command in commands {
            match command {
                Command::PackageVersion => {
                    answer.put_slice(&[PACKAGE_VERSION_REQ, PACKAGE_ID, PACKAGE_VERSION]);
                }
                Command::GroupStatus { mask } => {
                    let total = table.defined().count() as u8;
                    let listed: Vec<(u8, u32)> = table
                        .defined()
                        .filter(|(id, _)| mask & (1 << id) != 0)
                        .map(|(id, g)| (id, g.address))
                        .collect();
                    let ans_mask = listed.iter().fold(0u8, |m, (id, _)| m | (1 << id));

                    answer.put_u8(MC_GROUP_STATUS);
                    answer.put_u8(((total & 0x07) << 4) | ans_mask);
                    for (id, address) in listed {
                        answer.put_u8(id);
                        answer.put_u32_le(address);
                    }
                }
                Command::GroupSetup { id, group } => {
                    let status = if table.set(id, group) {
                        info!(id, address = group.address, "multicast group set up");
                        id
                    } else {
                        warn!(id, slots = table.slots(), "multicast group id not supported");
                        ID_ERROR | id
                    };
                    answer.put_u8(MC_GROUP_SETUP);
                    answer.put_u8(status);
                }
                Command::GroupDelete { id } => {
                    let status = if table.remove(id) {
                        info!(id, "multicast group deleted");
                        id
                    } else {
                        ID_ERROR | id
                    };
                    answer.put_u8(MC_GROUP_DELETE);
                    answer.put_u8(status);
                }
                Command::ClassCSession {
                    id,
                    session_time,
                    timeout,
                    frequency,
                    data_rate,
                } => {
                    let mut status = id;
                    if table.get(id).is_none() {
                        status |= STATUS_GROUP_UNDEFINED;
                    }
                    match callbacks.check_params_validity(frequency, data_rate) {
                        Ok(()) => {}
                        Err(RadioError::DatarateInvalid) => status |= STATUS_DR_ERROR,
                        Err(RadioError::FrequencyInvalid) => status |= STATUS_FREQ_ERROR,
                        Err(_) => status |= STATUS_DR_ERROR | STATUS_FREQ_ERROR,
                    }

                    answer.put_u8(MC_CLASS_C_SESSION);
                    answer.put_u8(status);
                    if status & !GROUP_ID_MASK != 0 {
                        warn!(id, status, frequency, data_rate, "class C session rejected");
                        continue;
                    }

                    let switch_delay = session_time.saturating_sub(callbacks.gps_time());
                    answer.put_uint_le(switch_delay.min(MAX_TIME_TO_START) as u64, 3);

                    let request = ClassCSessionRequest {
                        group: id,
                        data_rate,
                        frequency,
                        switch_delay,
                        lifetime: 1u32 << timeout,
                    };
                    info!(?request, "class C session accepted");
                    callbacks.switch_class(request);
                }
            }
        }

        Ok(if answer.is_empty() {
            None
        } else {
            Some(answer.freeze())
        })
    }
}

fn decode(mut buf: &[u8]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    while buf.has_remaining() {
        let cid = buf.get_u8();
        let command = match cid {
            PACKAGE_VERSION_REQ => Command::PackageVersion,
            MC_GROUP_STATUS => {
                ensure(buf, 1, "McGroupStatusReq")?;
                Command::GroupStatus {
                    mask: buf.get_u8() & 0x0F,
                }
            }
            MC_GROUP_SETUP => {
                ensure(buf, 29, "McGroupSetupReq")?;
                let id = buf.get_u8() & GROUP_ID_MASK;
                let address = buf.get_u32_le();
                let mut key_encrypted = [0u8; 16];
                buf.copy_to_slice(&mut key_encrypted);
                Command::GroupSetup {
                    id,
                    group: McGroup {
                        address,
                        key_encrypted,
                        min_fcount: buf.get_u32_le(),
                        max_fcount: buf.get_u32_le(),
                    },
                }
            }
            MC_GROUP_DELETE => {
                ensure(buf, 1, "McGroupDeleteReq")?;
                Command::GroupDelete {
                    id: buf.get_u8() & GROUP_ID_MASK,
                }
            }
            MC_CLASS_C_SESSION => {
                ensure(buf, 10, "McClassCSessionReq")?;
                Command::ClassCSession {
                    id: buf.get_u8() & GROUP_ID_MASK,
                    session_time: buf.get_u32_le(),
                    timeout: buf.get_u8() & 0x0F,
                    frequency: buf.get_uint_le(3) as u32 * FREQUENCY_STEP_HZ,
                    data_rate: buf.get_u8(),
                }
            }
            _ => {
                debug!(cid, "unknown multicast command, rest of payload skipped");
                break;
            }
        };
        commands.push(command);
    }
    Ok(commands)
}
