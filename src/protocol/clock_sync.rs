//! Application layer clock synchronization package

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use super::{ensure, PACKAGE_VERSION, PACKAGE_VERSION_REQ};
use crate::core::Result;
use crate::network::GpsClock;
use crate::time::apply_correction;

/// Package identifier reported in the version answer
pub const PACKAGE_ID: u8 = 1;

const APP_TIME: u8 = 0x01;
const DEVICE_APP_TIME_PERIODICITY: u8 = 0x02;
const FORCE_DEVICE_RESYNC: u8 = 0x03;

const TOKEN_MASK: u8 = 0x0F;

/// Shortest resync period, doubled by each periodicity step
pub const BASE_PERIODICITY: Duration = Duration::from_secs(128);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    PackageVersion,
    AppTimeAns { correction: i32, token: u8 },
    Periodicity { period: u8 },
    ForceResync { transmissions: u8 },
}

/// Device side of the clock synchronization package
#[derive(Debug, Default)]
pub struct ClockSyncControl {
    token: u8,
    periodicity: Option<u8>,
    forced_remaining: u8,
}

impl ClockSyncControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token carried by the next AppTimeReq
    pub fn token(&self) -> u8 {
        self.token
    }

    /// Builds an AppTimeReq for the given device time
    pub fn request_clock_sync(&self, device_time: u32, ans_required: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u8(APP_TIME);
        buf.put_u32_le(device_time);
        buf.put_u8((self.token & TOKEN_MASK) | (u8::from(ans_required) << 4));
        buf.freeze()
    }

    /// Next request owed to a ForceDeviceResyncReq, if any
    pub fn next_forced_request(&mut self, device_time: u32) -> Option<Bytes> {
        if self.forced_remaining == 0 {
            return None;
        }
        self.forced_remaining -= 1;
        Some(self.request_clock_sync(device_time, false))
    }

    /// Resync period requested by the server since the last call
    pub fn take_periodicity(&mut self) -> Option<Duration> {
        self.periodicity
            .take()
            .map(|p| BASE_PERIODICITY * (1u32 << p))
    }

    /// Parses a downlink and applies it to `clock`
    pub fn parse(&mut self, payload: &[u8], clock: &mut dyn GpsClock) -> Result<Option<Bytes>> {
        let commands = decode(payload)?;
        let mut answer = BytesMut::new();

        for command in commands {
            match command {
                Command::PackageVersion => {
                    answer.put_slice(&[PACKAGE_VERSION_REQ, PACKAGE_ID, PACKAGE_VERSION]);
                }
                Command::AppTimeAns { correction, token } => {
                    if token != self.token {
                        debug!(token, expected = self.token, "stale AppTimeAns ignored");
                        continue;
                    }
                    let corrected = apply_correction(clock.current_gps_time(), correction);
                    clock.set_current_gps_time(corrected);
                    self.token = (self.token + 1) & TOKEN_MASK;
                    info!(correction, gps_time = corrected, "device clock corrected");
                }
                Command::Periodicity { period } => {
                    self.periodicity = Some(period);
                    answer.put_u8(DEVICE_APP_TIME_PERIODICITY);
                    answer.put_u8(0);
                    answer.put_u32_le(clock.current_gps_time());
                }
                Command::ForceResync { transmissions } => {
                    if transmissions == 0 {
                        continue;
                    }
                    self.forced_remaining = transmissions - 1;
                    answer.put(self.request_clock_sync(clock.current_gps_time(), false));
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
            APP_TIME => {
                ensure(buf, 5, "AppTimeAns")?;
                Command::AppTimeAns {
                    correction: buf.get_i32_le(),
                    token: buf.get_u8() & TOKEN_MASK,
                }
            }
            DEVICE_APP_TIME_PERIODICITY => {
                ensure(buf, 1, "DeviceAppTimePeriodicityReq")?;
                Command::Periodicity {
                    period: buf.get_u8() & 0x0F,
                }
            }
            FORCE_DEVICE_RESYNC => {
                ensure(buf, 1, "ForceDeviceResyncReq")?;
                Command::ForceResync {
                    transmissions: buf.get_u8() & 0x07,
                }
            }
            _ => {
                debug!(cid, "unknown clock sync command, rest of payload skipped");
                break;
            }
        };
        commands.push(command);
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockRadio;

    #[test]
    fn test_request_layout() {
        let control = ClockSyncControl::new();
        let req = control.request_clock_sync(0x0102_0304, true);
        assert_eq!(&req[..], &[0x01, 0x04, 0x03, 0x02, 0x01, 0x10]);
        assert_eq!(req.len(), 6);
    }

    #[test]
    fn test_package_version() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        let answer = control.parse(&[0x00], &mut radio).unwrap();
        assert_eq!(answer.as_deref(), Some(&[0x00, 0x01, 0x01][..]));
    }

    #[test]
    fn test_app_time_ans_applies_matching_token() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        radio.gps_time = 1000;

        // correction +10, token 0
        let answer = control.parse(&[0x01, 0x0A, 0, 0, 0, 0x00], &mut radio).unwrap();
        assert!(answer.is_none());
        assert_eq!(radio.gps_time, 1010);
        assert_eq!(control.token(), 1);

        // stale token 0 is ignored
        control.parse(&[0x01, 0x0A, 0, 0, 0, 0x00], &mut radio).unwrap();
        assert_eq!(radio.gps_time, 1010);

        // correction -20, token 1
        let minus_twenty = (-20i32).to_le_bytes();
        let mut payload = vec![0x01];
        payload.extend_from_slice(&minus_twenty);
        payload.push(0x01);
        control.parse(&payload, &mut radio).unwrap();
        assert_eq!(radio.gps_time, 990);
        assert_eq!(control.token(), 2);
    }

    #[test]
    fn test_periodicity() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        radio.gps_time = 0x0A0B_0C0D;

        let answer = control.parse(&[0x02, 0x03], &mut radio).unwrap().unwrap();
        assert_eq!(&answer[..], &[0x02, 0x00, 0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(control.take_periodicity(), Some(Duration::from_secs(1024)));
        assert_eq!(control.take_periodicity(), None);
    }

    #[test]
    fn test_force_resync() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        radio.gps_time = 5;

        let answer = control.parse(&[0x03, 0x03], &mut radio).unwrap().unwrap();
        assert_eq!(&answer[..], &[0x01, 0x05, 0, 0, 0, 0x00]);
        assert!(control.next_forced_request(6).is_some());
        assert!(control.next_forced_request(7).is_some());
        assert!(control.next_forced_request(8).is_none());
    }

    #[test]
    fn test_chained_commands() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        radio.gps_time = 0;

        let answer = control.parse(&[0x00, 0x02, 0x00], &mut radio).unwrap().unwrap();
        assert_eq!(&answer[..], &[0x00, 0x01, 0x01, 0x02, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_payload_applies_nothing() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        radio.gps_time = 1000;

        let result = control.parse(&[0x02, 0x01, 0x01, 0x0A, 0x00], &mut radio);
        assert!(result.is_err());
        assert_eq!(control.take_periodicity(), None);
        assert_eq!(radio.gps_time, 1000);
    }

    #[test]
    fn test_unknown_command_keeps_earlier_answers() {
        let mut control = ClockSyncControl::new();
        let mut radio = MockRadio::new();
        let answer = control.parse(&[0x00, 0x7F, 0x00], &mut radio).unwrap().unwrap();
        assert_eq!(&answer[..], &[0x00, 0x01, 0x01]);
    }
}
