use std::time::Duration;

use tracing::{info, warn};

use super::dispatcher::UplinkDispatcher;
use super::queue::{ClassCWindow, EventQueue, Task, TimerId};
use crate::core::{DeviceClass, Error, Result};
use crate::network::LoRaRadio;

/// Schedules class C windows and the return to class A
///
/// Only one window is handled at a time: a request made while a window is
/// pending or open is rejected.
#[derive(Debug)]
pub struct ClassSwitchCoordinator {
    default_rx2_frequency: u32,
    pending: Option<TimerId>,
    revert: Option<TimerId>,
    active: Option<ClassCWindow>,
}

impl ClassSwitchCoordinator {
    pub fn new(default_rx2_frequency: u32) -> Self {
        ClassSwitchCoordinator {
            default_rx2_frequency,
            pending: None,
            revert: None,
            active: None,
        }
    }

    /// A window is scheduled or open
    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.revert.is_some()
    }

    /// Parameters of the open window
    pub fn active(&self) -> Option<ClassCWindow> {
        self.active
    }

    /// Validates and schedules a class C window
    ///
    /// Nothing changes when the parameters are rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn request_class_c<R: LoRaRadio>(
        &mut self,
        radio: &R,
        queue: &mut EventQueue,
        dispatcher: &mut UplinkDispatcher,
        data_rate: u8,
        frequency: u32,
        lifetime: Duration,
        switch_delay: Duration,
    ) -> Result<TimerId> {
        if let Err(e) = radio.verify_multicast_freq_and_dr(frequency, data_rate) {
            warn!(frequency, data_rate, error = %e, "class C parameters rejected");
            return Err(Error::protocol(format!(
                "Class C at {} Hz DR{} rejected: {}",
                frequency, data_rate, e
            )));
        }
        if self.is_busy() {
            warn!(frequency, data_rate, "class C window already scheduled, request dropped");
            return Err(Error::invalid_state("A class C window is already pending or open"));
        }

        dispatcher.stop(queue);
        let window = ClassCWindow {
            data_rate,
            frequency,
            lifetime,
        };
        let handle = queue.call_in(switch_delay, Task::SwitchToClassC(window));
        self.pending = Some(handle);
        info!(?switch_delay, ?lifetime, frequency, data_rate, "class C window scheduled");
        Ok(handle)
    }

    /// Opens the window: fixed data rate and RX2 frequency, class C
    ///
    /// The revert timer is armed before the radio is touched so the device
    /// always returns to class A.
    pub fn switch_to_class_c<R: LoRaRadio>(
        &mut self,
        radio: &mut R,
        queue: &mut EventQueue,
        window: ClassCWindow,
    ) -> Result<()> {
        self.pending = None;
        self.active = Some(window);
        self.revert = Some(queue.call_in(window.lifetime, Task::RevertToClassA));

        if let Err(e) = radio.cancel_sending() {
            warn!(error = %e, "pending uplink not cancelled");
        }
        radio.disable_adaptive_datarate()?;
        radio.set_datarate(window.data_rate)?;
        radio.set_rx2_frequency(window.frequency)?;
        radio.set_device_class(DeviceClass::C)?;
        info!(frequency = window.frequency, data_rate = window.data_rate, "switched to class C");
        Ok(())
    }

    /// Closes the window: ADR on, default RX2 frequency, class A
    pub fn revert_to_class_a<R: LoRaRadio>(&mut self, radio: &mut R) -> Result<()> {
        self.revert = None;
        self.active = None;

        radio.enable_adaptive_datarate()?;
        radio.set_rx2_frequency(self.default_rx2_frequency)?;
        radio.set_device_class(DeviceClass::A)?;
        info!("reverted to class A");
        Ok(())
    }
}
