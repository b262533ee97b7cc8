use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::class_switch::ClassSwitchCoordinator;
use super::dispatcher::UplinkDispatcher;
use super::queue::{Event, EventQueue, EventSender, Task, TimerId};
use super::state::{SessionState, StateMachine, Trigger};
use crate::core::{
    Config, Error, MsgFlags, Result, RxFlags, RxMetadata, CLOCK_SYNC_MAGIC, FRAGMENTATION_MAGIC,
    MAX_APP_PORT, MULTICAST_MAGIC,
};
use crate::network::{ConnectStatus, LoRaRadio, RadioError, RadioEvent};
use crate::protocol::{
    ClassCSessionRequest, ClockSyncControl, CompletedSession, ComplianceTest, ComplianceUplink,
    FragmentationControl, MulticastCallbacks, MulticastControl,
};
use crate::storage::{BlockAllocator, BlockStoreManager};
use crate::time::gps_to_utc;
use crate::util::hex;

/// Traffic surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Downlink on an ordinary application port
    Downlink { port: u8, payload: Bytes },
    /// A fragmentation session finished; `image` has its padding stripped
    FirmwareReceived {
        session_index: u8,
        descriptor: u32,
        image: Bytes,
    },
}

/// Answers waiting for their session state
#[derive(Debug, Default)]
struct PendingResponses {
    clock_sync: Option<Bytes>,
    multicast: Option<Bytes>,
    fragmentation: Option<Bytes>,
}

/// Radio view handed to the multicast package; class C requests are collected
struct MulticastContext<'a, R> {
    radio: &'a R,
    requests: Vec<ClassCSessionRequest>,
}

impl<R: LoRaRadio> MulticastCallbacks for MulticastContext<'_, R> {
    fn gps_time(&self) -> u32 {
        self.radio.current_gps_time()
    }

    fn check_params_validity(&self, frequency: u32, data_rate: u8) -> std::result::Result<(), RadioError> {
        self.radio.verify_multicast_freq_and_dr(frequency, data_rate)
    }

    fn switch_class(&mut self, request: ClassCSessionRequest) {
        self.requests.push(request);
    }
}

/// End-device session orchestrator
///
/// Owns the radio and every piece of session state. Events are handled one
/// at a time by [`Device::step`]; nothing else touches the radio.
pub struct Device<R: LoRaRadio, A: BlockAllocator = BlockStoreManager> {
    radio: R,
    config: Config,
    queue: EventQueue,
    machine: StateMachine,
    dispatcher: UplinkDispatcher,
    class_switch: ClassSwitchCoordinator,
    clock_sync: ClockSyncControl,
    multicast: MulticastControl,
    fragmentation: FragmentationControl,
    compliance: ComplianceTest,
    storage: A,
    pending: PendingResponses,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    utc: Option<DateTime<Utc>>,
    use_otaa: bool,
    clock_resync: Option<TimerId>,
}

impl<R: LoRaRadio> Device<R> {
    /// Creates a device reassembling into heap block stores
    pub fn new(radio: R, config: Config) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        let storage = BlockStoreManager::new(config.storage);
        Self::with_allocator(radio, config, storage)
    }
}

impl<R: LoRaRadio, A: BlockAllocator> Device<R, A> {
    /// Creates a device with a custom block allocator
    pub fn with_allocator(
        radio: R,
        config: Config,
        storage: A,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        config.validate()?;
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let class_switch = ClassSwitchCoordinator::new(config.default_rx2_frequency);

        let device = Device {
            radio,
            config,
            queue: EventQueue::new(),
            machine: StateMachine::new(),
            dispatcher: UplinkDispatcher::new(),
            class_switch,
            clock_sync: ClockSyncControl::new(),
            multicast: MulticastControl::new(),
            fragmentation: FragmentationControl::new(),
            compliance: ComplianceTest::new(),
            storage,
            pending: PendingResponses::default(),
            app_tx,
            utc: None,
            use_otaa: false,
            clock_resync: None,
        };
        Ok((device, app_rx))
    }

    /// Brings the stack up and starts connecting
    pub fn start(&mut self) -> Result<()> {
        if self.config.duty_cycle_on {
            return Err(Error::config("Duty cycle must be off for compliance testing"));
        }

        self.radio
            .initialize(self.queue.sender())
            .map_err(|e| Error::init(format!("LoRaWAN stack initialization failed: {}", e)))?;
        info!("LoRaWAN stack initialized");

        self.radio
            .set_confirmed_msg_retries(self.config.confirmed_msg_retries)
            .map_err(|e| Error::init(format!("Confirmed message retries rejected: {}", e)))?;
        self.radio
            .enable_adaptive_datarate()
            .map_err(|e| Error::init(format!("Adaptive data rate not enabled: {}", e)))?;
        info!(retries = self.config.confirmed_msg_retries, "adaptive data rate enabled");

        self.connect()
            .map_err(|e| Error::init(format!("Connection error: {}", e)))
    }

    /// Starts the device and handles events until the queue closes
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        while self.step().await {}
        Ok(())
    }

    /// Waits for one event and handles it; false once no event can arrive
    pub async fn step(&mut self) -> bool {
        let event = match self.queue.next().await {
            Some(event) => event,
            None => return false,
        };
        match self.handle_event(event) {
            Ok(()) => {}
            Err(e) if e.is_transient() => debug!(?event, error = %e, "event deferred"),
            Err(e) => warn!(?event, error = %e, "event handling failed"),
        }
        true
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Radio(event) => self.on_radio_event(event),
            Event::Timer(Task::KeepAlive) => {
                self.keep_alive();
                Ok(())
            }
            Event::Timer(Task::ClockResync) => {
                if self.class_switch.is_busy() {
                    debug!("clock resync skipped during class C window");
                } else {
                    self.send_clock_sync_request();
                }
                Ok(())
            }
            Event::Timer(Task::SwitchToClassC(window)) => {
                self.class_switch
                    .switch_to_class_c(&mut self.radio, &mut self.queue, window)
            }
            Event::Timer(Task::RevertToClassA) => self.close_class_c_window(),
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) -> Result<()> {
        match event {
            RadioEvent::Connected => {
                info!("connection successful");
                self.advance_by(Trigger::Connected);
                if !self.class_switch.is_busy() {
                    self.dispatcher
                        .start(&mut self.queue, self.config.keep_alive_period);
                }
            }
            RadioEvent::Disconnected => {
                self.dispatcher.stop(&mut self.queue);
                self.compliance.reset();
                info!(otaa = self.use_otaa, "disconnected, reconnecting");
                self.connect()?;
            }
            RadioEvent::TxDone => debug!("uplink sent"),
            RadioEvent::TxTimeout
            | RadioEvent::TxError
            | RadioEvent::TxCryptoError
            | RadioEvent::TxSchedulingError => warn!(?event, "transmission error"),
            RadioEvent::RxDone => return self.on_rx_done(),
            RadioEvent::RxTimeout | RadioEvent::RxError => warn!(?event, "reception error"),
            RadioEvent::JoinFailure => error!("OTAA join failed, check keys"),
            RadioEvent::UplinkRequired => {
                info!("uplink required by network server");
                self.keep_alive();
            }
        }
        Ok(())
    }

    fn connect(&mut self) -> std::result::Result<(), RadioError> {
        let otaa = if self.use_otaa {
            self.config.otaa.as_ref()
        } else {
            None
        };
        match self.radio.connect(otaa)? {
            ConnectStatus::Connected => {
                info!("already connected");
                self.queue.sender().post(RadioEvent::Connected);
            }
            ConnectStatus::InProgress => info!(otaa = otaa.is_some(), "connection in progress"),
        }
        Ok(())
    }

    /// Enters `target` and runs its entry action
    ///
    /// Entering `Idle` or the current state does nothing.
    pub fn advance(&mut self, target: SessionState) {
        if !self.machine.enter(target) {
            return;
        }
        info!(state = %target, "session state");

        let ports = self.config.ports;
        match target {
            SessionState::ClockSyncRequest => self.send_clock_sync_request(),
            SessionState::ClockSyncMagicTest => self.send_magic(&CLOCK_SYNC_MAGIC),
            SessionState::MulticastMagicTest => self.send_magic(&MULTICAST_MAGIC),
            SessionState::FragMagicTest => self.send_magic(&FRAGMENTATION_MAGIC),
            SessionState::SendingClockSyncResponse => {
                let answer = self.pending.clock_sync.take();
                self.send_response(ports.clock_sync, answer);
            }
            SessionState::SendingMulticastResponse => {
                let answer = self.pending.multicast.take();
                self.send_response(ports.multicast, answer);
            }
            SessionState::SendingFragResponse => {
                let answer = self.pending.fragmentation.take();
                self.send_response(ports.fragmentation, answer);
            }
            SessionState::NormalTraffic | SessionState::Idle => {}
        }
        self.machine.settle();
    }

    fn advance_by(&mut self, trigger: Trigger) {
        if let Some(next) = self.machine.current().next(trigger) {
            self.advance(next);
        }
    }

    /// Routes a downlink to its control package and moves the session on
    ///
    /// Malformed control payloads are rejected without advancing.
    pub fn on_downlink(&mut self, port: u8, payload: &[u8], flags: RxFlags, metadata: RxMetadata) -> Result<()> {
        let ports = self.config.ports;

        if port == ports.clock_sync {
            self.pending.clock_sync = self.clock_sync.parse(payload, &mut self.radio)?;
            if let Some(period) = self.clock_sync.take_periodicity() {
                if let Some(previous) = self.clock_resync.take() {
                    self.queue.cancel(previous);
                }
                self.clock_resync = Some(self.queue.call_every(period, Task::ClockResync));
                info!(?period, "clock resync periodicity set");
            }
        } else if port == ports.multicast {
            let mut table = self.radio.multicast_register();
            let mut context = MulticastContext {
                radio: &self.radio,
                requests: Vec::new(),
            };
            let answer = self.multicast.parse(payload, &mut table, &mut context)?;
            let requests = context.requests;

            self.radio.set_multicast_register(table);
            self.pending.multicast = answer;
            self.sync_utc();
            for request in requests {
                if let Err(e) = self.request_class_c(
                    request.data_rate,
                    request.frequency,
                    request.lifetime,
                    request.switch_delay,
                ) {
                    warn!(group = request.group, error = %e, "class C session not scheduled");
                }
            }
        } else if port == ports.fragmentation {
            let table = self.radio.multicast_register();
            let response = self.fragmentation.parse(
                payload,
                flags,
                metadata.device_address,
                &mut self.storage,
                &table,
                self.config.expected_descriptor,
            )?;
            let (answer, completed) = match response {
                Some(response) => (response.answer, response.completed),
                None => (None, None),
            };
            self.pending.fragmentation = answer;
            if let Some(completed) = completed {
                self.deliver_image(completed);
            }
        } else if port == ports.compliance {
            self.compliance.on_downlink(payload);
            return Ok(());
        } else if (1..=MAX_APP_PORT).contains(&port) {
            let event = AppEvent::Downlink {
                port,
                payload: Bytes::copy_from_slice(payload),
            };
            if self.app_tx.send(event).is_err() {
                debug!(port, "application receiver dropped, downlink discarded");
            }
        } else {
            debug!(port, "downlink on unrecognized port ignored");
            return Ok(());
        }

        self.advance_by(Trigger::Downlink);
        Ok(())
    }

    /// Schedules a class C window through the coordinator
    pub fn request_class_c(
        &mut self,
        data_rate: u8,
        frequency: u32,
        window_lifetime_s: u32,
        switch_delay_s: u32,
    ) -> Result<()> {
        self.class_switch
            .request_class_c(
                &self.radio,
                &mut self.queue,
                &mut self.dispatcher,
                data_rate,
                frequency,
                Duration::from_secs(window_lifetime_s as u64),
                Duration::from_secs(switch_delay_s as u64),
            )
            .map(|_| ())
    }

    fn close_class_c_window(&mut self) -> Result<()> {
        let reverted = self.class_switch.revert_to_class_a(&mut self.radio);
        self.advance_by(Trigger::ClassCWindowClosed);
        self.dispatcher
            .start(&mut self.queue, self.config.keep_alive_period);
        reverted
    }

    fn on_rx_done(&mut self) -> Result<()> {
        self.dispatcher.stop(&mut self.queue);

        let mut buf = BytesMut::zeroed(self.config.max_payload);
        let outcome = match self.radio.receive(&mut buf) {
            Ok(received) => {
                buf.truncate(received.len);
                let metadata = self.radio.rx_metadata();
                debug!(
                    port = received.port,
                    len = received.len,
                    rssi = metadata.rssi,
                    snr = metadata.snr,
                    payload = %hex(&buf),
                    "downlink received"
                );
                self.on_downlink(received.port, &buf, received.flags, metadata)
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                Err(e.into())
            }
        };

        if !self.class_switch.is_busy() {
            self.dispatcher
                .start(&mut self.queue, self.config.keep_alive_period);
        }
        outcome
    }

    fn keep_alive(&mut self) {
        let now = self.radio.current_gps_time();
        if let Some(request) = self.clock_sync.next_forced_request(now) {
            let _ = self.transmit(self.config.ports.clock_sync, &request, MsgFlags::Unconfirmed);
            return;
        }

        match self.compliance.next_uplink(self.config.max_payload) {
            ComplianceUplink::KeepAlive => {
                let payload = Bytes::copy_from_slice(self.config.keep_alive_payload.as_bytes());
                let _ = self.transmit(self.config.ports.app, &payload, MsgFlags::Unconfirmed);
            }
            ComplianceUplink::Send { payload, flags } => {
                if self.transmit(self.config.ports.compliance, &payload, flags).is_ok() {
                    self.compliance.on_sent();
                }
            }
            ComplianceUplink::HangOn => info!("test mode deactivated, hanging on"),
            ComplianceUplink::Rejoin => {
                self.use_otaa = true;
                if let Err(e) = self.radio.disconnect() {
                    warn!(error = %e, "disconnect for rejoin failed");
                }
            }
        }
    }

    fn send_clock_sync_request(&mut self) {
        let request = self
            .clock_sync
            .request_clock_sync(self.radio.current_gps_time(), false);
        let _ = self.transmit(self.config.ports.clock_sync, &request, MsgFlags::Unconfirmed);
    }

    fn send_magic(&mut self, magic: &[u8; 4]) {
        let _ = self.transmit(self.config.ports.app, magic, MsgFlags::Unconfirmed);
    }

    fn send_response(&mut self, port: u8, answer: Option<Bytes>) {
        match answer {
            Some(answer) => {
                let _ = self.transmit(port, &answer, MsgFlags::Unconfirmed);
            }
            None => debug!(port, "no pending response"),
        }
    }

    /// Hands one uplink to the stack; failures are logged and returned
    fn transmit(&mut self, port: u8, payload: &[u8], flags: MsgFlags) -> Result<usize> {
        if payload.len() > self.config.max_payload {
            warn!(port, len = payload.len(), max = self.config.max_payload, "uplink too long, dropped");
            return Err(Error::protocol(format!(
                "Uplink of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.config.max_payload
            )));
        }

        match self.radio.send(port, payload, flags) {
            Ok(sent) => {
                debug!(port, sent, ?flags, payload = %hex(payload), "uplink scheduled");
                Ok(sent)
            }
            Err(RadioError::WouldBlock) => {
                debug!(port, "send would block");
                Err(RadioError::WouldBlock.into())
            }
            Err(e) => {
                warn!(port, error = %e, "send failed");
                Err(e.into())
            }
        }
    }

    fn deliver_image(&mut self, completed: CompletedSession) {
        match self.storage.read(completed.store, completed.size) {
            Ok(image) => {
                info!(
                    session = completed.session_index,
                    descriptor = completed.descriptor,
                    size = image.len(),
                    "firmware image received"
                );
                let event = AppEvent::FirmwareReceived {
                    session_index: completed.session_index,
                    descriptor: completed.descriptor,
                    image,
                };
                if self.app_tx.send(event).is_err() {
                    warn!("application receiver dropped, firmware image discarded");
                }
            }
            Err(e) => error!(error = %e, "reassembled image could not be read back"),
        }
        self.storage.release(completed.store);
    }

    fn sync_utc(&mut self) {
        let utc = gps_to_utc(self.radio.current_gps_time());
        debug!(%utc, "UTC time synchronized");
        self.utc = Some(utc);
    }

    pub fn state(&self) -> SessionState {
        self.machine.current()
    }

    pub fn previous_state(&self) -> SessionState {
        self.machine.previous()
    }

    /// UTC time as of the last multicast control exchange
    pub fn utc_time(&self) -> Option<DateTime<Utc>> {
        self.utc
    }

    /// Sender the stack posts its events to
    pub fn events(&self) -> EventSender {
        self.queue.sender()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn storage(&self) -> &A {
        &self.storage
    }

    pub fn dispatcher(&self) -> &UplinkDispatcher {
        &self.dispatcher
    }

    pub fn class_switch(&self) -> &ClassSwitchCoordinator {
        &self.class_switch
    }

    pub fn compliance(&self) -> &ComplianceTest {
        &self.compliance
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.queue.scheduled()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
