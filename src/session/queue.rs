//! Single ordered event queue
//!
//! Radio events posted by the stack and expiring timers are drained one at a
//! time by the device task. Posted events are always taken before timers.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::trace;

use crate::network::RadioEvent;

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

/// Class C parameters applied when a window opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCWindow {
    pub data_rate: u8,
    /// Downlink frequency in Hz
    pub frequency: u32,
    /// Time the window stays open once the device is in class C
    pub lifetime: Duration,
}

/// Work a timer hands back to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    KeepAlive,
    ClockResync,
    SwitchToClassC(ClassCWindow),
    RevertToClassA,
}

/// Next unit of work for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Radio(RadioEvent),
    Timer(Task),
}

/// Handle the LoRaWAN stack uses to post its events
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<RadioEvent>);

impl EventSender {
    /// Posts an event; false once the queue is gone
    pub fn post(&self, event: RadioEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

struct TimerEntry {
    key: delay_queue::Key,
    task: Task,
    period: Option<Duration>,
}

/// Posted events plus one-shot and periodic timers
pub struct EventQueue {
    tx: mpsc::UnboundedSender<RadioEvent>,
    rx: mpsc::UnboundedReceiver<RadioEvent>,
    timers: DelayQueue<TimerId>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u32,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventQueue {
            tx,
            rx,
            timers: DelayQueue::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender(self.tx.clone())
    }

    /// Runs `task` once after `delay`
    pub fn call_in(&mut self, delay: Duration, task: Task) -> TimerId {
        self.schedule(delay, task, None)
    }

    /// Runs `task` every `period`, first after one period
    pub fn call_every(&mut self, period: Duration, task: Task) -> TimerId {
        self.schedule(period, task, Some(period))
    }

    /// Cancels a timer; false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.timers.try_remove(&entry.key);
                trace!(?id, task = ?entry.task, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of armed timers
    pub fn scheduled(&self) -> usize {
        self.entries.len()
    }

    /// Waits for the next event
    ///
    /// Returns `None` only when nothing can ever arrive again.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let id = tokio::select! {
                biased;
                Some(event) = self.rx.recv() => return Some(Event::Radio(event)),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => expired.into_inner(),
                else => return None,
            };
            if let Some(task) = self.fire(id) {
                return Some(Event::Timer(task));
            }
        }
    }

    fn schedule(&mut self, delay: Duration, task: Task, period: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let key = self.timers.insert(id, delay);
        self.entries.insert(id, TimerEntry { key, task, period });
        trace!(?id, ?task, ?delay, periodic = period.is_some(), "timer armed");
        id
    }

    fn fire(&mut self, id: TimerId) -> Option<Task> {
        match self.entries.get(&id).map(|e| (e.task, e.period)) {
            Some((task, Some(period))) => {
                let key = self.timers.insert(id, period);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.key = key;
                }
                Some(task)
            }
            Some((task, None)) => {
                self.entries.remove(&id);
                Some(task)
            }
            None => None,
        }
    }
}
