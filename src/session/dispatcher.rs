use std::time::Duration;

use tracing::debug;

use super::queue::{EventQueue, Task, TimerId};

/// Periodic keep-alive uplink schedule
///
/// At most one keep-alive timer exists. It is stopped while a control
/// exchange needs the channel and started again afterwards.
#[derive(Debug, Default)]
pub struct UplinkDispatcher {
    handle: Option<TimerId>,
}

impl UplinkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules the keep-alive every `period`; returns the running handle if already scheduled
    pub fn start(&mut self, queue: &mut EventQueue, period: Duration) -> TimerId {
        if let Some(handle) = self.handle {
            return handle;
        }
        let handle = queue.call_every(period, Task::KeepAlive);
        debug!(?handle, ?period, "keep-alive started");
        self.handle = Some(handle);
        handle
    }

    /// Cancels the keep-alive; returns the handle that was cancelled
    pub fn stop(&mut self, queue: &mut EventQueue) -> Option<TimerId> {
        let handle = self.handle.take()?;
        queue.cancel(handle);
        debug!(?handle, "keep-alive stopped");
        Some(handle)
    }

    pub fn handle(&self) -> Option<TimerId> {
        self.handle
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}
