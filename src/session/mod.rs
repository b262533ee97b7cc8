//! Session orchestration
//!
//! One [`Device`] owns the radio, the control packages, the block store and
//! a single event queue. Every radio event and timer runs to completion on
//! the device task before the next one starts, so the single radio channel
//! is never used by two exchanges at once.

mod class_switch;
mod device;
mod dispatcher;
mod queue;
mod state;

pub use self::class_switch::ClassSwitchCoordinator;
pub use self::device::{AppEvent, Device};
pub use self::dispatcher::UplinkDispatcher;
pub use self::queue::{ClassCWindow, Event, EventQueue, EventSender, Task, TimerId};
pub use self::state::{SessionState, StateMachine, Trigger};
