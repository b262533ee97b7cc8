use std::fmt;

/// Test sequence the device walks through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ClockSyncRequest,
    ClockSyncMagicTest,
    SendingClockSyncResponse,
    MulticastMagicTest,
    SendingMulticastResponse,
    FragMagicTest,
    SendingFragResponse,
    NormalTraffic,
}

/// What moved the session forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The device joined the network
    Connected,
    /// A downlink was handled
    Downlink,
    /// A class C window reverted to class A
    ClassCWindowClosed,
}

impl SessionState {
    /// Successor of `self` under `trigger`, if any
    pub fn next(self, trigger: Trigger) -> Option<SessionState> {
        use SessionState::*;

        match (trigger, self) {
            (Trigger::Connected, Idle) => Some(ClockSyncRequest),
            (Trigger::Downlink, Idle) => Some(ClockSyncRequest),
            (Trigger::Downlink, ClockSyncRequest) => Some(ClockSyncMagicTest),
            (Trigger::Downlink, ClockSyncMagicTest) => Some(SendingClockSyncResponse),
            (Trigger::Downlink, SendingClockSyncResponse) => Some(MulticastMagicTest),
            (Trigger::Downlink, MulticastMagicTest) => Some(SendingMulticastResponse),
            // Multicast waits for its class C window to close
            (Trigger::Downlink, SendingMulticastResponse) => None,
            (Trigger::Downlink, FragMagicTest) => Some(SendingFragResponse),
            (Trigger::Downlink, SendingFragResponse) => Some(NormalTraffic),
            (Trigger::Downlink, NormalTraffic) => None,
            (Trigger::ClassCWindowClosed, SendingMulticastResponse) => Some(FragMagicTest),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current and previously entered session state
#[derive(Debug, Default)]
pub struct StateMachine {
    current: SessionState,
    previous: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn previous(&self) -> SessionState {
        self.previous
    }

    /// Makes `target` current; false for `Idle` or the current state
    pub fn enter(&mut self, target: SessionState) -> bool {
        if target == SessionState::Idle || target == self.current {
            return false;
        }
        self.current = target;
        true
    }

    /// Records the current state once its entry action ran
    pub fn settle(&mut self) {
        self.previous = self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 9] = [
        Idle,
        ClockSyncRequest,
        ClockSyncMagicTest,
        SendingClockSyncResponse,
        MulticastMagicTest,
        SendingMulticastResponse,
        FragMagicTest,
        SendingFragResponse,
        NormalTraffic,
    ];

    #[test]
    fn test_states_are_ordered() {
        assert!(ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_downlink_chain() {
        let mut state = Idle;
        let mut visited = vec![state];
        while let Some(next) = state.next(Trigger::Downlink) {
            state = next;
            visited.push(state);
        }
        assert_eq!(visited, ALL[..6].to_vec());

        let resumed = state.next(Trigger::ClassCWindowClosed).unwrap();
        assert_eq!(resumed, FragMagicTest);
        assert_eq!(resumed.next(Trigger::Downlink), Some(SendingFragResponse));
        assert_eq!(SendingFragResponse.next(Trigger::Downlink), Some(NormalTraffic));
        assert_eq!(NormalTraffic.next(Trigger::Downlink), None);
    }

    #[test]
    fn test_connected_only_leaves_idle() {
        assert_eq!(Idle.next(Trigger::Connected), Some(ClockSyncRequest));
        for state in &ALL[1..] {
            assert_eq!(state.next(Trigger::Connected), None);
        }
    }

    #[test]
    fn test_window_close_only_resumes_multicast() {
        for state in ALL {
            let expected = (state == SendingMulticastResponse).then_some(FragMagicTest);
            assert_eq!(state.next(Trigger::ClassCWindowClosed), expected);
        }
    }

    #[test]
    fn test_enter_idle_and_same_state_are_noops() {
        let mut machine = StateMachine::new();
        assert!(!machine.enter(Idle));

        assert!(machine.enter(FragMagicTest));
        machine.settle();
        assert_eq!((machine.current(), machine.previous()), (FragMagicTest, FragMagicTest));

        for state in [Idle, FragMagicTest] {
            assert!(!machine.enter(state));
            assert_eq!((machine.current(), machine.previous()), (FragMagicTest, FragMagicTest));
        }
    }
}
