use crate::native::ConnectionIndicator;
use harbor_core::bridge::{ConnectionStatePayload, HostMessage};
use harbor_core::ConnectionState;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOrigin {
    Gateway,
    Surface,
    User,
}

impl TransitionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOrigin::Gateway => "gateway",
            TransitionOrigin::Surface => "surface",
            TransitionOrigin::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub previous: ConnectionState,
    pub state: ConnectionState,
    pub changed: bool,
}

impl ConnectionUpdate {
    /// Outbound notification; produced for every transition, changed or not.
    pub fn to_message(&self) -> HostMessage {
        HostMessage::ConnectionStateChanged(ConnectionStatePayload { state: self.state })
    }
}

/// Single writer of the current connection state.
///
/// Readers hold a `watch::Receiver`; indicators are only repainted when the
/// state actually moves.
pub struct ConnectionSync {
    state: watch::Sender<ConnectionState>,
    indicators: Vec<Box<dyn ConnectionIndicator>>,
}

impl Default for ConnectionSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSync {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            indicators: Vec::new(),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Registers an indicator and paints it with the current state.
    pub fn add_indicator(&mut self, mut indicator: Box<dyn ConnectionIndicator>) {
        indicator.show_connection_state(self.current());
        self.indicators.push(indicator);
    }

    pub fn apply(&mut self, state: ConnectionState, origin: TransitionOrigin) -> ConnectionUpdate {
        let previous = self.state.send_replace(state);
        let changed = previous != state;
        if changed {
            for indicator in self.indicators.iter_mut() {
                indicator.show_connection_state(state);
            }
        }
        info!(
            event = "connection_transition",
            from = %previous,
            to = %state,
            origin = origin.as_str(),
            changed
        );
        ConnectionUpdate {
            previous,
            state,
            changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<ConnectionState>>>);

    impl ConnectionIndicator for Recording {
        fn show_connection_state(&mut self, state: ConnectionState) {
            self.0.lock().expect("lock").push(state);
        }
    }

    #[test]
    fn every_transition_is_reported_but_indicators_skip_repeats() {
        let painted = Arc::new(Mutex::new(Vec::new()));
        let mut sync = ConnectionSync::new();
        sync.add_indicator(Box::new(Recording(painted.clone())));
        let watcher = sync.subscribe();

        let first = sync.apply(ConnectionState::Connecting, TransitionOrigin::Gateway);
        let second = sync.apply(ConnectionState::Connected, TransitionOrigin::Gateway);
        let repeat = sync.apply(ConnectionState::Connected, TransitionOrigin::Surface);

        assert!(first.changed && second.changed);
        assert!(!repeat.changed);
        assert_eq!(
            repeat.to_message(),
            HostMessage::ConnectionStateChanged(ConnectionStatePayload {
                state: ConnectionState::Connected
            })
        );
        assert_eq!(
            *painted.lock().expect("lock"),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(*watcher.borrow(), ConnectionState::Connected);
        assert_eq!(sync.current(), ConnectionState::Connected);
    }
}
