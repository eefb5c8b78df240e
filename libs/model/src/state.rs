use tokio::sync::watch;

use crate::ProfileId;

/// The externally visible lifecycle of the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(ProfileId),
    Disconnecting,
    /// Exactly one status string per error category; no stack traces cross
    /// this boundary.
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected(id) => write!(f, "connected ({id})"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Single atomic cell holding the connection state, broadcast to observers.
#[derive(Clone)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);

        (Self { tx }, rx)
    }

    pub fn set(&self, state: ConnectionState) {
        // Observers may be gone; the cell itself stays valid.
        let _ = self.tx.send(state);
    }

    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_see_transitions_in_order() {
        let (cell, mut rx) = StateCell::new();

        cell.set(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        cell.set(ConnectionState::Connected("p1".into()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected("p1".into()));
    }
}
