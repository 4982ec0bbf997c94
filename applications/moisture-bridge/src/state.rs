use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of one connection (transport or storage).
///
/// `Degraded` means the handle still exists and claims to be usable, but
/// operations against it are failing. It is only ever entered from a
/// liveness check, never from the library's own disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    pub fn needs_reconnect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Owned state of one connection. Changes are logged and observable
/// through [`StateCell::subscribe`].
#[derive(Debug)]
pub struct StateCell {
    component: &'static str,
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(component: &'static str) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { component, tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Returns the previous state.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let prev = self.tx.send_replace(next);
        if prev != next {
            info!(component = self.component, from = %prev, to = %next, "connection state changed");
        }
        prev
    }

    /// Move to `next` only if the current state is `expected`.
    pub fn set_if(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == expected && expected != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(
                component = self.component,
                from = %expected,
                to = %next,
                "connection state changed"
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let cell = StateCell::new("test");
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Connected), ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_set_if_only_from_expected() {
        let cell = StateCell::new("test");
        cell.set(ConnectionState::Connecting);
        assert!(cell.set_if(ConnectionState::Connecting, ConnectionState::Degraded));
        assert!(!cell.set_if(ConnectionState::Connecting, ConnectionState::Disconnected));
        assert_eq!(cell.get(), ConnectionState::Degraded);
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(ConnectionState::Disconnected.needs_reconnect());
        assert!(ConnectionState::Degraded.needs_reconnect());
        assert!(!ConnectionState::Connecting.needs_reconnect());
        assert!(!ConnectionState::Connected.needs_reconnect());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let cell = StateCell::new("test");
        let mut rx = cell.subscribe();
        cell.set(ConnectionState::Connected);
        let seen = rx
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|s| *s)
            .unwrap();
        assert_eq!(seen, ConnectionState::Connected);
    }
}
