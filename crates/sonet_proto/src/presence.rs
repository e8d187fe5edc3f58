//! Connection and presence vocabulary shared by the hub and the service.

use serde::{Deserialize, Serialize};

/// Lifecycle of one websocket connection.
///
/// `CONNECTING → CONNECTED → AUTHENTICATED → DISCONNECTING → DISCONNECTED`
/// with `FAILED` and `BANNED` as terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Authenticated,
    Disconnecting,
    Disconnected,
    Failed,
    Banned,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed | ConnectionStatus::Banned
        )
    }

    /// Legal state-machine edges. Terminals have no exits.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Connecting, Connected) | (Connected, Authenticated) => true,
            (Connecting | Connected | Authenticated, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            (Connecting | Connected | Authenticated, Failed) => true,
            (Connected | Authenticated, Banned) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Away,
    Busy,
    Invisible,
    Offline,
}

impl Default for OnlineStatus {
    fn default() -> Self {
        OnlineStatus::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminals_have_no_exits() {
        use ConnectionStatus::*;
        for terminal in [Disconnected, Failed, Banned] {
            for next in [
                Connecting,
                Connected,
                Authenticated,
                Disconnecting,
                Disconnected,
                Failed,
                Banned,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn happy_path() {
        use ConnectionStatus::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
    }
}
