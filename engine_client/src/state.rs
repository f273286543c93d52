//! Per-session connection state.

use std::fmt;

/// Connection state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    /// Not connected to any server.
    #[default]
    Offline,
    /// Transport handshake in progress.
    Connecting,
    /// Handshake done, waiting for the map and the enter-game acknowledgment.
    Loading,
    /// In game, receiving snapshots.
    Online,
    /// A demo is feeding the snapshot store.
    DemoPlayback,
    /// Shutting down. Terminal.
    Quitting,
}

impl ClientState {
    pub const ALL: [ClientState; 6] = [
        ClientState::Offline,
        ClientState::Connecting,
        ClientState::Loading,
        ClientState::Online,
        ClientState::DemoPlayback,
        ClientState::Quitting,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ClientState::Offline => "offline",
            ClientState::Connecting => "connecting",
            ClientState::Loading => "loading",
            ClientState::Online => "online",
            ClientState::DemoPlayback => "demo_playback",
            ClientState::Quitting => "quitting",
        }
    }

    /// Whether `self -> next` is an allowed edge.
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (Quitting, _) => false,
            (_, Quitting) => true,
            (Offline, Connecting) | (Offline, DemoPlayback) => true,
            (Connecting, Loading) | (Loading, Online) => true,
            (Connecting, Offline) | (Loading, Offline) | (Online, Offline) => true,
            (DemoPlayback, Offline) => true,
            _ => false,
        }
    }

    /// Connecting or Loading.
    pub fn is_connecting(self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Loading)
    }

    /// Holds a live transport connection.
    pub fn has_connection(self) -> bool {
        matches!(
            self,
            ClientState::Connecting | ClientState::Loading | ClientState::Online
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_path_is_allowed() {
        use ClientState::*;
        assert!(Offline.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Online));
        assert!(Online.can_transition_to(Offline));
    }

    #[test]
    fn shortcuts_are_rejected() {
        use ClientState::*;
        assert!(!Offline.can_transition_to(Online));
        assert!(!Connecting.can_transition_to(Online));
        assert!(!Online.can_transition_to(DemoPlayback));
        assert!(!DemoPlayback.can_transition_to(Online));
        assert!(!Online.can_transition_to(Loading));
    }

    #[test]
    fn quitting_is_terminal() {
        for state in ClientState::ALL {
            assert!(!ClientState::Quitting.can_transition_to(state));
            if state != ClientState::Quitting {
                assert!(state.can_transition_to(ClientState::Quitting));
            }
        }
    }
}
