/// The top-level protocol state of a [crate::connection::Connection]. The handshake and
///  frame-reading sub-states live with the code that drives them (`ConnectStep`, `AcceptStep`,
///  `ReadState`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// created, but no task has picked it up yet
    None,
    /// dialing and running the connecting side of the handshake
    Connecting,
    /// an incoming socket is running the accepting side of the handshake for this connection
    Accepting,
    Open,
    /// no socket, waiting for the peer to reconnect or for a message to be queued
    Standby,
    /// lost a connect race: waiting for the peer's competing connection to arrive
    Wait,
    /// terminal
    Closed,
}

impl ConnectionState {
    /// states in which a handshake for this connection may be in flight
    pub fn is_mid_handshake(self) -> bool {
        matches!(self, ConnectionState::None | ConnectionState::Connecting | ConnectionState::Accepting | ConnectionState::Wait)
    }
}
