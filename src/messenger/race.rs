use std::cmp::max;

use crate::connection::state::ConnectionState;
use crate::wire::handshake::ConnectMsg;
use crate::wire::peer_addr::PeerAddr;

/// A snapshot of the registered connection to a peer, taken under its lock while deciding on an
///  incoming CONNECT from that peer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExistingView {
    pub state: ConnectionState,
    pub connect_seq: u32,
    pub global_seq: u32,
    pub peer_global_seq: u32,
    pub lossy: bool,
    pub is_server: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectDecision {
    /// no prior state: create a new connection
    New,
    /// splice the incoming socket into the existing connection. `reset_session` discards the
    ///  existing session (the peer restarted, or the connection is lossy).
    Replace { reset_session: bool },
    /// the incoming attempt is older than one we already know of, retry with a global_seq above
    RetryGlobal(u32),
    /// the incoming connect_seq is stale, retry with one above
    RetrySession(u32),
    /// the peer claims a session we know nothing about
    ResetSession,
    /// our own competing connection attempt wins
    Wait,
}

/// Decides what to do with an incoming CONNECT from `peer`, given the connection that is
///  currently registered for it (if any). This is a pure function of both sides' sequence numbers
///  and addresses, so both peers come to consistent conclusions when they connect to each other
///  concurrently.
pub fn resolve_connect(existing: Option<&ExistingView>, incoming: &ConnectMsg, peer: PeerAddr, me: PeerAddr, resetcheck: bool) -> ConnectDecision {
    let existing = match existing {
        Some(existing) if existing.state != ConnectionState::Closed => existing,
        _ => {
            return if incoming.connect_seq > 0 && resetcheck {
                ConnectDecision::ResetSession
            }
            else {
                ConnectDecision::New
            };
        }
    };

    let known_global_seq = max(existing.global_seq, existing.peer_global_seq);
    if incoming.global_seq < known_global_seq {
        return ConnectDecision::RetryGlobal(known_global_seq);
    }

    if existing.lossy {
        // nothing worth preserving
        return ConnectDecision::Replace { reset_session: true };
    }

    if incoming.connect_seq == 0 && existing.connect_seq > 0 {
        // the peer restarted its session
        return ConnectDecision::Replace { reset_session: true };
    }

    if incoming.connect_seq < existing.connect_seq {
        return ConnectDecision::RetrySession(existing.connect_seq);
    }

    if incoming.connect_seq == existing.connect_seq {
        if !existing.state.is_mid_handshake() {
            // the peer raced ahead of a handshake that just completed
            return ConnectDecision::RetrySession(existing.connect_seq);
        }

        return if peer < me || existing.is_server {
            ConnectDecision::Replace { reset_session: false }
        }
        else {
            ConnectDecision::Wait
        };
    }

    ConnectDecision::Replace { reset_session: false }
}
