use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::throttle::Throttle;
use crate::wire::features::Features;

/// The role of a peer in the cluster, sent as the 'host type' in the handshake. The values are
///  assigned by the application, the messenger only uses them to pick a [Policy].
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerType(pub u32);

impl Debug for PeerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "type:{}", self.0)
    }
}

/// How connections to a given kind of peer behave on faults. A connection gets its policy when
///  it is created and never changes it.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Messages may be lost on faults: nothing is retained for resending, and a fault closes the
    ///  connection for good
    pub lossy: bool,
    /// This side never initiates a reconnect, it waits for the peer to do it
    pub server: bool,
    /// After a fault with nothing to send, wait in STANDBY until a message is queued instead of
    ///  reconnecting right away
    pub standby: bool,
    /// When a peer we know nothing about claims an existing session (connect_seq > 0), tell it to
    ///  reset its session rather than silently continuing it
    pub resetcheck: bool,
    pub supported_features: Features,
    pub required_features: Features,
    pub message_throttle: Option<Arc<Throttle>>,
    pub byte_throttle: Option<Arc<Throttle>>,
}

impl Policy {
    fn base(lossy: bool, server: bool, standby: bool, resetcheck: bool) -> Policy {
        Policy {
            lossy,
            server,
            standby,
            resetcheck,
            supported_features: Features::SUPPORTED_DEFAULT,
            required_features: Features::empty(),
            message_throttle: None,
            byte_throttle: None,
        }
    }

    /// a client that can tolerate losing messages, e.g. for requests that are retried at a higher
    ///  level anyway
    pub fn lossy_client() -> Policy {
        Self::base(true, false, false, false)
    }

    pub fn lossless_client() -> Policy {
        Self::base(false, false, false, false)
    }

    /// for peers that talk to each other as equals, both of them initiating connections
    pub fn lossless_peer() -> Policy {
        Self::base(false, false, true, false)
    }

    pub fn stateless_server() -> Policy {
        Self::base(true, true, false, false)
    }

    pub fn stateful_server() -> Policy {
        Self::base(false, true, true, true)
    }

    pub fn with_required_features(mut self, required: Features) -> Policy {
        self.required_features = required;
        self.supported_features |= required;
        self
    }

    pub fn with_supported_features(mut self, supported: Features) -> Policy {
        self.supported_features = supported | self.required_features;
        self
    }

    pub fn with_throttles(mut self, message_throttle: Option<Arc<Throttle>>, byte_throttle: Option<Arc<Throttle>>) -> Policy {
        self.message_throttle = message_throttle;
        self.byte_throttle = byte_throttle;
        self
    }
}


/// Maps peer types to policies, falling back to a default for types without a specific entry
#[derive(Clone, Debug)]
pub struct PolicyTable {
    default_policy: Policy,
    by_type: FxHashMap<PeerType, Policy>,
}

impl PolicyTable {
    pub fn new(default_policy: Policy) -> PolicyTable {
        PolicyTable {
            default_policy,
            by_type: FxHashMap::default(),
        }
    }

    pub fn with_policy(mut self, peer_type: PeerType, policy: Policy) -> PolicyTable {
        self.by_type.insert(peer_type, policy);
        self
    }

    pub fn get(&self, peer_type: PeerType) -> &Policy {
        self.by_type.get(&peer_type)
            .unwrap_or(&self.default_policy)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::lossy_client(Policy::lossy_client(), true, false, false, false)]
    #[case::lossless_client(Policy::lossless_client(), false, false, false, false)]
    #[case::lossless_peer(Policy::lossless_peer(), false, false, true, false)]
    #[case::stateless_server(Policy::stateless_server(), true, true, false, false)]
    #[case::stateful_server(Policy::stateful_server(), false, true, true, true)]
    fn test_named_policies(#[case] policy: Policy, #[case] lossy: bool, #[case] server: bool, #[case] standby: bool, #[case] resetcheck: bool) {
        assert_eq!(policy.lossy, lossy);
        assert_eq!(policy.server, server);
        assert_eq!(policy.standby, standby);
        assert_eq!(policy.resetcheck, resetcheck);
        assert_eq!(policy.supported_features, Features::SUPPORTED_DEFAULT);
        assert!(policy.required_features.is_empty());
    }

    #[test]
    fn test_required_features_are_supported() {
        let policy = Policy::lossless_peer()
            .with_required_features(Features::MSG_AUTH)
            .with_supported_features(Features::RECONNECT_SEQ);
        assert_eq!(policy.supported_features, Features::RECONNECT_SEQ | Features::MSG_AUTH);
        assert_eq!(policy.required_features, Features::MSG_AUTH);
    }

    #[test]
    fn test_policy_table() {
        let table = PolicyTable::new(Policy::lossy_client())
            .with_policy(PeerType(2), Policy::lossless_peer());

        assert!(!table.get(PeerType(2)).lossy);
        assert!(table.get(PeerType(1)).lossy);
        assert!(table.get(PeerType(3)).lossy);
    }
}
