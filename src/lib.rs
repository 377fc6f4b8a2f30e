//! An asynchronous peer-to-peer messenger: reliable, ordered message streams between the
//!  daemons of a cluster over plain TCP, with transparent reconnects.
//!
//! A [messenger::Messenger] owns one [connection::Connection] per peer. Connections survive
//!  socket failures: messages that were not acknowledged are resent on the next socket, and
//!  duplicates are filtered by sequence number, so the [dispatch::Dispatcher] sees every message
//!  of a session exactly once and in order. When a session can not be continued (lossy policy,
//!  peer restart, fatal handshake failure), the dispatcher is notified through `on_reset`.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod message;
pub mod messenger;
pub mod policy;
pub mod security;
pub mod test_util;
pub mod throttle;
pub mod util;
pub mod wire;

pub use config::MessengerConfig;
pub use connection::Connection;
pub use dispatch::Dispatcher;
pub use message::Message;
pub use messenger::{Collaborators, Messenger};
pub use policy::{PeerType, Policy, PolicyTable};
pub use wire::peer_addr::PeerAddr;
