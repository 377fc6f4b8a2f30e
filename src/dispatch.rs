use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;
use crate::message::Message;

/// The consumer of everything a messenger receives. Callbacks are invoked from connection
///  tasks without any messenger or connection lock held, so implementations may call back into
///  the messenger (e.g. to send a reply).
///
/// Messages from one connection are delivered in order, one at a time: the connection does not
///  read further messages until `on_message` returns.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn on_message(&self, connection: Arc<Connection>, message: Message);

    /// an outgoing connection completed its handshake
    async fn on_connect(&self, connection: Arc<Connection>);

    /// an incoming connection completed its handshake
    async fn on_accept(&self, connection: Arc<Connection>);

    /// The session with the peer is gone: queued messages were discarded, and messages sent
    ///  before may or may not have arrived. `is_remote` is true if the peer reset or closed the
    ///  session, false if it was given up locally.
    async fn on_reset(&self, connection: Arc<Connection>, is_remote: bool);
}
