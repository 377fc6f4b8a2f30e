use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::message::Message;
use crate::wire::peer_addr::PeerAddr;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchEvent {
    Message { from: PeerAddr, message: Message },
    Connect(PeerAddr),
    Accept(PeerAddr),
    Reset { peer: PeerAddr, is_remote: bool },
}

/// A [Dispatcher] that records everything it is called with, for later inspection
#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<DispatchEvent>>,
    changed: Notify,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<RecordingDispatcher> {
        Default::default()
    }

    async fn record(&self, event: DispatchEvent) {
        self.events.lock().await.push(event);
        self.changed.notify_waiters();
    }

    pub async fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().await.clone()
    }

    /// the tids of all received messages, in the order they were dispatched
    pub async fn received_tids(&self) -> Vec<u64> {
        self.events.lock().await.iter()
            .filter_map(|e| match e {
                DispatchEvent::Message { message, .. } => Some(message.tid),
                _ => None,
            })
            .collect()
    }

    pub async fn resets(&self) -> Vec<(PeerAddr, bool)> {
        self.events.lock().await.iter()
            .filter_map(|e| match e {
                DispatchEvent::Reset { peer, is_remote } => Some((*peer, *is_remote)),
                _ => None,
            })
            .collect()
    }

    /// Waits until the recorded events satisfy a predicate, failing after `timeout`
    pub async fn wait_until(&self, what: &str, timeout: Duration, predicate: impl Fn(&[DispatchEvent]) -> bool) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate(&self.events.lock().await) {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => bail!("timeout waiting for {}: {:?}", what, self.events().await),
            }
        }
    }

    pub async fn wait_for_tids(&self, num_messages: usize, timeout: Duration) -> anyhow::Result<()> {
        self.wait_until("messages", timeout, |events| {
            events.iter()
                .filter(|e| matches!(e, DispatchEvent::Message { .. }))
                .count() >= num_messages
        }).await
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn on_message(&self, connection: Arc<Connection>, message: Message) {
        self.record(DispatchEvent::Message { from: connection.peer_addr(), message }).await;
    }

    async fn on_connect(&self, connection: Arc<Connection>) {
        self.record(DispatchEvent::Connect(connection.peer_addr())).await;
    }

    async fn on_accept(&self, connection: Arc<Connection>) {
        self.record(DispatchEvent::Accept(connection.peer_addr())).await;
    }

    async fn on_reset(&self, connection: Arc<Connection>, is_remote: bool) {
        self.record(DispatchEvent::Reset { peer: connection.peer_addr(), is_remote }).await;
    }
}
