//! The [Messenger] is the registry of all connections of one endpoint. It owns the listening
//!  socket and routes outgoing messages to the connection for their peer, creating it if
//!  necessary. Incoming sockets are matched against registered connections in [accept], which is
//!  where concurrent connection attempts between two peers are resolved.
//!
//! Lock order: the registry lock is always acquired before a connection's lock, never the other
//!  way round. Dispatcher callbacks are never invoked while either is held.

pub mod race;
mod accept;

use std::cmp::max;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MessengerConfig;
use crate::connection::state::ConnectionState;
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::message::{Message, MessageRegistry, RawMessageRegistry};
use crate::policy::{PeerType, PolicyTable};
use crate::security::{Authorizer, NoAuth, NoSecurity, SessionSecurity};
use crate::util::random::RngRandom;
use crate::wire::peer_addr::PeerAddr;

/// State shared between the messenger and its connections' tasks
pub(crate) struct MessengerCore {
    pub(crate) config: Arc<MessengerConfig>,
    pub(crate) my_type: PeerType,
    my_addr: watch::Sender<PeerAddr>,
    pub(crate) policies: PolicyTable,
    pub(crate) connections: Mutex<FxHashMap<PeerAddr, Arc<Connection>>>,
    global_seq: AtomicU32,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) registry: Arc<dyn MessageRegistry>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) security: Arc<dyn SessionSecurity>,
    shut_down: AtomicBool,
}

impl MessengerCore {
    pub(crate) fn my_addr(&self) -> PeerAddr {
        *self.my_addr.borrow()
    }

    /// a messenger bound to a blank IP takes the first IP a peer observes for it
    pub(crate) fn learn_my_ip(&self, ip: IpAddr) {
        let learned = self.my_addr.send_if_modified(|addr| addr.set_ip_if_blank(ip));
        if learned {
            info!("learned own address {:?}", self.my_addr());
        }
    }

    /// draws a global sequence number greater than both `at_least` and every one drawn before
    pub(crate) fn next_global_seq(&self, at_least: u32) -> u32 {
        let prev = self.global_seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(max(cur, at_least).wrapping_add(1)))
            .unwrap_or_else(|cur| cur);
        max(prev, at_least).wrapping_add(1)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// The pluggable parts of a messenger. Only the dispatcher is mandatory, the rest defaults to
///  passing messages through without any authentication.
pub struct Collaborators {
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<dyn MessageRegistry>,
    authorizer: Arc<dyn Authorizer>,
    security: Arc<dyn SessionSecurity>,
}

impl Collaborators {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Collaborators {
        Collaborators {
            dispatcher,
            registry: Arc::new(RawMessageRegistry),
            authorizer: Arc::new(NoAuth),
            security: Arc::new(NoSecurity),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn MessageRegistry>) -> Collaborators {
        self.registry = registry;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Collaborators {
        self.authorizer = authorizer;
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SessionSecurity>) -> Collaborators {
        self.security = security;
        self
    }
}

pub struct Messenger {
    core: Arc<MessengerCore>,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Binds the listening socket. Nothing is accepted before [Messenger::start] is called, but
    ///  outgoing connections can be used right away.
    pub async fn bind(config: MessengerConfig, my_type: PeerType, policies: PolicyTable, collaborators: Collaborators) -> anyhow::Result<Messenger> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let my_addr = PeerAddr::with_random_nonce::<RngRandom>(listener.local_addr()?);
        info!("messenger bound to {:?} as {:?}", my_addr, my_type);

        let (my_addr, _) = watch::channel(my_addr);
        let core = Arc::new(MessengerCore {
            config: Arc::new(config),
            my_type,
            my_addr,
            policies,
            connections: Default::default(),
            global_seq: AtomicU32::new(0),
            dispatcher: collaborators.dispatcher,
            registry: collaborators.registry,
            authorizer: collaborators.authorizer,
            security: collaborators.security,
            shut_down: AtomicBool::new(false),
        });

        Ok(Messenger {
            core,
            listener: Mutex::new(Some(listener)),
            accept_task: Default::default(),
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = match self.listener.lock().await.take() {
            Some(listener) => listener,
            None => bail!("messenger was already started"),
        };
        let handle = tokio::spawn(accept::accept_loop(self.core.clone(), listener));
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    pub fn my_addr(&self) -> PeerAddr {
        self.core.my_addr()
    }

    pub fn my_type(&self) -> PeerType {
        self.core.my_type
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.core.config
    }

    /// Sends a message to a peer, connecting to it if there is no connection yet. Messages to a
    ///  peer that must connect to us (server policy) are dropped if it did not.
    pub async fn send(&self, peer_addr: PeerAddr, peer_type: PeerType, message: Message) {
        match self.get_or_connect(peer_addr, peer_type).await {
            Ok(connection) => connection.send(message).await,
            Err(e) => debug!("dropping message of type {} to {:?}: {}", message.msg_type, peer_addr, e),
        }
    }

    /// the registered connection to a peer, creating (and dialing) it if there is none
    pub async fn get_or_connect(&self, peer_addr: PeerAddr, peer_type: PeerType) -> anyhow::Result<Arc<Connection>> {
        if self.core.is_shut_down() {
            bail!("messenger is shut down");
        }
        if peer_addr == self.core.my_addr() {
            bail!("can not connect to myself");
        }

        let mut connections = self.core.connections.lock().await;
        if let Some(existing) = connections.get(&peer_addr) {
            if existing.state().await != ConnectionState::Closed {
                return Ok(existing.clone());
            }
        }

        let policy = self.core.policies.get(peer_type).clone();
        if policy.server {
            bail!("peers of type {:?} must connect to us", peer_type);
        }

        debug!("creating connection to {:?}", peer_addr);
        let connection = Connection::new(&self.core, peer_addr, peer_type, policy);
        connections.insert(peer_addr, connection.clone());
        connection.start_connecting(self.core.clone()).await;
        Ok(connection)
    }

    pub async fn connection(&self, peer_addr: PeerAddr) -> Option<Arc<Connection>> {
        self.core.connections.lock().await
            .get(&peer_addr)
            .cloned()
    }

    /// closes the connection to a peer for good, discarding everything queued for it
    pub async fn mark_down(&self, peer_addr: PeerAddr) {
        let connection = self.core.connections.lock().await
            .get(&peer_addr)
            .cloned();
        if let Some(connection) = connection {
            connection.mark_down().await;
        }
    }

    /// stops accepting and marks down every connection
    pub async fn shutdown(&self) {
        info!("shutting down messenger {:?}", self.my_addr());
        self.core.shut_down.store(true, Ordering::Release);
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }

        let connections: Vec<Arc<Connection>> = self.core.connections.lock().await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in connections {
            connection.mark_down().await;
        }
    }
}
