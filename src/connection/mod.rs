//! A [Connection] is the messenger's handle for one peer. It owns the session state (sequence
//!  numbers and outgoing queues) which survives reconnects, and at most one socket at a time.
//!
//! Every socket is driven by its own task ([Connection::drive]). Ownership of the connection's
//!  session passes between tasks through an 'epoch' counter: whenever a socket is replaced, or the
//!  connection is marked down, the epoch is bumped under the connection's lock. A task only
//!  touches the session while holding the lock *and* seeing its own epoch, and it terminates as
//!  soon as it notices it was superseded.

pub mod handshake;
pub mod out_queue;
pub mod reader;
pub mod session;
pub mod state;
pub mod writer;
mod driver;

pub(crate) use driver::read_more;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::connection::driver::DriveStart;
use crate::connection::session::{initial_out_seq, Session};
use crate::connection::state::ConnectionState;
use crate::message::Message;
use crate::messenger::race::ExistingView;
use crate::messenger::MessengerCore;
use crate::policy::{PeerType, Policy};
use crate::util::backoff::ExponentialBackoff;
use crate::util::random::RngRandom;
use crate::wire::features::Features;
use crate::wire::frame::KeepaliveStamp;
use crate::wire::peer_addr::PeerAddr;

pub struct Connection {
    peer_addr: PeerAddr,
    peer_type: PeerType,
    policy: Policy,
    core: Weak<MessengerCore>,
    inner: Mutex<ConnectionInner>,
    epoch_tx: watch::Sender<u64>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}, {:?}}}", self.peer_addr, self.peer_type)
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) state: ConnectionState,
    /// identifies the task that currently owns the session, see module docs
    pub(crate) epoch: u64,
    /// 'please flush' for the task owning the current epoch. It is replaced with every epoch, so
    ///  a superseded task can not swallow a wakeup meant for its successor.
    pub(crate) wakeup: Arc<Notify>,
    /// set once a handshake completed, i.e. the session was used at least once
    pub(crate) once_ready: bool,
    /// negotiated for the current socket
    pub(crate) features: Features,
    pub(crate) connect_seq: u32,
    pub(crate) global_seq: u32,
    pub(crate) peer_global_seq: u32,
    pub(crate) session: Session,
    pub(crate) keepalive_requested: bool,
    pub(crate) keepalive_ack_due: Option<KeepaliveStamp>,
    pub(crate) last_keepalive_ack: Option<Instant>,
    pub(crate) backoff: ExponentialBackoff,
}

/// Sequence numbers agreed on while accepting a socket
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcceptParams {
    pub connect_seq: u32,
    pub global_seq: u32,
    pub peer_global_seq: u32,
    pub features: Features,
}

/// A socket that completed its handshake, plus whatever was read past the handshake
pub(crate) struct OpenSocket {
    pub stream: TcpStream,
    pub input: BytesMut,
    pub features: Features,
}

/// A point-in-time snapshot of a connection, for introspection
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub features: Features,
    pub connect_seq: u32,
    pub global_seq: u32,
    pub peer_global_seq: u32,
    pub out_seq: u64,
    pub in_seq: u64,
    pub in_seq_acked: u64,
    pub num_queued: usize,
    pub num_sent: usize,
    pub last_keepalive_ack: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum FaultOrigin {
    Open,
    Connecting,
    Accepting,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum AfterFault {
    Reconnect(Duration),
    Stop,
}

impl Connection {
    pub(crate) fn new(core: &Arc<MessengerCore>, peer_addr: PeerAddr, peer_type: PeerType, policy: Policy) -> Arc<Connection> {
        let session = Session::new(policy.lossy, initial_out_seq::<RngRandom>(core.config.randomize_out_seq));
        let (epoch_tx, _) = watch::channel(0);
        Arc::new(Connection {
            peer_addr,
            peer_type,
            core: Arc::downgrade(core),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::None,
                epoch: 0,
                wakeup: Arc::new(Notify::new()),
                once_ready: false,
                features: Features::empty(),
                connect_seq: 0,
                global_seq: 0,
                peer_global_seq: 0,
                session,
                keepalive_requested: false,
                keepalive_ack_due: None,
                last_keepalive_ack: None,
                backoff: ExponentialBackoff::from_config(&core.config),
            }),
            policy,
            epoch_tx,
        })
    }

    pub fn peer_addr(&self) -> PeerAddr {
        self.peer_addr
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock().await;
        ConnectionStatus {
            state: inner.state,
            features: inner.features,
            connect_seq: inner.connect_seq,
            global_seq: inner.global_seq,
            peer_global_seq: inner.peer_global_seq,
            out_seq: inner.session.out_seq(),
            in_seq: inner.session.in_seq(),
            in_seq_acked: inner.session.in_seq_acked(),
            num_queued: inner.session.queue().num_queued(),
            num_sent: inner.session.queue().num_sent(),
            last_keepalive_ack: inner.last_keepalive_ack,
        }
    }

    /// Queues a message for delivery. This never fails for transient link problems: the message
    ///  is either delivered eventually, or the session is reset and the dispatcher is notified.
    pub async fn send(self: &Arc<Self>, message: Message) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => {
                debug!("messenger is gone, dropping message to {:?}", self.peer_addr);
                return;
            }
        };

        if message.body_len() > core.config.max_message_size as u64 {
            error!("message of type {} has {} bytes, maximum is {} - dropping", message.msg_type, message.body_len(), core.config.max_message_size);
            return;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Closed => {
                debug!("connection to {:?} is closed, dropping message", self.peer_addr);
            }
            ConnectionState::Standby if !self.policy.server => {
                inner.session.enqueue(message);
                inner.connect_seq += 1;
                debug!("leaving standby to reconnect to {:?} with connect_seq {}", self.peer_addr, inner.connect_seq);
                self.spawn_connect(core, &mut inner, None);
            }
            _ => {
                inner.session.enqueue(message);
                let wakeup = inner.wakeup.clone();
                drop(inner);
                wakeup.notify_one();
            }
        }
    }

    /// Queues a keepalive frame, to be sent as soon as the connection is open
    pub async fn send_keepalive(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.keepalive_requested = true;
        let wakeup = inner.wakeup.clone();
        drop(inner);
        wakeup.notify_one();
    }

    /// Closes the connection for good, discarding everything queued and releasing the socket (if
    ///  any) after a best-effort CLOSE. This is idempotent.
    pub async fn mark_down(self: &Arc<Self>) {
        match self.core.upgrade() {
            Some(core) => {
                let mut connections = core.connections.lock().await;
                let mut inner = self.inner.lock().await;
                self.unregister(&mut connections);
                self.close_locked(&mut inner);
            }
            None => {
                let mut inner = self.inner.lock().await;
                self.close_locked(&mut inner);
            }
        }
    }

    fn unregister(self: &Arc<Self>, connections: &mut FxHashMap<PeerAddr, Arc<Connection>>) {
        if connections.get(&self.peer_addr).map_or(false, |c| Arc::ptr_eq(c, self)) {
            connections.remove(&self.peer_addr);
        }
    }

    fn close_locked(&self, inner: &mut ConnectionInner) {
        if inner.state == ConnectionState::Closed {
            return;
        }
        let num_discarded = inner.session.discard_queued();
        info!("closing connection to {:?}, discarding {} messages", self.peer_addr, num_discarded);
        inner.state = ConnectionState::Closed;
        inner.keepalive_requested = false;
        inner.keepalive_ack_due = None;
        self.bump_epoch(inner);
    }

    fn bump_epoch(&self, inner: &mut ConnectionInner) -> u64 {
        inner.epoch += 1;
        inner.wakeup = Arc::new(Notify::new());
        self.epoch_tx.send_replace(inner.epoch);
        inner.epoch
    }

    /// the connection's lock, unless the session was handed over since `epoch`
    async fn lock_current(&self, epoch: u64) -> Option<MutexGuard<'_, ConnectionInner>> {
        let inner = self.inner.lock().await;
        if inner.epoch == epoch {
            Some(inner)
        }
        else {
            trace!("epoch {} was superseded by {}", epoch, inner.epoch);
            None
        }
    }

    pub(crate) async fn lock_inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().await
    }

    fn spawn_connect(self: &Arc<Self>, core: Arc<MessengerCore>, inner: &mut ConnectionInner, delay: Option<Duration>) {
        inner.state = ConnectionState::Connecting;
        let epoch = self.bump_epoch(inner);
        tokio::spawn(self.clone().drive(core, epoch, DriveStart::Connect { delay }));
    }

    /// starts dialing the peer of a freshly registered connection
    pub(crate) async fn start_connecting(self: &Arc<Self>, core: Arc<MessengerCore>) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::None {
            self.spawn_connect(core, &mut inner, None);
        }
    }

    pub(crate) fn view(&self, inner: &ConnectionInner) -> ExistingView {
        ExistingView {
            state: inner.state,
            connect_seq: inner.connect_seq,
            global_seq: inner.global_seq,
            peer_global_seq: inner.peer_global_seq,
            lossy: self.policy.lossy,
            is_server: self.policy.server,
        }
    }

    /// Takes the session over for an incoming socket, superseding whatever task owned it. With
    ///  `reset_out_seq`, the session starts over. Returns the new epoch.
    pub(crate) fn begin_replace(&self, inner: &mut ConnectionInner, params: &AcceptParams, reset_out_seq: Option<u64>) -> u64 {
        let epoch = self.bump_epoch(inner);
        inner.state = ConnectionState::Accepting;
        inner.session.requeue_sent();
        if let Some(out_seq) = reset_out_seq {
            let num_discarded = inner.session.reset(out_seq);
            info!("session with {:?} was reset, discarded {} messages", self.peer_addr, num_discarded);
        }
        inner.connect_seq = params.connect_seq;
        inner.global_seq = params.global_seq;
        inner.peer_global_seq = params.peer_global_seq;
        inner.features = params.features;
        inner.keepalive_ack_due = None;
        epoch
    }

    /// Completes an accepted handshake by handing the socket to a new task. Returns false if the
    ///  session was taken over by someone else in the meantime.
    pub(crate) async fn attach(self: &Arc<Self>, core: Arc<MessengerCore>, epoch: u64, socket: OpenSocket, peer_in_seq: Option<u64>) -> bool {
        let mut inner = match self.lock_current(epoch).await {
            Some(inner) => inner,
            None => return false,
        };
        if let Some(peer_in_seq) = peer_in_seq {
            inner.session.discard_requeued_up_to(peer_in_seq);
            inner.session.mark_in_seq_acked();
        }
        inner.state = ConnectionState::Open;
        inner.once_ready = true;
        inner.backoff.reset();
        drop(inner);

        tokio::spawn(self.clone().drive(core, epoch, DriveStart::Open(socket)));
        true
    }

    pub(crate) async fn accept_failed(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64) {
        let after = self.fault(core, epoch, FaultOrigin::Accepting).await;
        debug_assert_eq!(after, AfterFault::Stop);
    }

    /// Closes and unregisters the connection if `epoch` still owns it
    pub(crate) async fn close_and_unregister(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64) -> bool {
        let mut connections = core.connections.lock().await;
        let mut inner = match self.lock_current(epoch).await {
            Some(inner) => inner,
            None => return false,
        };
        self.close_locked(&mut inner);
        self.unregister(&mut connections);
        true
    }

    /// Handles the loss of the socket owned by `epoch`. Lossy connections are closed for good,
    ///  lossless ones keep their unacknowledged messages for the next socket.
    pub(crate) async fn fault(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64, origin: FaultOrigin) -> AfterFault {
        if self.policy.lossy {
            if self.close_and_unregister(core, epoch).await {
                core.dispatcher.on_reset(self.clone(), true).await;
            }
            return AfterFault::Stop;
        }

        let mut inner = match self.lock_current(epoch).await {
            Some(inner) => inner,
            None => return AfterFault::Stop,
        };

        inner.session.requeue_sent();
        inner.keepalive_ack_due = None;

        // an incoming handshake that never completed leaves nothing behind: no peer will come
        //  back for this session
        if origin == FaultOrigin::Accepting && !inner.once_ready && !inner.session.queue().has_queued() {
            drop(inner);
            if self.close_and_unregister(core, epoch).await {
                debug!("dropping connection to {:?} that was never opened", self.peer_addr);
            }
            return AfterFault::Stop;
        }

        let idle = self.policy.standby && !inner.session.queue().has_queued();
        if self.policy.server || origin == FaultOrigin::Accepting || idle {
            debug!("connection to {:?} goes to standby", self.peer_addr);
            inner.state = ConnectionState::Standby;
            return AfterFault::Stop;
        }

        if origin == FaultOrigin::Open {
            inner.connect_seq += 1;
        }
        inner.state = ConnectionState::Connecting;
        let delay = inner.backoff.next_delay();
        debug!("reconnecting to {:?} in {:?}", self.peer_addr, delay);
        AfterFault::Reconnect(delay)
    }
}
