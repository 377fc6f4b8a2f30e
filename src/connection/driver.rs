use std::cmp::max;
use std::future::pending;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::handshake::{write_in_seq, ConnectEvent, ConnectHandshake};
use crate::connection::reader::{FrameReader, ReadEvent, ReceivedMessage};
use crate::connection::session::{initial_out_seq, InboundSeq};
use crate::connection::state::ConnectionState;
use crate::connection::writer::FrameWriter;
use crate::connection::{AfterFault, Connection, FaultOrigin, OpenSocket};
use crate::messenger::MessengerCore;
use crate::security::AuthorizerBlob;
use crate::throttle::Throttle;
use crate::util::random::RngRandom;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::features::Features;
use crate::wire::handshake::{ConnectMsg, ConnectReplyMsg, ReplyTag, CONNECT_FLAG_LOSSY};

pub(crate) enum DriveStart {
    Connect { delay: Option<Duration> },
    Open(OpenSocket),
}

enum ConnectOutcome {
    Open(OpenSocket),
    /// a transport fault or protocol violation, retried with backoff
    Failed(anyhow::Error),
    /// the peer's competing connection attempt wins
    Wait,
    /// retrying can not help, the connection is given up
    Fatal(anyhow::Error),
    Superseded,
}

enum OpenExit {
    Fault(anyhow::Error),
    PeerClosed,
    Superseded,
}

impl Connection {
    /// The task owning the connection's session for one epoch: dials (if necessary) and then
    ///  drives the open socket, reconnecting after faults as the policy says. It terminates when
    ///  it is superseded, or when the connection is given up.
    #[instrument(name = "connection", skip_all, fields(peer = ?self.peer_addr, epoch = epoch))]
    pub(crate) async fn drive(self: Arc<Self>, core: Arc<MessengerCore>, epoch: u64, start: DriveStart) {
        let mut superseded = self.epoch_tx.subscribe();
        let mut start = start;

        loop {
            let socket = match start {
                DriveStart::Open(socket) => {
                    // accepted socket: announced before anything it receives is dispatched
                    core.dispatcher.on_accept(self.clone()).await;
                    socket
                }
                DriveStart::Connect { delay } => {
                    if let Some(delay) = delay {
                        select! {
                            _ = sleep(delay) => {}
                            _ = wait_superseded(&mut superseded, epoch) => return,
                        }
                    }

                    let outcome = select! {
                        outcome = self.connect_once(&core, epoch) => outcome,
                        _ = wait_superseded(&mut superseded, epoch) => ConnectOutcome::Superseded,
                    };
                    match outcome {
                        ConnectOutcome::Open(socket) => {
                            info!("connected");
                            core.dispatcher.on_connect(self.clone()).await;
                            socket
                        }
                        ConnectOutcome::Failed(e) => {
                            debug!("connect attempt failed: {:#}", e);
                            match self.fault(&core, epoch, FaultOrigin::Connecting).await {
                                AfterFault::Reconnect(delay) => {
                                    start = DriveStart::Connect { delay: Some(delay) };
                                    continue;
                                }
                                AfterFault::Stop => return,
                            }
                        }
                        ConnectOutcome::Wait => {
                            if !self.wait_for_peer(&core, epoch, &mut superseded).await {
                                return;
                            }
                            start = DriveStart::Connect { delay: None };
                            continue;
                        }
                        ConnectOutcome::Fatal(e) => {
                            warn!("giving up on connection: {:#}", e);
                            if self.close_and_unregister(&core, epoch).await {
                                core.dispatcher.on_reset(self.clone(), false).await;
                            }
                            return;
                        }
                        ConnectOutcome::Superseded => return,
                    }
                }
            };

            match self.run_open(&core, epoch, &mut superseded, socket).await {
                OpenExit::Fault(e) => {
                    info!("connection faulted: {:#}", e);
                    match self.fault(&core, epoch, FaultOrigin::Open).await {
                        AfterFault::Reconnect(delay) => start = DriveStart::Connect { delay: Some(delay) },
                        AfterFault::Stop => return,
                    }
                }
                OpenExit::PeerClosed => {
                    info!("peer closed the connection");
                    if self.close_and_unregister(&core, epoch).await {
                        core.dispatcher.on_reset(self.clone(), true).await;
                    }
                    return;
                }
                OpenExit::Superseded => return,
            }
        }
    }

    async fn connect_once(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64) -> ConnectOutcome {
        let config = &core.config;
        trace!("dialing {:?}", self.peer_addr.socket_addr);
        let stream = match timeout(config.connect_timeout, TcpStream::connect(self.peer_addr.socket_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return ConnectOutcome::Failed(e.into()),
            Err(_) => return ConnectOutcome::Failed(anyhow!("timeout connecting to {:?}", self.peer_addr)),
        };
        if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
            return ConnectOutcome::Failed(e.into());
        }

        match timeout(config.handshake_timeout, self.connect_handshake(core, epoch, stream)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ConnectOutcome::Failed(e),
            Err(_) => ConnectOutcome::Failed(anyhow!("handshake timed out")),
        }
    }

    async fn connect_handshake(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64, mut stream: TcpStream) -> anyhow::Result<ConnectOutcome> {
        let config = &core.config;
        let my_features = self.policy.supported_features;
        let mut handshake = ConnectHandshake::new(self.peer_addr, my_features, config.max_authorizer_len);
        let mut input = BytesMut::with_capacity(4096);
        let mut output = BytesMut::new();

        let mut authorizer = AuthorizerBlob::default();
        let mut auth_retried = false;
        let mut ready: Option<ConnectReplyMsg> = None;

        loop {
            match handshake.poll(&mut input)? {
                ConnectEvent::NeedMore => {
                    read_more(&mut stream, &mut input).await?;
                }
                ConnectEvent::Identified { my_observed, .. } => {
                    core.learn_my_ip(my_observed.socket_addr.ip());

                    let mut inner = match self.lock_current(epoch).await {
                        Some(inner) => inner,
                        None => return Ok(ConnectOutcome::Superseded),
                    };
                    inner.global_seq = core.next_global_seq(max(inner.global_seq, inner.peer_global_seq));
                    drop(inner);

                    authorizer = core.authorizer.build(self.peer_type, false);
                    if !self.write_connect(core, epoch, &mut handshake, &authorizer, &mut output).await? {
                        return Ok(ConnectOutcome::Superseded);
                    }
                    stream.write_all(&output).await?;
                    output.clear();
                }
                ConnectEvent::Reply { reply, authorizer_reply } => {
                    debug!("received {:?} reply", reply.tag);
                    match reply.tag {
                        ReplyTag::Ready => {
                            if !core.authorizer.verify_reply(&authorizer, &authorizer_reply) {
                                bail!("peer's authorizer reply does not match our authorizer");
                            }
                            let missing = reply.features.missing(self.policy.required_features);
                            if !missing.is_empty() {
                                return Ok(ConnectOutcome::Fatal(anyhow!("peer lacks required features {:?}", missing)));
                            }

                            let features = my_features & reply.features;
                            if features.contains(Features::RECONNECT_SEQ) {
                                ready = Some(reply);
                                continue;
                            }
                            return self.commit_connected(epoch, &reply, None, stream, input).await;
                        }
                        ReplyTag::BadProtocolVersion => {
                            return Ok(ConnectOutcome::Fatal(anyhow!("protocol version mismatch: ours is {}, peer's is {}", config.protocol_version, reply.protocol_version)));
                        }
                        ReplyTag::Features => {
                            return Ok(ConnectOutcome::Fatal(anyhow!("peer requires features we do not support: {:?}", self.policy.supported_features.missing(reply.features))));
                        }
                        ReplyTag::BadAuthorizer => {
                            if auth_retried {
                                return Ok(ConnectOutcome::Fatal(anyhow!("peer rejected our authorizer twice")));
                            }
                            auth_retried = true;
                            authorizer = core.authorizer.build(self.peer_type, true);
                        }
                        ReplyTag::ResetSession => {
                            let mut inner = match self.lock_current(epoch).await {
                                Some(inner) => inner,
                                None => return Ok(ConnectOutcome::Superseded),
                            };
                            let num_discarded = inner.session.reset(initial_out_seq::<RngRandom>(config.randomize_out_seq));
                            inner.connect_seq = 0;
                            drop(inner);
                            info!("peer reset the session, discarded {} messages", num_discarded);
                            core.dispatcher.on_reset(self.clone(), true).await;
                        }
                        ReplyTag::RetryGlobal => {
                            let mut inner = match self.lock_current(epoch).await {
                                Some(inner) => inner,
                                None => return Ok(ConnectOutcome::Superseded),
                            };
                            inner.global_seq = core.next_global_seq(reply.global_seq);
                        }
                        ReplyTag::RetrySession => {
                            let mut inner = match self.lock_current(epoch).await {
                                Some(inner) => inner,
                                None => return Ok(ConnectOutcome::Superseded),
                            };
                            inner.connect_seq = reply.connect_seq + 1;
                        }
                        ReplyTag::Wait => {
                            return Ok(ConnectOutcome::Wait);
                        }
                    }

                    if !self.write_connect(core, epoch, &mut handshake, &authorizer, &mut output).await? {
                        return Ok(ConnectOutcome::Superseded);
                    }
                    stream.write_all(&output).await?;
                    output.clear();
                }
                ConnectEvent::PeerInSeq(peer_in_seq) => {
                    let reply = match ready.take() {
                        Some(reply) => reply,
                        None => bail!("sequence exchange without READY"),
                    };
                    return self.commit_connected(epoch, &reply, Some(peer_in_seq), stream, input).await;
                }
            }
        }
    }

    /// writes a CONNECT with the connection's current sequence numbers, returns false if superseded
    async fn write_connect(&self, core: &MessengerCore, epoch: u64, handshake: &mut ConnectHandshake, authorizer: &AuthorizerBlob, output: &mut BytesMut) -> anyhow::Result<bool> {
        let inner = match self.lock_current(epoch).await {
            Some(inner) => inner,
            None => return Ok(false),
        };
        let connect = ConnectMsg {
            features: self.policy.supported_features,
            host_type: core.my_type.0,
            global_seq: inner.global_seq,
            connect_seq: inner.connect_seq,
            protocol_version: core.config.protocol_version,
            authorizer_protocol: authorizer.protocol,
            authorizer_len: authorizer.data.len().prechecked_cast(),
            flags: if self.policy.lossy { CONNECT_FLAG_LOSSY } else { 0 },
        };
        drop(inner);

        handshake.write_connect(core.my_addr(), &connect, authorizer, output)?;
        Ok(true)
    }

    async fn commit_connected(&self, epoch: u64, reply: &ConnectReplyMsg, peer_in_seq: Option<u64>, mut stream: TcpStream, input: BytesMut) -> anyhow::Result<ConnectOutcome> {
        let features = self.policy.supported_features & reply.features;

        let mut inner = match self.lock_current(epoch).await {
            Some(inner) => inner,
            None => return Ok(ConnectOutcome::Superseded),
        };
        inner.state = ConnectionState::Open;
        inner.once_ready = true;
        inner.connect_seq = reply.connect_seq;
        inner.peer_global_seq = reply.global_seq;
        inner.features = features;
        inner.backoff.reset();
        if let Some(peer_in_seq) = peer_in_seq {
            inner.session.discard_requeued_up_to(peer_in_seq);
            inner.session.mark_in_seq_acked();
        }
        let in_seq = inner.session.in_seq();
        drop(inner);

        if peer_in_seq.is_some() {
            let mut output = BytesMut::new();
            write_in_seq(in_seq, &mut output);
            stream.write_all(&output).await?;
        }
        Ok(ConnectOutcome::Open(OpenSocket { stream, input, features }))
    }

    /// parks the connection in WAIT, giving the peer's connection attempt time to complete.
    ///  Returns false if that happened, i.e. this task was superseded.
    async fn wait_for_peer(&self, core: &MessengerCore, epoch: u64, superseded: &mut watch::Receiver<u64>) -> bool {
        match self.lock_current(epoch).await {
            Some(mut inner) => inner.state = ConnectionState::Wait,
            None => return false,
        }
        debug!("peer's connection attempt wins, waiting for it");

        select! {
            _ = sleep(core.config.wait_timeout) => {}
            _ = wait_superseded(superseded, epoch) => return false,
        }

        match self.lock_current(epoch).await {
            Some(mut inner) => {
                debug!("peer did not complete its connection attempt, dialing again");
                inner.state = ConnectionState::Connecting;
                true
            }
            None => false,
        }
    }

    async fn run_open(self: &Arc<Self>, core: &Arc<MessengerCore>, epoch: u64, superseded: &mut watch::Receiver<u64>, socket: OpenSocket) -> OpenExit {
        let OpenSocket { mut stream, mut input, features } = socket;
        debug!("socket is open with features {:?}", features);

        let with_crc = core.config.crc_data && features.contains(Features::DATA_CRC);
        let security = if features.contains(Features::MSG_AUTH) {
            Some(core.security.clone())
        }
        else {
            None
        };
        let mut reader = FrameReader::new(core.config.max_message_size, with_crc, security.clone());
        let writer = FrameWriter::new(with_crc, features.contains(Features::KEEPALIVE2), security);

        let mut keepalive = core.config.keepalive_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let wakeup = match self.lock_current(epoch).await {
            Some(inner) => inner.wakeup.clone(),
            None => return OpenExit::Superseded,
        };

        let mut output = BytesMut::new();
        let exit = self.open_loop(core, epoch, superseded, &wakeup, &mut stream, &mut input, &mut output, &mut reader, &writer, &mut keepalive).await;

        // a partially admitted message gives its throttle budget back
        drop(reader.abort());

        if let OpenExit::Superseded = exit {
            if self.inner.lock().await.state == ConnectionState::Closed {
                let mut close = BytesMut::new();
                writer.write_close(&mut close);
                let _ = stream.try_write(&close);
            }
        }
        exit
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_loop(
        self: &Arc<Self>,
        core: &Arc<MessengerCore>,
        epoch: u64,
        superseded: &mut watch::Receiver<u64>,
        wakeup: &Notify,
        stream: &mut TcpStream,
        input: &mut BytesMut,
        output: &mut BytesMut,
        reader: &mut FrameReader,
        writer: &FrameWriter,
        keepalive: &mut Option<Interval>,
    ) -> OpenExit {
        let ack_threshold = core.config.ack_threshold;

        loop {
            // process everything that was received
            loop {
                let event = match reader.poll(input) {
                    Ok(event) => event,
                    Err(e) => return OpenExit::Fault(e),
                };
                match event {
                    ReadEvent::NeedMore => break,
                    ReadEvent::AcquireMessage => {
                        match self.admit(core, epoch, superseded, &self.policy.message_throttle, 1).await {
                            Ok(held) => reader.admitted(held),
                            Err(exit) => return exit,
                        }
                    }
                    ReadEvent::AcquireBytes(n) => {
                        match self.admit(core, epoch, superseded, &self.policy.byte_throttle, n).await {
                            Ok(held) => reader.admitted(held),
                            Err(exit) => return exit,
                        }
                    }
                    ReadEvent::Keepalive => trace!("received keepalive"),
                    ReadEvent::Keepalive2(stamp) => {
                        match self.lock_current(epoch).await {
                            Some(mut inner) => inner.keepalive_ack_due = Some(stamp),
                            None => return OpenExit::Superseded,
                        }
                    }
                    ReadEvent::Keepalive2Ack(stamp) => {
                        trace!("received keepalive ack for {:?}", stamp);
                        match self.lock_current(epoch).await {
                            Some(mut inner) => inner.last_keepalive_ack = Some(Instant::now()),
                            None => return OpenExit::Superseded,
                        }
                    }
                    ReadEvent::Ack(seq) => {
                        match self.lock_current(epoch).await {
                            Some(mut inner) => inner.session.handle_ack(seq),
                            None => return OpenExit::Superseded,
                        }
                    }
                    ReadEvent::Message(received) => {
                        if let Err(exit) = self.deliver(core, epoch, received).await {
                            return exit;
                        }
                    }
                    ReadEvent::Close => return OpenExit::PeerClosed,
                }
            }

            // encode whatever is due, up to the soft limit
            {
                let mut inner = match self.lock_current(epoch).await {
                    Some(inner) => inner,
                    None => return OpenExit::Superseded,
                };
                while output.len() < core.config.write_buffer_soft_limit {
                    match inner.session.take_next() {
                        Some(message) => {
                            trace!(seq = message.seq, msg_type = message.msg_type, "writing message");
                            writer.write_message(&message, output);
                            inner.session.retain_sent(message);
                        }
                        None => break,
                    }
                }
                if let Some(seq) = inner.session.take_ack(ack_threshold, false) {
                    writer.write_ack(seq, output);
                }
                if mem::take(&mut inner.keepalive_requested) {
                    writer.write_keepalive(output);
                }
                if let Some(stamp) = inner.keepalive_ack_due.take() {
                    writer.write_keepalive_ack(stamp, output);
                }
            }

            let (mut read_half, mut write_half) = stream.split();
            select! {
                result = read_half.read_buf(input) => match result {
                    Ok(0) => return OpenExit::Fault(anyhow!("socket closed by peer")),
                    Ok(n) => trace!("read {} bytes", n),
                    Err(e) => return OpenExit::Fault(e.into()),
                },
                result = write_half.write_buf(output), if !output.is_empty() => {
                    if let Err(e) = result {
                        return OpenExit::Fault(e.into());
                    }
                }
                _ = wakeup.notified() => {}
                _ = wait_superseded(superseded, epoch) => return OpenExit::Superseded,
                _ = tick(keepalive) => {
                    match self.lock_current(epoch).await {
                        Some(mut inner) => {
                            inner.keepalive_requested = true;
                            // periodic flush of pending acks, regardless of the threshold
                            if let Some(seq) = inner.session.take_ack(ack_threshold, true) {
                                writer.write_ack(seq, output);
                            }
                        }
                        None => return OpenExit::Superseded,
                    }
                }
            }
        }
    }

    /// Blocks on a throttle for a message being received. This is where backpressure applies:
    ///  nothing else is read from this socket until the throttle admits the message.
    async fn admit(&self, core: &MessengerCore, epoch: u64, superseded: &mut watch::Receiver<u64>, throttle: &Option<Arc<Throttle>>, n: u64) -> Result<Option<(Arc<Throttle>, u32)>, OpenExit> {
        let throttle = match throttle {
            Some(throttle) => throttle,
            None => return Ok(None),
        };
        select! {
            result = throttle.acquire_with_timeout(n, core.config.throttle_timeout) => match result {
                Ok(amount) => Ok(Some((throttle.clone(), amount))),
                Err(e) => Err(OpenExit::Fault(e)),
            },
            _ = wait_superseded(superseded, epoch) => Err(OpenExit::Superseded),
        }
    }

    async fn deliver(self: &Arc<Self>, core: &MessengerCore, epoch: u64, received: ReceivedMessage) -> Result<(), OpenExit> {
        let ReceivedMessage { header, footer, front, middle, data, admission } = received;

        match self.lock_current(epoch).await {
            Some(mut inner) => match inner.session.accept_incoming(header.seq) {
                Ok(InboundSeq::Deliver) => {}
                Ok(InboundSeq::Duplicate) => return Ok(()),
                Err(e) => return Err(OpenExit::Fault(e)),
            },
            None => return Err(OpenExit::Superseded),
        }

        match core.registry.decode(&header, &footer, front, middle, data) {
            Some(message) => {
                trace!(seq = header.seq, msg_type = header.msg_type, "dispatching message");
                core.dispatcher.on_message(self.clone(), message).await;
            }
            None => {
                warn!(seq = header.seq, msg_type = header.msg_type, "registry could not decode message, dropping it");
            }
        }
        admission.release();
        Ok(())
    }
}

/// reads whatever is available, treating EOF as an error
pub(crate) async fn read_more(stream: &mut TcpStream, input: &mut BytesMut) -> anyhow::Result<()> {
    if stream.read_buf(input).await? == 0 {
        bail!("socket closed by peer");
    }
    Ok(())
}

/// completes once the session was handed over from `epoch`
async fn wait_superseded(superseded: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *superseded.borrow_and_update() != epoch {
            return;
        }
        if superseded.changed().await.is_err() {
            return;
        }
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::MessengerConfig;
    use crate::dispatch::{Dispatcher, MockDispatcher};
    use crate::message::Message;
    use crate::messenger::{Collaborators, Messenger};
    use crate::policy::{PeerType, Policy, PolicyTable};
    use crate::test_util::dispatcher::{DispatchEvent, RecordingDispatcher};
    use crate::test_util::raw_peer::{ScriptedAccepter, ScriptedAcceptedSocket};

    const SERVER: PeerType = PeerType(2);
    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn dialing_messenger(dispatcher: Arc<dyn Dispatcher>) -> Messenger {
        let mut config = MessengerConfig::new(([127, 0, 0, 1], 0).into());
        config.initial_backoff = Duration::from_millis(10);
        config.max_backoff = Duration::from_millis(100);
        config.keepalive_interval = None;
        Messenger::bind(config, PeerType(1), PolicyTable::new(Policy::lossless_client()), Collaborators::new(dispatcher)).await.unwrap()
    }

    fn reply(tag: ReplyTag) -> ConnectReplyMsg {
        ConnectReplyMsg::new(tag, Features::SUPPORTED_DEFAULT, MessengerConfig::DEFAULT_PROTOCOL_VERSION)
    }

    async fn next_connect(socket: &mut ScriptedAcceptedSocket) -> ConnectMsg {
        timeout(TIMEOUT, socket.next_connect()).await.unwrap().unwrap()
    }

    /// replies READY to `connect` and completes the sequence exchange
    async fn accept_ready(socket: &mut ScriptedAcceptedSocket, connect: &ConnectMsg) {
        let mut ready = reply(ReplyTag::Ready);
        ready.global_seq = connect.global_seq + 1;
        ready.connect_seq = connect.connect_seq + 1;
        socket.reply(&ready, Some(0)).await.unwrap();
        assert_eq!(timeout(TIMEOUT, socket.peer_in_seq()).await.unwrap().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_global_redials_with_higher_global_seq() {
        let dispatcher = RecordingDispatcher::new();
        let a = dialing_messenger(dispatcher.clone()).await;
        let accepter = ScriptedAccepter::bind(77).await.unwrap();

        a.send(accepter.addr(), SERVER, Message::new(1, "x")).await;
        let mut socket = accepter.accept().await.unwrap();
        let first = next_connect(&mut socket).await;
        assert!(first.global_seq < 10);

        let mut retry = reply(ReplyTag::RetryGlobal);
        retry.global_seq = 10;
        socket.reply(&retry, None).await.unwrap();

        let second = next_connect(&mut socket).await;
        assert!(second.global_seq > 10);
        assert_eq!(second.connect_seq, first.connect_seq);

        accept_ready(&mut socket, &second).await;
        dispatcher.wait_until("connect", TIMEOUT, |events| events.contains(&DispatchEvent::Connect(accepter.addr()))).await.unwrap();
        let status = a.connection(accepter.addr()).await.unwrap().status().await;
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.global_seq, second.global_seq);
        assert_eq!(status.connect_seq, second.connect_seq + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_session_redials_with_next_connect_seq() {
        let a = dialing_messenger(RecordingDispatcher::new()).await;
        let accepter = ScriptedAccepter::bind(77).await.unwrap();

        a.send(accepter.addr(), SERVER, Message::new(1, "x")).await;
        let mut socket = accepter.accept().await.unwrap();
        let first = next_connect(&mut socket).await;

        let mut retry = reply(ReplyTag::RetrySession);
        retry.connect_seq = 5;
        socket.reply(&retry, None).await.unwrap();

        let second = next_connect(&mut socket).await;
        assert_eq!(second.connect_seq, 6);
        assert_eq!(second.global_seq, first.global_seq);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_session_discards_queue() {
        let dispatcher = RecordingDispatcher::new();
        let a = dialing_messenger(dispatcher.clone()).await;
        let accepter = ScriptedAccepter::bind(77).await.unwrap();

        a.send(accepter.addr(), SERVER, Message::new(1, "x")).await;
        let mut socket = accepter.accept().await.unwrap();
        next_connect(&mut socket).await;

        let mut retry = reply(ReplyTag::RetrySession);
        retry.connect_seq = 4;
        socket.reply(&retry, None).await.unwrap();
        assert_eq!(next_connect(&mut socket).await.connect_seq, 5);

        socket.reply(&reply(ReplyTag::ResetSession), None).await.unwrap();
        let after_reset = next_connect(&mut socket).await;
        assert_eq!(after_reset.connect_seq, 0);

        assert_eq!(dispatcher.resets().await, vec![(accepter.addr(), true)]);
        let connection = a.connection(accepter.addr()).await.unwrap();
        assert_eq!(connection.status().await.num_queued, 0);

        accept_ready(&mut socket, &after_reset).await;
        dispatcher.wait_until("connect", TIMEOUT, |events| events.contains(&DispatchEvent::Connect(accepter.addr()))).await.unwrap();
        assert_eq!(connection.status().await.connect_seq, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_authorizer_rejected_twice_is_fatal() {
        let num_resets = Arc::new(AtomicUsize::new(0));
        let reset_notify = Arc::new(Notify::new());

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_on_connect().never();
        let resets = num_resets.clone();
        let notify = reset_notify.clone();
        dispatcher.expect_on_reset()
            .withf(|_, is_remote| !*is_remote)
            .returning(move |_, _| {
                resets.fetch_add(1, Ordering::SeqCst);
                notify.notify_one();
            });

        let a = dialing_messenger(Arc::new(dispatcher)).await;
        let accepter = ScriptedAccepter::bind(77).await.unwrap();

        a.send(accepter.addr(), SERVER, Message::new(1, "x")).await;
        let mut socket = accepter.accept().await.unwrap();
        next_connect(&mut socket).await;
        socket.reply(&reply(ReplyTag::BadAuthorizer), None).await.unwrap();
        next_connect(&mut socket).await;
        socket.reply(&reply(ReplyTag::BadAuthorizer), None).await.unwrap();

        // no third attempt: the connection is given up and the socket dropped
        assert!(timeout(TIMEOUT, socket.next_connect()).await.unwrap().is_err());
        timeout(TIMEOUT, reset_notify.notified()).await.unwrap();
        assert!(a.connection(accepter.addr()).await.is_none());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(num_resets.load(Ordering::SeqCst), 1);
    }
}
