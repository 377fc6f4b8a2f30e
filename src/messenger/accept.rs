use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::connection::handshake::{write_accepter_banner, AcceptEvent, AcceptHandshake};
use crate::connection::session::initial_out_seq;
use crate::connection::{read_more, AcceptParams, Connection, OpenSocket};
use crate::messenger::race::{resolve_connect, ConnectDecision};
use crate::messenger::MessengerCore;
use crate::policy::PeerType;
use crate::security::{AuthVerdict, AuthorizerBlob};
use crate::util::random::RngRandom;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::features::Features;
use crate::wire::handshake::{ConnectMsg, ConnectReplyMsg, ReplyTag, CONNECT_FLAG_LOSSY};
use crate::wire::peer_addr::PeerAddr;

pub(crate) async fn accept_loop(core: Arc<MessengerCore>, listener: TcpListener) {
    info!("accepting connections on {:?}", core.my_addr());
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if core.is_shut_down() {
                    return;
                }
                tokio::spawn(handle_accept(core.clone(), stream, remote));
            }
            Err(e) => {
                error!("error accepting connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// The outcome of evaluating one CONNECT
enum Negotiated {
    /// anything but READY: the peer may try again on the same socket
    Reply { reply: ConnectReplyMsg, authorizer_reply: Bytes },
    Accepted(Accepted),
}

struct Accepted {
    connection: Arc<Connection>,
    epoch: u64,
    reply: ConnectReplyMsg,
    authorizer_reply: Bytes,
    session_reset: bool,
    in_seq: u64,
}

#[instrument(name = "accepted_connection", skip_all, fields(remote = ?remote))]
async fn handle_accept(core: Arc<MessengerCore>, stream: TcpStream, remote: SocketAddr) {
    debug!("accepted socket");
    if let Err(e) = stream.set_nodelay(core.config.tcp_nodelay) {
        warn!("could not configure socket: {}", e);
        return;
    }

    // the connection this handshake took over, if any: it must be released if the handshake fails
    let mut claimed: Option<(Arc<Connection>, u64)> = None;

    let result = match timeout(core.config.handshake_timeout, accept_handshake(&core, stream, remote, &mut claimed)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("handshake timed out")),
    };

    match result {
        Ok(Some(connection)) => {
            info!(peer = ?connection.peer_addr(), "accepted connection");
        }
        Ok(None) => {}
        Err(e) => {
            info!("handshake failed: {:#}", e);
            if let Some((connection, epoch)) = claimed {
                connection.accept_failed(&core, epoch).await;
            }
        }
    }
}

/// Runs the accepting side of the handshake. Returns the connection the socket was attached to,
///  or None if it was taken over concurrently.
async fn accept_handshake(core: &Arc<MessengerCore>, mut stream: TcpStream, remote: SocketAddr, claimed: &mut Option<(Arc<Connection>, u64)>) -> anyhow::Result<Option<Arc<Connection>>> {
    let observed_peer = PeerAddr::new(remote, 0);
    let mut output = BytesMut::new();
    write_accepter_banner(core.my_addr(), observed_peer, &mut output);
    stream.write_all(&output).await?;
    output.clear();

    let mut handshake = AcceptHandshake::new(observed_peer, core.config.max_authorizer_len);
    let mut input = BytesMut::with_capacity(4096);
    let mut peer_addr = None;
    let mut accepted: Option<(Arc<Connection>, Features)> = None;

    loop {
        match handshake.poll(&mut input)? {
            AcceptEvent::NeedMore => {
                read_more(&mut stream, &mut input).await?;
            }
            AcceptEvent::Identified { peer_addr: addr } => {
                debug!(peer = ?addr, "peer identified");
                peer_addr = Some(addr);
            }
            AcceptEvent::Connect { connect, authorizer } => {
                let peer = peer_addr.ok_or_else(|| anyhow!("CONNECT before identification"))?;

                match negotiate(core, peer, &connect, &authorizer).await {
                    Negotiated::Reply { reply, authorizer_reply } => {
                        debug!("replying {:?} to CONNECT {:?}", reply.tag, connect);
                        handshake.write_reply(&reply, &authorizer_reply, None, &mut output)?;
                        stream.write_all(&output).await?;
                        output.clear();
                    }
                    Negotiated::Accepted(a) => {
                        *claimed = Some((a.connection.clone(), a.epoch));
                        if a.session_reset {
                            core.dispatcher.on_reset(a.connection.clone(), true).await;
                        }

                        let features = a.reply.features;
                        let seq_exchange = features.contains(Features::RECONNECT_SEQ);
                        handshake.write_reply(&a.reply, &a.authorizer_reply, seq_exchange.then_some(a.in_seq), &mut output)?;
                        stream.write_all(&output).await?;
                        output.clear();

                        if !seq_exchange {
                            return attach(core, a.connection, a.epoch, stream, input, features, None).await;
                        }
                        accepted = Some((a.connection, features));
                    }
                }
            }
            AcceptEvent::PeerInSeq(peer_in_seq) => {
                let (connection, features) = match accepted.take() {
                    Some(accepted) => accepted,
                    None => return Err(anyhow!("sequence exchange without READY")),
                };
                let epoch = match claimed {
                    Some((_, epoch)) => *epoch,
                    None => return Err(anyhow!("sequence exchange without a claimed connection")),
                };
                return attach(core, connection, epoch, stream, input, features, Some(peer_in_seq)).await;
            }
        }
    }
}

async fn attach(core: &Arc<MessengerCore>, connection: Arc<Connection>, epoch: u64, stream: TcpStream, input: BytesMut, features: Features, peer_in_seq: Option<u64>) -> anyhow::Result<Option<Arc<Connection>>> {
    let socket = OpenSocket { stream, input, features };
    if connection.attach(core.clone(), epoch, socket, peer_in_seq).await {
        Ok(Some(connection))
    }
    else {
        debug!("connection was taken over while accepting, dropping socket");
        Ok(None)
    }
}

fn reply_msg(core: &MessengerCore, tag: ReplyTag, features: Features) -> ConnectReplyMsg {
    ConnectReplyMsg::new(tag, features, core.config.protocol_version)
}

/// Evaluates a CONNECT: protocol and authorization checks first, then the decision against the
///  registered connection for the peer, which is taken over if the CONNECT is accepted.
async fn negotiate(core: &Arc<MessengerCore>, peer: PeerAddr, connect: &ConnectMsg, authorizer: &AuthorizerBlob) -> Negotiated {
    let peer_type = PeerType(connect.host_type);
    let mut policy = core.policies.get(peer_type).clone();
    if connect.is_lossy() {
        policy.lossy = true;
    }

    if connect.protocol_version != core.config.protocol_version {
        warn!("peer uses protocol version {}, ours is {}", connect.protocol_version, core.config.protocol_version);
        return Negotiated::Reply { reply: reply_msg(core, ReplyTag::BadProtocolVersion, policy.supported_features), authorizer_reply: Bytes::new() };
    }

    let missing = connect.features.missing(policy.required_features);
    if !missing.is_empty() {
        warn!("peer lacks required features {:?}", missing);
        return Negotiated::Reply { reply: reply_msg(core, ReplyTag::Features, policy.required_features), authorizer_reply: Bytes::new() };
    }

    let authorizer_reply = match core.authorizer.verify(peer_type, authorizer) {
        AuthVerdict::Accepted { reply } => reply,
        AuthVerdict::Rejected { reply: authorizer_reply } => {
            warn!("rejecting peer's authorizer");
            let mut rejected = reply_msg(core, ReplyTag::BadAuthorizer, policy.supported_features);
            rejected.authorizer_len = authorizer_reply.len().prechecked_cast();
            return Negotiated::Reply { reply: rejected, authorizer_reply };
        }
    };

    let mut connections = core.connections.lock().await;
    let existing = connections.get(&peer).cloned();

    let mut existing_inner = match &existing {
        Some(existing) => Some(existing.lock_inner().await),
        None => None,
    };
    let view = match (&existing, &existing_inner) {
        (Some(existing), Some(inner)) => Some(existing.view(inner)),
        _ => None,
    };

    let decision = resolve_connect(view.as_ref(), connect, peer, core.my_addr(), policy.resetcheck);
    debug!(?decision, ?view, "evaluated CONNECT {:?}", connect);

    let mut response = reply_msg(core, ReplyTag::Ready, policy.supported_features & connect.features);
    response.authorizer_len = authorizer_reply.len().prechecked_cast();

    match decision {
        ConnectDecision::RetryGlobal(global_seq) => {
            response.tag = ReplyTag::RetryGlobal;
            response.global_seq = global_seq;
            return Negotiated::Reply { reply: response, authorizer_reply };
        }
        ConnectDecision::RetrySession(connect_seq) => {
            response.tag = ReplyTag::RetrySession;
            response.connect_seq = connect_seq;
            return Negotiated::Reply { reply: response, authorizer_reply };
        }
        ConnectDecision::ResetSession => {
            response.tag = ReplyTag::ResetSession;
            return Negotiated::Reply { reply: response, authorizer_reply };
        }
        ConnectDecision::Wait => {
            response.tag = ReplyTag::Wait;
            return Negotiated::Reply { reply: response, authorizer_reply };
        }
        ConnectDecision::New | ConnectDecision::Replace { .. } => {}
    }

    let reset_session = matches!(decision, ConnectDecision::Replace { reset_session: true });
    let connection = match (decision, existing.clone()) {
        (ConnectDecision::Replace { .. }, Some(existing)) => existing,
        _ => {
            drop(existing_inner.take());
            let connection = Connection::new(core, peer, peer_type, policy);
            connections.insert(peer, connection.clone());
            connection
        }
    };

    // the connection's own policy applies to a connection that was registered before
    response.features = connection.policy().supported_features & connect.features;
    response.global_seq = core.next_global_seq(connect.global_seq);
    response.connect_seq = connect.connect_seq + 1;
    if connection.policy().lossy {
        response.flags |= CONNECT_FLAG_LOSSY;
    }

    let params = AcceptParams {
        connect_seq: response.connect_seq,
        global_seq: response.global_seq,
        peer_global_seq: connect.global_seq,
        features: response.features,
    };
    let reset_out_seq = reset_session.then(|| initial_out_seq::<RngRandom>(core.config.randomize_out_seq));

    let (epoch, in_seq) = match existing_inner.as_mut() {
        Some(inner) => {
            let epoch = connection.begin_replace(inner, &params, reset_out_seq);
            (epoch, inner.session.in_seq())
        }
        None => {
            let mut inner = connection.lock_inner().await;
            let epoch = connection.begin_replace(&mut inner, &params, reset_out_seq);
            (epoch, inner.session.in_seq())
        }
    };

    Negotiated::Accepted(Accepted {
        connection,
        epoch,
        reply: response,
        authorizer_reply,
        session_reset: reset_session,
        in_seq,
    })
}
