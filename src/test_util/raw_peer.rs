use std::net::SocketAddr;

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::connection::handshake::{write_accepter_banner, write_in_seq, AcceptEvent, AcceptHandshake, ConnectEvent, ConnectHandshake};
use crate::connection::read_more;
use crate::security::AuthorizerBlob;
use crate::wire::features::Features;
use crate::wire::handshake::{ConnectMsg, ConnectReplyMsg};
use crate::wire::peer_addr::PeerAddr;

const MAX_AUTHORIZER_LEN: u32 = 4096;

/// A hand-driven accepting side of the handshake. Tests use it to reply to a messenger's
///  CONNECTs with whatever outcome they want to exercise.
pub struct ScriptedAccepter {
    listener: TcpListener,
    my_addr: PeerAddr,
}

impl ScriptedAccepter {
    pub async fn bind(nonce: u32) -> anyhow::Result<ScriptedAccepter> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let my_addr = PeerAddr::new(listener.local_addr()?, nonce);
        Ok(ScriptedAccepter { listener, my_addr })
    }

    pub fn addr(&self) -> PeerAddr {
        self.my_addr
    }

    /// accepts the next socket and completes the address exchange on it
    pub async fn accept(&self) -> anyhow::Result<ScriptedAcceptedSocket> {
        let (mut stream, remote) = self.listener.accept().await?;
        let observed = PeerAddr::new(remote, 0);

        let mut output = BytesMut::new();
        write_accepter_banner(self.my_addr, observed, &mut output);
        stream.write_all(&output).await?;

        let mut handshake = AcceptHandshake::new(observed, MAX_AUTHORIZER_LEN);
        let mut input = BytesMut::new();
        loop {
            match handshake.poll(&mut input)? {
                AcceptEvent::NeedMore => read_more(&mut stream, &mut input).await?,
                AcceptEvent::Identified { peer_addr } => {
                    debug!(peer = ?peer_addr, "scripted accepter identified peer");
                    return Ok(ScriptedAcceptedSocket { stream, handshake, input, peer_addr });
                }
                _ => bail!("unexpected handshake event before identification"),
            }
        }
    }
}

pub struct ScriptedAcceptedSocket {
    stream: TcpStream,
    handshake: AcceptHandshake,
    input: BytesMut,
    pub peer_addr: PeerAddr,
}

impl ScriptedAcceptedSocket {
    /// the next CONNECT, or an error if the peer closed the socket instead
    pub async fn next_connect(&mut self) -> anyhow::Result<ConnectMsg> {
        loop {
            match self.handshake.poll(&mut self.input)? {
                AcceptEvent::NeedMore => read_more(&mut self.stream, &mut self.input).await?,
                AcceptEvent::Connect { connect, .. } => return Ok(connect),
                _ => bail!("expected a CONNECT"),
            }
        }
    }

    pub async fn reply(&mut self, reply: &ConnectReplyMsg, in_seq: Option<u64>) -> anyhow::Result<()> {
        let mut output = BytesMut::new();
        self.handshake.write_reply(reply, &[], in_seq, &mut output)?;
        self.stream.write_all(&output).await?;
        Ok(())
    }

    /// the connecting side's `in_seq` that follows a READY reply with sequence exchange
    pub async fn peer_in_seq(&mut self) -> anyhow::Result<u64> {
        loop {
            match self.handshake.poll(&mut self.input)? {
                AcceptEvent::NeedMore => read_more(&mut self.stream, &mut self.input).await?,
                AcceptEvent::PeerInSeq(in_seq) => return Ok(in_seq),
                _ => bail!("expected the peer's in_seq"),
            }
        }
    }
}

/// A hand-driven connecting side of the handshake, for tests that need to stop a handshake
///  half-way
pub struct ScriptedConnector {
    stream: TcpStream,
    handshake: ConnectHandshake,
    input: BytesMut,
    my_addr: PeerAddr,
}

impl ScriptedConnector {
    /// dials `peer` and completes the address exchange
    pub async fn connect(my_addr: PeerAddr, peer: PeerAddr) -> anyhow::Result<ScriptedConnector> {
        let mut stream = TcpStream::connect(peer.socket_addr).await?;
        let mut handshake = ConnectHandshake::new(peer, Features::SUPPORTED_DEFAULT, MAX_AUTHORIZER_LEN);
        let mut input = BytesMut::new();
        loop {
            match handshake.poll(&mut input)? {
                ConnectEvent::NeedMore => read_more(&mut stream, &mut input).await?,
                ConnectEvent::Identified { .. } => {
                    return Ok(ScriptedConnector { stream, handshake, input, my_addr });
                }
                _ => bail!("unexpected handshake event before identification"),
            }
        }
    }

    /// sends a CONNECT without authorizer and returns the reply
    pub async fn send_connect(&mut self, connect: &ConnectMsg) -> anyhow::Result<ConnectReplyMsg> {
        let mut output = BytesMut::new();
        self.handshake.write_connect(self.my_addr, connect, &AuthorizerBlob::default(), &mut output)?;
        self.stream.write_all(&output).await?;

        loop {
            match self.handshake.poll(&mut self.input)? {
                ConnectEvent::NeedMore => read_more(&mut self.stream, &mut self.input).await?,
                ConnectEvent::Reply { reply, .. } => return Ok(reply),
                _ => bail!("expected a CONNECT-REPLY"),
            }
        }
    }

    /// completes the sequence exchange after a READY reply
    pub async fn send_in_seq(&mut self, in_seq: u64) -> anyhow::Result<()> {
        let mut output = BytesMut::new();
        write_in_seq(in_seq, &mut output);
        self.stream.write_all(&output).await?;
        Ok(())
    }
}
