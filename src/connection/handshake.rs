use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::security::AuthorizerBlob;
use crate::util::safe_converter::SafeCast;
use crate::wire::features::Features;
use crate::wire::handshake::{ConnectMsg, ConnectReplyMsg, ReplyTag};
use crate::wire::peer_addr::PeerAddr;
use crate::wire::BANNER;

/// writes what the accepting side sends right away: banner, own address, and the connecting
///  side's address as observed on the socket
pub fn write_accepter_banner(my_addr: PeerAddr, observed_peer: PeerAddr, buf: &mut BytesMut) {
    buf.put_slice(BANNER);
    my_addr.ser(buf);
    observed_peer.ser(buf);
}

/// the sequence number exchange that completes a handshake
pub fn write_in_seq(in_seq: u64, buf: &mut BytesMut) {
    buf.put_u64(in_seq);
}

fn read_banner(input: &mut BytesMut) -> anyhow::Result<()> {
    let banner = input.split_to(BANNER.len());
    if banner.as_ref() != BANNER {
        bail!("peer sent invalid banner {:?}", banner.as_ref());
    }
    Ok(())
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectStep {
    WaitBanner,
    WaitIdentifyPeer,
    /// waiting for the caller to send (another) CONNECT
    SendConnect,
    WaitReply,
    WaitReplyAuth,
    WaitAckSeq,
    Ready,
}

pub enum ConnectEvent {
    NeedMore,
    /// The peer sent its banner and addresses. `my_observed` is this side's address as the peer
    ///  sees it, which is how a node bound to a blank IP learns its own.
    Identified { peer_claimed: PeerAddr, my_observed: PeerAddr },
    /// The peer replied to a CONNECT. For anything but a READY reply, the handshake is back in
    ///  `SendConnect`.
    Reply { reply: ConnectReplyMsg, authorizer_reply: Bytes },
    /// the peer's `in_seq`, completing the handshake
    PeerInSeq(u64),
}

/// The connecting side of the handshake, decoding what the accepting side sends. The caller
///  writes its own part when the events ask for it.
pub struct ConnectHandshake {
    step: ConnectStep,
    expected_peer: PeerAddr,
    my_features: Features,
    max_authorizer_len: u32,
    identity_sent: bool,
    reply: Option<ConnectReplyMsg>,
}

impl ConnectHandshake {
    pub fn new(expected_peer: PeerAddr, my_features: Features, max_authorizer_len: u32) -> ConnectHandshake {
        ConnectHandshake {
            step: ConnectStep::WaitBanner,
            expected_peer,
            my_features,
            max_authorizer_len,
            identity_sent: false,
            reply: None,
        }
    }

    pub fn step(&self) -> ConnectStep {
        self.step
    }

    /// Writes a CONNECT with its authorizer, preceded by banner and own address if this is the
    ///  first CONNECT on this socket.
    pub fn write_connect(&mut self, my_addr: PeerAddr, connect: &ConnectMsg, authorizer: &AuthorizerBlob, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.step != ConnectStep::SendConnect {
            bail!("CONNECT in handshake step {:?}", self.step);
        }
        if !self.identity_sent {
            buf.put_slice(BANNER);
            my_addr.ser(buf);
            self.identity_sent = true;
        }
        trace!("sending CONNECT {:?}", connect);
        connect.ser(buf);
        buf.put_slice(&authorizer.data);
        self.step = ConnectStep::WaitReply;
        Ok(())
    }

    fn wanted(&self) -> usize {
        match self.step {
            ConnectStep::WaitBanner => BANNER.len(),
            ConnectStep::WaitIdentifyPeer => 2 * PeerAddr::SERIALIZED_LEN,
            ConnectStep::WaitReply => ConnectReplyMsg::SERIALIZED_LEN,
            ConnectStep::WaitReplyAuth => self.reply.as_ref()
                .map_or(0, |r| r.authorizer_len.safe_cast()),
            ConnectStep::WaitAckSeq => 8,
            ConnectStep::SendConnect | ConnectStep::Ready => 0,
        }
    }

    /// Advances as far as the buffered bytes allow. A READY reply is followed by the `in_seq`
    ///  exchange if both sides support it.
    pub fn poll(&mut self, input: &mut BytesMut) -> anyhow::Result<ConnectEvent> {
        loop {
            if matches!(self.step, ConnectStep::SendConnect | ConnectStep::Ready) {
                bail!("nothing to read in handshake step {:?}", self.step);
            }
            if input.len() < self.wanted() {
                return Ok(ConnectEvent::NeedMore);
            }

            match self.step {
                ConnectStep::WaitBanner => {
                    read_banner(input)?;
                    self.step = ConnectStep::WaitIdentifyPeer;
                }
                ConnectStep::WaitIdentifyPeer => {
                    let peer_claimed = PeerAddr::try_deser(input)?;
                    let my_observed = PeerAddr::try_deser(input)?;
                    if peer_claimed.nonce != self.expected_peer.nonce {
                        bail!("connected to wrong node: expected {:?}, peer claims to be {:?}", self.expected_peer, peer_claimed);
                    }
                    debug!("peer identified as {:?}, observes us as {:?}", peer_claimed, my_observed);
                    self.step = ConnectStep::SendConnect;
                    return Ok(ConnectEvent::Identified { peer_claimed, my_observed });
                }
                ConnectStep::WaitReply => {
                    self.reply = Some(ConnectReplyMsg::deser(input, self.max_authorizer_len)?);
                    self.step = ConnectStep::WaitReplyAuth;
                }
                ConnectStep::WaitReplyAuth => {
                    let authorizer_reply = input.split_to(self.wanted()).freeze();
                    let reply = match self.reply.take() {
                        Some(reply) => reply,
                        None => bail!("reply authorizer without reply"),
                    };
                    trace!("received CONNECT-REPLY {:?}", reply);

                    let seq_exchange = (self.my_features & reply.features).contains(Features::RECONNECT_SEQ);
                    self.step = match reply.tag {
                        ReplyTag::Ready if seq_exchange => ConnectStep::WaitAckSeq,
                        ReplyTag::Ready => ConnectStep::Ready,
                        _ => ConnectStep::SendConnect,
                    };
                    return Ok(ConnectEvent::Reply { reply, authorizer_reply });
                }
                ConnectStep::WaitAckSeq => {
                    self.step = ConnectStep::Ready;
                    return Ok(ConnectEvent::PeerInSeq(input.get_u64()));
                }
                ConnectStep::SendConnect | ConnectStep::Ready => unreachable!("checked above"),
            }
        }
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AcceptStep {
    WaitBannerAddr,
    WaitConnectMsg,
    WaitConnectAuth,
    /// waiting for the caller to decide on a CONNECT and reply to it
    Decide,
    WaitSeq,
    Ready,
}

pub enum AcceptEvent {
    NeedMore,
    /// the peer's address as it claims it, with a blank IP replaced by the observed one
    Identified { peer_addr: PeerAddr },
    Connect { connect: ConnectMsg, authorizer: AuthorizerBlob },
    PeerInSeq(u64),
}

/// The accepting side of the handshake
pub struct AcceptHandshake {
    step: AcceptStep,
    observed_peer: PeerAddr,
    max_authorizer_len: u32,
    connect: Option<ConnectMsg>,
}

impl AcceptHandshake {
    pub fn new(observed_peer: PeerAddr, max_authorizer_len: u32) -> AcceptHandshake {
        AcceptHandshake {
            step: AcceptStep::WaitBannerAddr,
            observed_peer,
            max_authorizer_len,
            connect: None,
        }
    }

    pub fn step(&self) -> AcceptStep {
        self.step
    }

    /// Writes the reply to the last CONNECT. After anything but a READY reply, the peer may send
    ///  another CONNECT. After a READY reply with sequence exchange, `in_seq` is our own receive
    ///  sequence number, which is sent along.
    pub fn write_reply(&mut self, reply: &ConnectReplyMsg, authorizer_reply: &[u8], in_seq: Option<u64>, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.step != AcceptStep::Decide {
            bail!("CONNECT-REPLY in handshake step {:?}", self.step);
        }
        trace!("sending CONNECT-REPLY {:?}", reply);
        reply.ser(buf);
        buf.put_slice(authorizer_reply);

        self.step = match (reply.tag, in_seq) {
            (ReplyTag::Ready, Some(in_seq)) => {
                write_in_seq(in_seq, buf);
                AcceptStep::WaitSeq
            }
            (ReplyTag::Ready, None) => AcceptStep::Ready,
            _ => AcceptStep::WaitConnectMsg,
        };
        Ok(())
    }

    fn wanted(&self) -> usize {
        match self.step {
            AcceptStep::WaitBannerAddr => BANNER.len() + PeerAddr::SERIALIZED_LEN,
            AcceptStep::WaitConnectMsg => ConnectMsg::SERIALIZED_LEN,
            AcceptStep::WaitConnectAuth => self.connect.as_ref()
                .map_or(0, |c| c.authorizer_len.safe_cast()),
            AcceptStep::WaitSeq => 8,
            AcceptStep::Decide | AcceptStep::Ready => 0,
        }
    }

    pub fn poll(&mut self, input: &mut BytesMut) -> anyhow::Result<AcceptEvent> {
        loop {
            if matches!(self.step, AcceptStep::Decide | AcceptStep::Ready) {
                bail!("nothing to read in handshake step {:?}", self.step);
            }
            if input.len() < self.wanted() {
                return Ok(AcceptEvent::NeedMore);
            }

            match self.step {
                AcceptStep::WaitBannerAddr => {
                    read_banner(input)?;
                    let mut peer_addr = PeerAddr::try_deser(input)?;
                    if peer_addr.set_ip_if_blank(self.observed_peer.socket_addr.ip()) {
                        debug!("peer does not know its own IP, using observed address {:?}", peer_addr);
                    }
                    self.step = AcceptStep::WaitConnectMsg;
                    return Ok(AcceptEvent::Identified { peer_addr });
                }
                AcceptStep::WaitConnectMsg => {
                    self.connect = Some(ConnectMsg::deser(input, self.max_authorizer_len)?);
                    self.step = AcceptStep::WaitConnectAuth;
                }
                AcceptStep::WaitConnectAuth => {
                    let data = input.split_to(self.wanted()).freeze();
                    let connect = match self.connect.take() {
                        Some(connect) => connect,
                        None => bail!("authorizer without CONNECT"),
                    };
                    trace!("received CONNECT {:?}", connect);
                    self.step = AcceptStep::Decide;
                    let authorizer = AuthorizerBlob {
                        protocol: connect.authorizer_protocol,
                        data,
                    };
                    return Ok(AcceptEvent::Connect { connect, authorizer });
                }
                AcceptStep::WaitSeq => {
                    self.step = AcceptStep::Ready;
                    return Ok(AcceptEvent::PeerInSeq(input.get_u64()));
                }
                AcceptStep::Decide | AcceptStep::Ready => unreachable!("checked above"),
            }
        }
    }
}
