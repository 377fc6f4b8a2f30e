use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::wire::features::Features;


/// The outcome code of a CONNECT-REPLY
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReplyTag {
    /// handshake accepted - the ack-seq exchange follows
    Ready = 1,
    /// the accepter has no (or a reset) session for the connecting peer: reset, then retry with
    ///  connect_seq 0
    ResetSession = 2,
    /// the accepter's own competing connection attempt wins: close this socket and wait for it
    Wait = 3,
    /// the connect_seq is stale: retry with a connect_seq above the one in the reply
    RetrySession = 4,
    /// the global_seq is stale: retry with a global_seq above the one in the reply
    RetryGlobal = 5,
    BadProtocolVersion = 10,
    BadAuthorizer = 11,
    /// the connecting side lacks features the accepter requires
    Features = 12,
}

/// Flags in CONNECT
pub const CONNECT_FLAG_LOSSY: u8 = 1;


/// Sent by the connecting side after the banner and address exchange, followed by
///  `authorizer_len` bytes of authorizer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectMsg {
    pub features: Features,
    pub host_type: u32,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_protocol: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}
impl ConnectMsg {
    pub const SERIALIZED_LEN: usize = 8 + 6*4 + 1;

    pub fn is_lossy(&self) -> bool {
        self.flags & CONNECT_FLAG_LOSSY != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.features.bits());
        buf.put_u32(self.host_type);
        buf.put_u32(self.global_seq);
        buf.put_u32(self.connect_seq);
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.authorizer_protocol);
        buf.put_u32(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    /// NB: This checks the declared authorizer length against the bound *before* the caller
    ///      reads (and allocates for) the authorizer itself
    pub fn deser(buf: &mut impl Buf, max_authorizer_len: u32) -> anyhow::Result<ConnectMsg> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated CONNECT: {} bytes", buf.remaining());
        }

        let result = ConnectMsg {
            features: Features::from_bits_retain(buf.get_u64()),
            host_type: buf.get_u32(),
            global_seq: buf.get_u32(),
            connect_seq: buf.get_u32(),
            protocol_version: buf.get_u32(),
            authorizer_protocol: buf.get_u32(),
            authorizer_len: buf.get_u32(),
            flags: buf.get_u8(),
        };

        if result.authorizer_len > max_authorizer_len {
            bail!("CONNECT declares an authorizer of {} bytes, maximum is {}", result.authorizer_len, max_authorizer_len);
        }
        Ok(result)
    }
}


/// Sent by the accepting side in response to a CONNECT, followed by `authorizer_len` bytes of
///  authorizer reply. A `Ready` reply is additionally followed by the accepter's `in_seq` (u64).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectReplyMsg {
    pub tag: ReplyTag,
    pub features: Features,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}
impl ConnectReplyMsg {
    pub const SERIALIZED_LEN: usize = 1 + 8 + 4*4 + 1;

    pub fn new(tag: ReplyTag, features: Features, protocol_version: u32) -> ConnectReplyMsg {
        ConnectReplyMsg {
            tag,
            features,
            global_seq: 0,
            connect_seq: 0,
            protocol_version,
            authorizer_len: 0,
            flags: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag.into());
        buf.put_u64(self.features.bits());
        buf.put_u32(self.global_seq);
        buf.put_u32(self.connect_seq);
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn deser(buf: &mut impl Buf, max_authorizer_len: u32) -> anyhow::Result<ConnectReplyMsg> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated CONNECT-REPLY: {} bytes", buf.remaining());
        }

        let raw_tag = buf.get_u8();
        let tag = match ReplyTag::try_from(raw_tag) {
            Ok(tag) => tag,
            Err(_) => bail!("invalid CONNECT-REPLY tag {}", raw_tag),
        };

        let result = ConnectReplyMsg {
            tag,
            features: Features::from_bits_retain(buf.get_u64()),
            global_seq: buf.get_u32(),
            connect_seq: buf.get_u32(),
            protocol_version: buf.get_u32(),
            authorizer_len: buf.get_u32(),
            flags: buf.get_u8(),
        };

        if result.authorizer_len > max_authorizer_len {
            bail!("CONNECT-REPLY declares an authorizer reply of {} bytes, maximum is {}", result.authorizer_len, max_authorizer_len);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn connect_msg() -> ConnectMsg {
        ConnectMsg {
            features: Features::RECONNECT_SEQ | Features::MSG_AUTH,
            host_type: 4,
            global_seq: 0x0102_0304,
            connect_seq: 7,
            protocol_version: 1,
            authorizer_protocol: 2,
            authorizer_len: 5,
            flags: CONNECT_FLAG_LOSSY,
        }
    }

    #[test]
    fn test_connect_layout() {
        let mut buf = BytesMut::new();
        connect_msg().ser(&mut buf);
        assert_eq!(buf.as_ref(), &[
            0,0,0,0,0,0,0,3,
            0,0,0,4,
            1,2,3,4,
            0,0,0,7,
            0,0,0,1,
            0,0,0,2,
            0,0,0,5,
            1,
        ]);
        assert_eq!(buf.len(), ConnectMsg::SERIALIZED_LEN);

        let deser = ConnectMsg::deser(&mut buf, 5).unwrap();
        assert_eq!(deser, connect_msg());
        assert!(deser.is_lossy());
    }

    #[rstest]
    #[case::truncated(ConnectMsg::SERIALIZED_LEN - 1, 100)]
    #[case::authorizer_too_long(ConnectMsg::SERIALIZED_LEN, 4)]
    fn test_connect_invalid(#[case] len: usize, #[case] max_authorizer_len: u32) {
        let mut buf = BytesMut::new();
        connect_msg().ser(&mut buf);
        let mut raw = &buf[..len];
        assert!(ConnectMsg::deser(&mut raw, max_authorizer_len).is_err());
    }

    #[rstest]
    #[case::ready(ReplyTag::Ready)]
    #[case::reset(ReplyTag::ResetSession)]
    #[case::wait(ReplyTag::Wait)]
    #[case::retry_session(ReplyTag::RetrySession)]
    #[case::retry_global(ReplyTag::RetryGlobal)]
    #[case::bad_proto(ReplyTag::BadProtocolVersion)]
    #[case::bad_auth(ReplyTag::BadAuthorizer)]
    #[case::features(ReplyTag::Features)]
    fn test_reply_ser_deser(#[case] tag: ReplyTag) {
        let reply = ConnectReplyMsg {
            tag,
            features: Features::KEEPALIVE2,
            global_seq: 9,
            connect_seq: 3,
            protocol_version: 1,
            authorizer_len: 0,
            flags: 0,
        };
        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(buf.len(), ConnectReplyMsg::SERIALIZED_LEN);
        assert_eq!(ConnectReplyMsg::deser(&mut buf, 0).unwrap(), reply);
    }

    #[test]
    fn test_reply_invalid_tag() {
        let mut buf = BytesMut::new();
        ConnectReplyMsg::new(ReplyTag::Ready, Features::empty(), 1).ser(&mut buf);
        buf[0] = 99;
        assert!(ConnectReplyMsg::deser(&mut buf, 0).is_err());
    }
}
