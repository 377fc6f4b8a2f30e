use anyhow::bail;
use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::safe_converter::SafeCast;

pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}


/// The first byte of every frame after the handshake
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameTag {
    Close = 6,
    Msg = 7,
    /// followed by the acknowledged sequence number (u64)
    Ack = 8,
    Keepalive = 9,
    /// followed by a [KeepaliveStamp]
    Keepalive2 = 14,
    /// followed by the [KeepaliveStamp] of the keepalive that is acknowledged
    Keepalive2Ack = 15,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeepaliveStamp {
    pub millis_since_epoch: u64,
}
impl KeepaliveStamp {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.millis_since_epoch);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<KeepaliveStamp> {
        Ok(KeepaliveStamp {
            millis_since_epoch: buf.try_get_u64()?,
        })
    }
}

/// The fixed-size header of a message frame. It declares all segment lengths up front so the
///  receiver never scans for delimiters, and it carries its own CRC over all preceding header
///  bytes.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct MessageHeader {
    pub seq: u64,
    pub tid: u64,
    pub msg_type: u16,
    pub priority: u8,
    pub version: u16,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    /// alignment hint for the data segment (e.g. the page offset the sender's data started at)
    pub data_off: u16,
    pub crc: u32,
}

impl MessageHeader {
    const CRC_COVERED_LEN: usize = 8 + 8 + 2 + 1 + 2 + 3*4 + 2;
    pub const SERIALIZED_LEN: usize = Self::CRC_COVERED_LEN + 4;

    /// total body length (front + middle + data) without risk of overflow
    pub fn body_len(&self) -> u64 {
        let front: u64 = self.front_len.safe_cast();
        let middle: u64 = self.middle_len.safe_cast();
        let data: u64 = self.data_len.safe_cast();
        front + middle + data
    }

    fn ser_crc_covered(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.seq);
        buf.put_u64(self.tid);
        buf.put_u16(self.msg_type);
        buf.put_u8(self.priority);
        buf.put_u16(self.version);
        buf.put_u32(self.front_len);
        buf.put_u32(self.middle_len);
        buf.put_u32(self.data_len);
        buf.put_u16(self.data_off);
    }

    /// the CRC over all fields except the CRC itself
    pub fn calc_crc(&self) -> u32 {
        let mut raw = Vec::with_capacity(Self::CRC_COVERED_LEN);
        self.ser_crc_covered(&mut raw);
        crc32c(&raw)
    }

    /// writes the header with a freshly computed CRC, ignoring the value of `self.crc`
    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut raw = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.ser_crc_covered(&mut raw);
        let crc = crc32c(&raw);
        buf.put_slice(&raw);
        buf.put_u32(crc);
    }

    /// Decodes and validates a header: the CRC must match, and the declared body length must
    ///  not exceed `max_message_size`.
    pub fn deser(buf: &mut impl Buf, max_message_size: u32) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated message header: {} bytes", buf.remaining());
        }

        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);

        let expected_crc = crc32c(&raw[..Self::CRC_COVERED_LEN]);

        let mut parse_buf = &raw[..];
        let header = MessageHeader {
            seq: parse_buf.get_u64(),
            tid: parse_buf.get_u64(),
            msg_type: parse_buf.get_u16(),
            priority: parse_buf.get_u8(),
            version: parse_buf.get_u16(),
            front_len: parse_buf.get_u32(),
            middle_len: parse_buf.get_u32(),
            data_len: parse_buf.get_u32(),
            data_off: parse_buf.get_u16(),
            crc: parse_buf.get_u32(),
        };

        if header.crc != expected_crc {
            bail!("message header CRC mismatch: expected {:08x}, was {:08x}", expected_crc, header.crc);
        }

        let max_message_size: u64 = max_message_size.safe_cast();
        if header.body_len() > max_message_size {
            bail!("message declares {} body bytes, maximum is {}", header.body_len(), max_message_size);
        }

        Ok(header)
    }
}

pub const FOOTER_FLAG_COMPLETE: u8 = 1;
/// segment CRCs were not computed by the sender and must not be checked
pub const FOOTER_FLAG_NOCRC: u8 = 2;

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct MessageFooter {
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    /// signature from the session security collaborator, 0 if not negotiated
    pub sig: u64,
    pub flags: u8,
}

impl MessageFooter {
    pub const SERIALIZED_LEN: usize = 3*4 + 8 + 1;

    pub fn for_segments(front: &[u8], middle: &[u8], data: &[u8], with_crc: bool) -> MessageFooter {
        if with_crc {
            MessageFooter {
                front_crc: crc32c(front),
                middle_crc: crc32c(middle),
                data_crc: crc32c(data),
                sig: 0,
                flags: FOOTER_FLAG_COMPLETE,
            }
        }
        else {
            MessageFooter {
                flags: FOOTER_FLAG_COMPLETE | FOOTER_FLAG_NOCRC,
                ..Default::default()
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FOOTER_FLAG_COMPLETE != 0
    }

    pub fn has_crc(&self) -> bool {
        self.flags & FOOTER_FLAG_NOCRC == 0
    }

    /// checks completeness and segment CRCs - a failure is a protocol violation
    pub fn verify_segments(&self, front: &[u8], middle: &[u8], data: &[u8], check_crc: bool) -> anyhow::Result<()> {
        if !self.is_complete() {
            bail!("message was aborted by the sender");
        }
        if !(check_crc && self.has_crc()) {
            return Ok(());
        }

        if crc32c(front) != self.front_crc {
            bail!("front CRC mismatch");
        }
        if crc32c(middle) != self.middle_crc {
            bail!("middle CRC mismatch");
        }
        if crc32c(data) != self.data_crc {
            bail!("data CRC mismatch");
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.front_crc);
        buf.put_u32(self.middle_crc);
        buf.put_u32(self.data_crc);
        buf.put_u64(self.sig);
        buf.put_u8(self.flags);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageFooter> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated message footer: {} bytes", buf.remaining());
        }
        Ok(MessageFooter {
            front_crc: buf.get_u32(),
            middle_crc: buf.get_u32(),
            data_crc: buf.get_u32(),
            sig: buf.get_u64(),
            flags: buf.get_u8(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            seq: 5,
            tid: 6,
            msg_type: 7,
            priority: 8,
            version: 9,
            front_len: 3,
            middle_len: 0,
            data_len: 4,
            data_off: 0,
            crc: 0,
        }
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        header().ser(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);
        assert_eq!(&buf[..MessageHeader::CRC_COVERED_LEN], &[
            0,0,0,0,0,0,0,5,
            0,0,0,0,0,0,0,6,
            0,7,
            8,
            0,9,
            0,0,0,3,
            0,0,0,0,
            0,0,0,4,
            0,0,
        ]);
        let crc = crc32c(&buf[..MessageHeader::CRC_COVERED_LEN]);
        assert_eq!(&buf[MessageHeader::CRC_COVERED_LEN..], &crc.to_be_bytes());

        let deser = MessageHeader::deser(&mut buf, 100).unwrap();
        assert_eq!(deser, MessageHeader { crc, ..header() });
        assert_eq!(deser.calc_crc(), crc);
    }

    #[rstest]
    #[case::seq(0)]
    #[case::msg_type(17)]
    #[case::front_len(24)]
    #[case::crc(MessageHeader::SERIALIZED_LEN - 1)]
    fn test_header_corrupted(#[case] offset: usize) {
        let mut buf = BytesMut::new();
        header().ser(&mut buf);
        buf[offset] ^= 0x10;
        assert!(MessageHeader::deser(&mut buf, u32::MAX).is_err());
    }

    #[rstest]
    #[case::exact(7, true)]
    #[case::one_below(6, false)]
    #[case::zero(0, false)]
    #[case::plenty(u32::MAX, true)]
    fn test_header_max_message_size(#[case] max_message_size: u32, #[case] expected_ok: bool) {
        let mut buf = BytesMut::new();
        header().ser(&mut buf);
        assert_eq!(MessageHeader::deser(&mut buf, max_message_size).is_ok(), expected_ok);
    }

    #[test]
    fn test_body_len_does_not_overflow() {
        let header = MessageHeader {
            front_len: u32::MAX,
            middle_len: u32::MAX,
            data_len: u32::MAX,
            ..Default::default()
        };
        assert_eq!(header.body_len(), 3 * u32::MAX as u64);
    }

    #[rstest]
    #[case::valid(b"abc", b"", b"data", true, FOOTER_FLAG_COMPLETE, None, true)]
    #[case::corrupt_front(b"abc", b"", b"data", true, FOOTER_FLAG_COMPLETE, Some(0), false)]
    #[case::corrupt_data(b"abc", b"", b"data", true, FOOTER_FLAG_COMPLETE, Some(2), false)]
    #[case::corrupt_but_unchecked(b"abc", b"", b"data", false, FOOTER_FLAG_COMPLETE, Some(2), true)]
    #[case::aborted(b"abc", b"", b"data", true, 0, None, false)]
    #[case::aborted_unchecked(b"abc", b"", b"data", false, 0, None, false)]
    fn test_verify_segments(
        #[case] front: &[u8],
        #[case] middle: &[u8],
        #[case] data: &[u8],
        #[case] check_crc: bool,
        #[case] flags: u8,
        #[case] corrupt_segment: Option<usize>,
        #[case] expected_ok: bool,
    ) {
        let mut footer = MessageFooter::for_segments(front, middle, data, true);
        footer.flags = flags;
        match corrupt_segment {
            Some(0) => footer.front_crc ^= 1,
            Some(1) => footer.middle_crc ^= 1,
            Some(_) => footer.data_crc ^= 1,
            None => {}
        }
        assert_eq!(footer.verify_segments(front, middle, data, check_crc).is_ok(), expected_ok);
    }

    #[test]
    fn test_nocrc_footer_is_not_checked() {
        let footer = MessageFooter::for_segments(b"abc", b"", b"", false);
        assert!(!footer.has_crc());
        footer.verify_segments(b"xyz", b"", b"", true).unwrap();
    }

    #[test]
    fn test_footer_ser_deser() {
        let mut footer = MessageFooter::for_segments(b"a", b"b", b"c", true);
        footer.sig = 0x1122_3344_5566_7788;
        let mut buf = BytesMut::new();
        footer.ser(&mut buf);
        assert_eq!(buf.len(), MessageFooter::SERIALIZED_LEN);
        assert_eq!(MessageFooter::deser(&mut buf).unwrap(), footer);
    }

    #[test]
    fn test_tags() {
        assert_eq!(FrameTag::try_from(7u8).unwrap(), FrameTag::Msg);
        assert!(FrameTag::try_from(0u8).is_err());
        assert_eq!(u8::from(FrameTag::Keepalive2Ack), 15);
    }
}
