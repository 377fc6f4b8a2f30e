use std::sync::Arc;
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};

use crate::message::Message;
use crate::security::SessionSecurity;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::frame::{FrameTag, KeepaliveStamp, MessageFooter, MessageHeader};

/// Encodes frames into a connection's write buffer, using the features negotiated for the
///  current socket
pub struct FrameWriter {
    with_crc: bool,
    keepalive2: bool,
    security: Option<Arc<dyn SessionSecurity>>,
}

impl FrameWriter {
    pub fn new(with_crc: bool, keepalive2: bool, security: Option<Arc<dyn SessionSecurity>>) -> FrameWriter {
        FrameWriter {
            with_crc,
            keepalive2,
            security,
        }
    }

    /// writes a message with the sequence number it was assigned
    pub fn write_message(&self, message: &Message, buf: &mut BytesMut) {
        let mut header = MessageHeader {
            seq: message.seq,
            tid: message.tid,
            msg_type: message.msg_type,
            priority: message.priority,
            version: message.version,
            front_len: message.front.len().prechecked_cast(),
            middle_len: message.middle.len().prechecked_cast(),
            data_len: message.data.len().prechecked_cast(),
            data_off: message.data_off,
            crc: 0,
        };
        header.crc = header.calc_crc();

        let mut footer = MessageFooter::for_segments(&message.front, &message.middle, &message.data, self.with_crc);
        if let Some(security) = &self.security {
            footer.sig = security.sign(&header, &footer);
        }

        buf.reserve(1 + MessageHeader::SERIALIZED_LEN + message.front.len() + message.middle.len() + message.data.len() + MessageFooter::SERIALIZED_LEN);
        buf.put_u8(FrameTag::Msg.into());
        header.ser(buf);
        buf.put_slice(&message.front);
        buf.put_slice(&message.middle);
        buf.put_slice(&message.data);
        footer.ser(buf);
    }

    pub fn write_ack(&self, seq: u64, buf: &mut BytesMut) {
        buf.put_u8(FrameTag::Ack.into());
        buf.put_u64(seq);
    }

    /// a timestamped keepalive if the peer supports it, a plain one otherwise
    pub fn write_keepalive(&self, buf: &mut BytesMut) {
        if self.keepalive2 {
            buf.put_u8(FrameTag::Keepalive2.into());
            now_stamp().ser(buf);
        }
        else {
            buf.put_u8(FrameTag::Keepalive.into());
        }
    }

    pub fn write_keepalive_ack(&self, stamp: KeepaliveStamp, buf: &mut BytesMut) {
        buf.put_u8(FrameTag::Keepalive2Ack.into());
        stamp.ser(buf);
    }

    pub fn write_close(&self, buf: &mut BytesMut) {
        buf.put_u8(FrameTag::Close.into());
    }
}

fn now_stamp() -> KeepaliveStamp {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    KeepaliveStamp { millis_since_epoch: millis }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::connection::reader::{FrameReader, ReadEvent};
    use crate::security::SharedSecretAuth;
    use crate::wire::frame::FOOTER_FLAG_NOCRC;
    use super::*;

    fn read_one(reader: &mut FrameReader, buf: &mut BytesMut) -> ReadEvent {
        loop {
            match reader.poll(buf).unwrap() {
                ReadEvent::AcquireMessage | ReadEvent::AcquireBytes(_) => reader.admitted(None),
                ReadEvent::NeedMore => panic!("incomplete frame"),
                other => return other,
            }
        }
    }

    #[rstest]
    #[case::plain(true, false)]
    #[case::no_crc(false, false)]
    #[case::signed(true, true)]
    fn test_message_is_readable(#[case] with_crc: bool, #[case] signed: bool) {
        let security: Option<Arc<dyn SessionSecurity>> = if signed {
            Some(Arc::new(SharedSecretAuth::new("secret")))
        }
        else {
            None
        };

        let message = Message {
            seq: 42,
            ..Message::new(9, "front")
                .with_middle("middle")
                .with_data("data", 3)
                .with_tid(8)
        };

        let writer = FrameWriter::new(with_crc, false, security.clone());
        let mut buf = BytesMut::new();
        writer.write_message(&message, &mut buf);

        let mut reader = FrameReader::new(1024, true, security);
        match read_one(&mut reader, &mut buf) {
            ReadEvent::Message(received) => {
                assert_eq!(received.header.seq, 42);
                assert_eq!(received.header.tid, 8);
                assert_eq!(received.header.data_off, 3);
                assert_eq!(received.front, message.front);
                assert_eq!(received.middle, message.middle);
                assert_eq!(received.data, message.data);
                assert_eq!(received.footer.flags & FOOTER_FLAG_NOCRC != 0, !with_crc);
                assert_eq!(received.footer.sig != 0, signed);
            }
            _ => panic!("expected a message"),
        }
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::keepalive2(true, FrameTag::Keepalive2, 9)]
    #[case::legacy(false, FrameTag::Keepalive, 1)]
    fn test_keepalive(#[case] keepalive2: bool, #[case] expected_tag: FrameTag, #[case] expected_len: usize) {
        let writer = FrameWriter::new(true, keepalive2, None);
        let mut buf = BytesMut::new();
        writer.write_keepalive(&mut buf);
        assert_eq!(buf[0], u8::from(expected_tag));
        assert_eq!(buf.len(), expected_len);
    }

    #[test]
    fn test_control_frames() {
        let writer = FrameWriter::new(true, true, None);
        let mut buf = BytesMut::new();
        writer.write_ack(77, &mut buf);
        writer.write_keepalive_ack(KeepaliveStamp { millis_since_epoch: 5 }, &mut buf);
        writer.write_close(&mut buf);

        let mut reader = FrameReader::new(1024, true, None);
        assert!(matches!(read_one(&mut reader, &mut buf), ReadEvent::Ack(77)));
        assert!(matches!(read_one(&mut reader, &mut buf), ReadEvent::Keepalive2Ack(KeepaliveStamp { millis_since_epoch: 5 })));
        assert!(matches!(read_one(&mut reader, &mut buf), ReadEvent::Close));
    }
}
