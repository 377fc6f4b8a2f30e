use std::mem;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::security::SessionSecurity;
use crate::throttle::{Admission, Throttle};
use crate::util::safe_converter::SafeCast;
use crate::wire::frame::{FrameTag, KeepaliveStamp, MessageFooter, MessageHeader};

/// Where the reader is within the current frame
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadState {
    /// waiting for the next tag byte
    Tag,
    Keepalive2,
    Keepalive2Ack,
    Ack,
    MsgHeader,
    /// waiting for the message-count throttle to admit the message
    ThrottleMessage,
    /// waiting for the byte throttle to admit the message body
    ThrottleBytes,
    Front,
    Middle,
    Data,
    Footer,
    /// the peer sent CLOSE, nothing more is read
    Closed,
}

/// A message that was read completely and passed all integrity checks
pub struct ReceivedMessage {
    pub header: MessageHeader,
    pub footer: MessageFooter,
    pub front: Bytes,
    pub middle: Bytes,
    pub data: Bytes,
    /// throttle budget held by this message, to be released once it was dispatched
    pub admission: Admission,
}

pub enum ReadEvent {
    /// more bytes are needed to make progress
    NeedMore,
    /// the message-count throttle must be acquired, then [FrameReader::admitted] called
    AcquireMessage,
    /// the byte throttle must be acquired for the given number of bytes, then
    ///  [FrameReader::admitted] called
    AcquireBytes(u64),
    Keepalive,
    Keepalive2(KeepaliveStamp),
    Keepalive2Ack(KeepaliveStamp),
    Ack(u64),
    Message(ReceivedMessage),
    Close,
}

/// Decodes frames from the bytes read from an open socket. This does no I/O: the caller appends
///  whatever arrived to the input buffer and polls until the reader needs more, so frames may
///  arrive in chunks of any size.
pub struct FrameReader {
    state: ReadState,
    max_message_size: u32,
    check_crc: bool,
    security: Option<Arc<dyn SessionSecurity>>,

    header: MessageHeader,
    front: Bytes,
    middle: Bytes,
    data: Bytes,
    admission: Admission,
}

impl FrameReader {
    pub fn new(max_message_size: u32, check_crc: bool, security: Option<Arc<dyn SessionSecurity>>) -> FrameReader {
        FrameReader {
            state: ReadState::Tag,
            max_message_size,
            check_crc,
            security,
            header: MessageHeader::default(),
            front: Bytes::new(),
            middle: Bytes::new(),
            data: Bytes::new(),
            admission: Admission::default(),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// the number of buffered bytes the current state needs before it can make progress
    pub fn wanted(&self) -> usize {
        match self.state {
            ReadState::Tag => 1,
            ReadState::Keepalive2 | ReadState::Keepalive2Ack => KeepaliveStamp::SERIALIZED_LEN,
            ReadState::Ack => 8,
            ReadState::MsgHeader => MessageHeader::SERIALIZED_LEN,
            ReadState::ThrottleMessage | ReadState::ThrottleBytes | ReadState::Closed => 0,
            ReadState::Front => self.header.front_len.safe_cast(),
            ReadState::Middle => self.header.middle_len.safe_cast(),
            ReadState::Data => self.header.data_len.safe_cast(),
            ReadState::Footer => MessageFooter::SERIALIZED_LEN,
        }
    }

    /// Advances as far as the buffered bytes allow, consuming them from `input`. An error is a
    ///  protocol violation, and the reader must not be used after it.
    pub fn poll(&mut self, input: &mut BytesMut) -> anyhow::Result<ReadEvent> {
        loop {
            match self.state {
                ReadState::ThrottleMessage => return Ok(ReadEvent::AcquireMessage),
                ReadState::ThrottleBytes => return Ok(ReadEvent::AcquireBytes(self.header.body_len())),
                ReadState::Closed => bail!("read after CLOSE"),
                _ => {}
            }

            if input.len() < self.wanted() {
                return Ok(ReadEvent::NeedMore);
            }

            match self.state {
                ReadState::Tag => {
                    let raw_tag = input.get_u8();
                    let tag = match FrameTag::try_from(raw_tag) {
                        Ok(tag) => tag,
                        Err(_) => bail!("unexpected tag {}", raw_tag),
                    };
                    trace!("received tag {:?}", tag);
                    match tag {
                        FrameTag::Msg => self.state = ReadState::MsgHeader,
                        FrameTag::Ack => self.state = ReadState::Ack,
                        FrameTag::Keepalive2 => self.state = ReadState::Keepalive2,
                        FrameTag::Keepalive2Ack => self.state = ReadState::Keepalive2Ack,
                        FrameTag::Keepalive => return Ok(ReadEvent::Keepalive),
                        FrameTag::Close => {
                            self.state = ReadState::Closed;
                            return Ok(ReadEvent::Close);
                        }
                    }
                }
                ReadState::Ack => {
                    self.state = ReadState::Tag;
                    return Ok(ReadEvent::Ack(input.get_u64()));
                }
                ReadState::Keepalive2 => {
                    self.state = ReadState::Tag;
                    return Ok(ReadEvent::Keepalive2(KeepaliveStamp::deser(input)?));
                }
                ReadState::Keepalive2Ack => {
                    self.state = ReadState::Tag;
                    return Ok(ReadEvent::Keepalive2Ack(KeepaliveStamp::deser(input)?));
                }
                ReadState::MsgHeader => {
                    self.header = MessageHeader::deser(input, self.max_message_size)?;
                    trace!("received message header {:?}", self.header);
                    self.state = ReadState::ThrottleMessage;
                }
                ReadState::Front => {
                    self.front = self.take_segment(input, self.header.front_len);
                    self.state = ReadState::Middle;
                }
                ReadState::Middle => {
                    self.middle = self.take_segment(input, self.header.middle_len);
                    self.state = ReadState::Data;
                }
                ReadState::Data => {
                    self.data = self.take_segment(input, self.header.data_len);
                    self.state = ReadState::Footer;
                }
                ReadState::Footer => {
                    let footer = MessageFooter::deser(input)?;
                    footer.verify_segments(&self.front, &self.middle, &self.data, self.check_crc)?;
                    if let Some(security) = &self.security {
                        if !security.verify(&self.header, &footer) {
                            bail!("message signature check failed for seq {}", self.header.seq);
                        }
                    }

                    self.state = ReadState::Tag;
                    return Ok(ReadEvent::Message(ReceivedMessage {
                        header: mem::take(&mut self.header),
                        footer,
                        front: mem::take(&mut self.front),
                        middle: mem::take(&mut self.middle),
                        data: mem::take(&mut self.data),
                        admission: mem::take(&mut self.admission),
                    }));
                }
                ReadState::ThrottleMessage | ReadState::ThrottleBytes | ReadState::Closed => {
                    unreachable!("handled above");
                }
            }
        }
    }

    fn take_segment(&self, input: &mut BytesMut, len: u32) -> Bytes {
        input.split_to(len.safe_cast()).freeze()
    }

    /// Reports that the throttle requested by the last poll was acquired. `held` is `None` if the
    ///  policy has no such throttle.
    pub fn admitted(&mut self, held: Option<(Arc<Throttle>, u32)>) {
        if let Some((throttle, amount)) = held {
            self.admission.add(throttle, amount);
        }
        self.state = match self.state {
            ReadState::ThrottleMessage => ReadState::ThrottleBytes,
            ReadState::ThrottleBytes => ReadState::Front,
            other => other,
        };
    }

    /// gives up a partially read message, returning the throttle budget it held
    pub fn abort(&mut self) -> Admission {
        self.front = Bytes::new();
        self.middle = Bytes::new();
        self.data = Bytes::new();
        mem::take(&mut self.admission)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use crate::security::SharedSecretAuth;
    use crate::wire::frame::FOOTER_FLAG_COMPLETE;
    use super::*;

    fn message_frame(seq: u64, front: &[u8], data: &[u8]) -> BytesMut {
        let header = MessageHeader {
            seq,
            msg_type: 3,
            front_len: front.len() as u32,
            data_len: data.len() as u32,
            ..Default::default()
        };
        let footer = MessageFooter::for_segments(front, b"", data, true);

        let mut buf = BytesMut::new();
        buf.put_u8(FrameTag::Msg.into());
        header.ser(&mut buf);
        buf.put_slice(front);
        buf.put_slice(data);
        footer.ser(&mut buf);
        buf
    }

    /// feeds `raw` in chunks of `chunk_size`, admitting throttles along the way
    fn read_all(reader: &mut FrameReader, raw: &[u8], chunk_size: usize) -> anyhow::Result<Vec<ReadEvent>> {
        let mut events = Vec::new();
        let mut input = BytesMut::new();
        for chunk in raw.chunks(chunk_size) {
            input.put_slice(chunk);
            loop {
                match reader.poll(&mut input)? {
                    ReadEvent::NeedMore => break,
                    ReadEvent::AcquireMessage | ReadEvent::AcquireBytes(_) => reader.admitted(None),
                    other => events.push(other),
                }
            }
        }
        Ok(events)
    }

    #[rstest]
    #[case::one_byte_chunks(1)]
    #[case::small_chunks(7)]
    #[case::all_at_once(10_000)]
    fn test_read_message_in_chunks(#[case] chunk_size: usize) {
        let mut raw = message_frame(17, b"front", b"some data");
        raw.put_u8(FrameTag::Ack.into());
        raw.put_u64(5);
        raw.put_u8(FrameTag::Keepalive.into());

        let mut reader = FrameReader::new(1024, true, None);
        let events = read_all(&mut reader, &raw, chunk_size).unwrap();
        assert_eq!(events.len(), 3);

        match &events[0] {
            ReadEvent::Message(m) => {
                assert_eq!(m.header.seq, 17);
                assert_eq!(m.header.msg_type, 3);
                assert_eq!(m.front.as_ref(), b"front");
                assert!(m.middle.is_empty());
                assert_eq!(m.data.as_ref(), b"some data");
                assert_eq!(m.footer.flags, FOOTER_FLAG_COMPLETE);
            }
            _ => panic!("expected a message"),
        }
        assert!(matches!(events[1], ReadEvent::Ack(5)));
        assert!(matches!(events[2], ReadEvent::Keepalive));
        assert_eq!(reader.state(), ReadState::Tag);
    }

    #[test]
    fn test_keepalive2() {
        let mut raw = BytesMut::new();
        raw.put_u8(FrameTag::Keepalive2.into());
        raw.put_u64(1234);
        raw.put_u8(FrameTag::Keepalive2Ack.into());
        raw.put_u64(5678);

        let mut reader = FrameReader::new(1024, true, None);
        let events = read_all(&mut reader, &raw, 3).unwrap();
        assert!(matches!(events[0], ReadEvent::Keepalive2(KeepaliveStamp { millis_since_epoch: 1234 })));
        assert!(matches!(events[1], ReadEvent::Keepalive2Ack(KeepaliveStamp { millis_since_epoch: 5678 })));
    }

    #[test]
    fn test_throttle_admission_order() {
        let raw = message_frame(1, b"abc", b"defg");
        let mut input = BytesMut::from(raw.as_ref());
        let bytes = Arc::new(Throttle::new("bytes", 100));
        let messages = Arc::new(Throttle::new("messages", 10));

        let mut reader = FrameReader::new(1024, true, None);
        assert!(matches!(reader.poll(&mut input).unwrap(), ReadEvent::AcquireMessage));
        assert_eq!(reader.state(), ReadState::ThrottleMessage);
        // nothing is read while waiting for the throttle
        assert!(matches!(reader.poll(&mut input).unwrap(), ReadEvent::AcquireMessage));
        reader.admitted(Some((messages.clone(), 1)));

        match reader.poll(&mut input).unwrap() {
            ReadEvent::AcquireBytes(n) => assert_eq!(n, 7),
            _ => panic!("expected byte throttle"),
        }
        reader.admitted(Some((bytes.clone(), 7)));

        match reader.poll(&mut input).unwrap() {
            ReadEvent::Message(m) => assert!(!m.admission.is_empty()),
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn test_oversized_message_fails_before_reading_the_body() {
        let raw = message_frame(1, &[0u8; 100], b"");
        // only the tag and header arrived
        let mut input = BytesMut::from(&raw[..1 + MessageHeader::SERIALIZED_LEN]);

        let mut reader = FrameReader::new(99, true, None);
        assert!(reader.poll(&mut input).is_err());
    }

    #[test]
    fn test_declared_front_len_above_max_does_not_allocate() {
        let header = MessageHeader {
            seq: 1,
            front_len: u32::MAX,
            ..Default::default()
        };
        let mut input = BytesMut::new();
        input.put_u8(FrameTag::Msg.into());
        header.ser(&mut input);

        let mut reader = FrameReader::new(1024 * 1024, true, None);
        assert!(reader.poll(&mut input).is_err());
        assert!(input.capacity() < 1024 * 1024);
    }

    #[rstest]
    #[case::bad_tag(vec![99])]
    #[case::corrupt_header({ let mut raw = message_frame(1, b"abc", b""); raw[5] ^= 1; raw.to_vec() })]
    #[case::corrupt_front({ let mut raw = message_frame(1, b"abc", b""); raw[1 + MessageHeader::SERIALIZED_LEN] ^= 1; raw.to_vec() })]
    #[case::aborted({ let mut raw = message_frame(1, b"abc", b""); let len = raw.len(); raw[len - 1] = 0; raw.to_vec() })]
    fn test_protocol_violations(#[case] raw: Vec<u8>) {
        let mut reader = FrameReader::new(1024, true, None);
        assert!(read_all(&mut reader, &raw, 1000).is_err());
    }

    #[test]
    fn test_corrupt_front_passes_without_crc_check() {
        let mut raw = message_frame(1, b"abc", b"");
        raw[1 + MessageHeader::SERIALIZED_LEN] ^= 1;
        let mut reader = FrameReader::new(1024, false, None);
        assert_eq!(read_all(&mut reader, &raw, 1000).unwrap().len(), 1);
    }

    #[test]
    fn test_signature_is_verified() {
        let raw = message_frame(1, b"abc", b"");
        let security: Arc<dyn SessionSecurity> = Arc::new(SharedSecretAuth::new("secret"));
        let mut reader = FrameReader::new(1024, true, Some(security));
        // the frame carries a zero signature
        assert!(read_all(&mut reader, &raw, 1000).is_err());
    }

    #[test]
    fn test_close() {
        let mut reader = FrameReader::new(1024, true, None);
        let mut input = BytesMut::from(&[u8::from(FrameTag::Close), u8::from(FrameTag::Keepalive)][..]);
        assert!(matches!(reader.poll(&mut input).unwrap(), ReadEvent::Close));
        assert_eq!(reader.state(), ReadState::Closed);
        assert!(reader.poll(&mut input).is_err());
    }

    #[test]
    fn test_abort_returns_admission() {
        let raw = message_frame(1, b"abc", b"defg");
        let mut input = BytesMut::from(&raw[..raw.len() - 3]);
        let bytes = Arc::new(Throttle::new("bytes", 100));

        let mut reader = FrameReader::new(1024, true, None);
        assert!(matches!(reader.poll(&mut input).unwrap(), ReadEvent::AcquireMessage));
        reader.admitted(None);
        let amount = tokio_test_acquire(&bytes, 7);
        reader.admitted(Some((bytes.clone(), amount)));
        assert!(matches!(reader.poll(&mut input).unwrap(), ReadEvent::NeedMore));
        assert_eq!(bytes.available(), 93);

        reader.abort().release();
        assert_eq!(bytes.available(), 100);
    }

    fn tokio_test_acquire(throttle: &Throttle, n: u64) -> u32 {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
            .block_on(throttle.acquire(n))
            .unwrap()
    }
}
