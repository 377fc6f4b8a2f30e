use bytes::Bytes;
use tracing::warn;

use crate::util::safe_converter::SafeCast;
use crate::wire::frame::{MessageFooter, MessageHeader};

pub const PRIO_HIGHEST: u8 = 255;
pub const PRIO_HIGH: u8 = 196;
pub const PRIO_DEFAULT: u8 = 127;
pub const PRIO_LOW: u8 = 64;

/// An application message. Messages are immutable once they are handed to a connection: the
///  same message may be written to several sockets in a row (after a reconnect), and it must
///  produce the same bytes each time apart from the sequence number.
///
/// Ownership moves through the outgoing queues (`out_q` -> `sent` -> dropped on ack); the
///  segments are reference counted [Bytes], so moving a message never copies payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub msg_type: u16,
    pub priority: u8,
    pub version: u16,
    pub tid: u64,
    pub front: Bytes,
    pub middle: Bytes,
    pub data: Bytes,
    pub data_off: u16,
    /// the sequence number this message was received with, or the one most recently assigned
    ///  when sending it. 0 if it never went over the wire.
    pub seq: u64,
}

impl Message {
    pub fn new(msg_type: u16, front: impl Into<Bytes>) -> Message {
        Message {
            msg_type,
            priority: PRIO_DEFAULT,
            version: 0,
            tid: 0,
            front: front.into(),
            middle: Bytes::new(),
            data: Bytes::new(),
            data_off: 0,
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Message {
        self.priority = priority;
        self
    }

    pub fn with_version(mut self, version: u16) -> Message {
        self.version = version;
        self
    }

    pub fn with_tid(mut self, tid: u64) -> Message {
        self.tid = tid;
        self
    }

    pub fn with_middle(mut self, middle: impl Into<Bytes>) -> Message {
        self.middle = middle.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>, data_off: u16) -> Message {
        self.data = data.into();
        self.data_off = data_off;
        self
    }

    pub fn body_len(&self) -> u64 {
        let front: u64 = self.front.len().safe_cast();
        let middle: u64 = self.middle.len().safe_cast();
        let data: u64 = self.data.len().safe_cast();
        front + middle + data
    }
}


/// Turns the raw segments of a received message into a message object. This is where
///  application-level message types are decoded, the messenger itself treats payloads as opaque.
pub trait MessageRegistry: Send + Sync + 'static {
    /// Returning `None` drops the message: it is not dispatched, but its sequence number still
    ///  counts as received and is acknowledged to the sender.
    fn decode(&self, header: &MessageHeader, footer: &MessageFooter, front: Bytes, middle: Bytes, data: Bytes) -> Option<Message>;
}

/// Accepts every message type, passing segments through as they are
pub struct RawMessageRegistry;

impl MessageRegistry for RawMessageRegistry {
    fn decode(&self, header: &MessageHeader, _footer: &MessageFooter, front: Bytes, middle: Bytes, data: Bytes) -> Option<Message> {
        Some(Message {
            msg_type: header.msg_type,
            priority: header.priority,
            version: header.version,
            tid: header.tid,
            front,
            middle,
            data,
            data_off: header.data_off,
            seq: header.seq,
        })
    }
}

/// Passes through only the configured message types
pub struct FilteringMessageRegistry {
    known_types: Vec<u16>,
}
impl FilteringMessageRegistry {
    pub fn new(known_types: Vec<u16>) -> FilteringMessageRegistry {
        FilteringMessageRegistry { known_types }
    }
}

impl MessageRegistry for FilteringMessageRegistry {
    fn decode(&self, header: &MessageHeader, footer: &MessageFooter, front: Bytes, middle: Bytes, data: Bytes) -> Option<Message> {
        if !self.known_types.contains(&header.msg_type) {
            warn!("received message of unknown type {} - dropping", header.msg_type);
            return None;
        }
        RawMessageRegistry.decode(header, footer, front, middle, data)
    }
}
