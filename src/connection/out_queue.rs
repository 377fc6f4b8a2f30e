use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use crate::message::Message;

/// Outgoing messages of one connection, from 'queued' through 'sent but not acknowledged'.
///
/// Messages that were sent on a previous socket and are requeued after a fault go to a separate
///  resend lane ahead of all priority lanes. They keep their original order and are re-assigned
///  the same sequence numbers, and they are the only messages that may be discarded because the
///  peer reports them as received. Fresh messages are never discarded that way.
#[derive(Default)]
pub struct OutQueue {
    resend: VecDeque<Message>,
    lanes: BTreeMap<Reverse<u8>, VecDeque<Message>>,
    sent: VecDeque<Message>,
}

impl OutQueue {
    pub fn enqueue(&mut self, message: Message) {
        self.lanes.entry(Reverse(message.priority))
            .or_default()
            .push_back(message);
    }

    /// the next message to write: requeued messages first, then by descending priority
    pub fn pop_next(&mut self) -> Option<Message> {
        if let Some(message) = self.resend.pop_front() {
            return Some(message);
        }

        let mut lane_entry = self.lanes.first_entry()?;
        let message = lane_entry.get_mut().pop_front();
        if lane_entry.get().is_empty() {
            lane_entry.remove();
        }
        message
    }

    pub fn push_sent(&mut self, message: Message) {
        debug_assert!(self.sent.back().map_or(true, |last| last.seq < message.seq));
        self.sent.push_back(message);
    }

    /// removes all sent messages with a sequence number up to and including `seq`, returning
    ///  how many were removed
    pub fn ack(&mut self, seq: u64) -> usize {
        let mut num_acked = 0;
        while let Some(first) = self.sent.front() {
            if first.seq > seq {
                break;
            }
            self.sent.pop_front();
            num_acked += 1;
        }
        num_acked
    }

    /// moves all sent messages back to the front of the resend lane, returning how many were moved
    pub fn requeue_sent(&mut self) -> usize {
        let num_requeued = self.sent.len();
        while let Some(message) = self.sent.pop_back() {
            self.resend.push_front(message);
        }
        num_requeued
    }

    /// Drops requeued messages the peer already received, i.e. those with a sequence number up to
    ///  and including `seq`. Returns the sequence number of the last dropped message.
    pub fn discard_requeued_up_to(&mut self, seq: u64) -> Option<u64> {
        let mut last_discarded = None;
        while let Some(first) = self.resend.front() {
            if first.seq > seq {
                break;
            }
            last_discarded = Some(first.seq);
            self.resend.pop_front();
        }
        last_discarded
    }

    /// drops everything, returning the number of discarded messages
    pub fn clear(&mut self) -> usize {
        let num_discarded = self.num_queued() + self.sent.len();
        self.resend.clear();
        self.lanes.clear();
        self.sent.clear();
        num_discarded
    }

    /// number of messages waiting to be written, including requeued ones
    pub fn num_queued(&self) -> usize {
        self.resend.len() + self.lanes.values().map(|lane| lane.len()).sum::<usize>()
    }

    pub fn num_sent(&self) -> usize {
        self.sent.len()
    }

    pub fn has_queued(&self) -> bool {
        !self.resend.is_empty() || !self.lanes.is_empty()
    }
}
