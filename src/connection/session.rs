use anyhow::bail;
use tracing::{debug, trace};

use crate::connection::out_queue::OutQueue;
use crate::message::Message;
use crate::util::random::Random;

/// What to do with a received message, based on its sequence number
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InboundSeq {
    Deliver,
    /// already received on a previous socket
    Duplicate,
}

/// The reliable-delivery state of one session: sequence counters plus the outgoing queue. This
///  survives reconnects and is only reset when the session is reset.
pub struct Session {
    lossy: bool,
    /// sequence number of the last message written to a socket
    out_seq: u64,
    /// sequence number of the last message received
    in_seq: u64,
    /// the highest `in_seq` the peer was told about
    in_seq_acked: u64,
    queue: OutQueue,
}

impl Session {
    pub fn new(lossy: bool, initial_out_seq: u64) -> Session {
        Session {
            lossy,
            out_seq: initial_out_seq,
            in_seq: 0,
            in_seq_acked: 0,
            queue: OutQueue::default(),
        }
    }

    pub fn out_seq(&self) -> u64 {
        self.out_seq
    }

    pub fn in_seq(&self) -> u64 {
        self.in_seq
    }

    pub fn in_seq_acked(&self) -> u64 {
        self.in_seq_acked
    }

    pub fn queue(&self) -> &OutQueue {
        &self.queue
    }

    pub fn enqueue(&mut self, message: Message) {
        self.queue.enqueue(message);
    }

    /// Takes the next message for writing, assigning it the next outgoing sequence number. Once
    ///  it is encoded, the message must be handed back through [Session::retain_sent].
    pub fn take_next(&mut self) -> Option<Message> {
        let mut message = self.queue.pop_next()?;
        self.out_seq += 1;
        message.seq = self.out_seq;
        Some(message)
    }

    /// keeps a written message until it is acknowledged - lossy sessions drop it right away
    pub fn retain_sent(&mut self, message: Message) {
        if !self.lossy {
            self.queue.push_sent(message);
        }
    }

    pub fn handle_ack(&mut self, seq: u64) {
        let num_acked = self.queue.ack(seq);
        trace!("ack {}: {} messages acknowledged", seq, num_acked);
    }

    /// moves unacknowledged messages back to the queue so they are resent with the same sequence
    ///  numbers on the next socket
    pub fn requeue_sent(&mut self) -> usize {
        let num_requeued = self.queue.requeue_sent();
        self.out_seq -= num_requeued as u64;
        if num_requeued > 0 {
            debug!("requeued {} unacknowledged messages, resending from seq {}", num_requeued, self.out_seq + 1);
        }
        num_requeued
    }

    /// skips requeued messages the peer reported as already received during the handshake
    pub fn discard_requeued_up_to(&mut self, peer_in_seq: u64) {
        if let Some(last_discarded) = self.queue.discard_requeued_up_to(peer_in_seq) {
            debug!("peer already received requeued messages up to seq {}", last_discarded);
            self.out_seq = last_discarded;
        }
    }

    /// Checks the sequence number of a received message and advances `in_seq` if it is the next
    ///  one. A gap is a protocol violation.
    pub fn accept_incoming(&mut self, seq: u64) -> anyhow::Result<InboundSeq> {
        if self.in_seq == 0 {
            // first message of a fresh session: the peer's out_seq started at a random value
            self.in_seq = seq;
            return Ok(InboundSeq::Deliver);
        }

        if seq <= self.in_seq {
            debug!("dropping duplicate message with seq {} (in_seq {})", seq, self.in_seq);
            return Ok(InboundSeq::Duplicate);
        }
        if seq > self.in_seq + 1 {
            bail!("missed messages: got seq {}, expected {}", seq, self.in_seq + 1);
        }

        self.in_seq = seq;
        Ok(InboundSeq::Deliver)
    }

    /// The sequence number to acknowledge, if an ack is due: more than `threshold` received
    ///  messages are unacknowledged, or `force` is set and there is anything to acknowledge.
    pub fn take_ack(&mut self, threshold: u64, force: bool) -> Option<u64> {
        let unacked = self.in_seq.saturating_sub(self.in_seq_acked);
        if unacked > threshold || (force && unacked > 0) {
            self.in_seq_acked = self.in_seq;
            Some(self.in_seq)
        }
        else {
            None
        }
    }

    /// the peer was told our `in_seq` out of band, i.e. in the handshake
    pub fn mark_in_seq_acked(&mut self) {
        self.in_seq_acked = self.in_seq;
    }

    /// Starts a new session, discarding everything queued. Returns the number of discarded
    ///  messages.
    pub fn reset(&mut self, initial_out_seq: u64) -> usize {
        let num_discarded = self.queue.clear();
        self.out_seq = initial_out_seq;
        self.in_seq = 0;
        self.in_seq_acked = 0;
        num_discarded
    }

    /// drops everything queued without touching sequence numbers
    pub fn discard_queued(&mut self) -> usize {
        self.queue.clear()
    }
}

/// starting value for the outgoing sequence of a new session
pub fn initial_out_seq<R: Random>(randomize: bool) -> u64 {
    if randomize {
        R::gen_u64_range(0..0x7fff_ffff)
    }
    else {
        0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    fn msg(tid: u64) -> Message {
        Message::new(1, "payload").with_tid(tid)
    }

    /// writes everything queued in `sender`, returning what went 'over the wire'
    fn write_all(sender: &mut Session) -> Vec<Message> {
        let mut wire = Vec::new();
        while let Some(message) = sender.take_next() {
            wire.push(message.clone());
            sender.retain_sent(message);
        }
        wire
    }

    /// feeds messages to the receiver, returning the tids of delivered messages
    fn receive(receiver: &mut Session, wire: &[Message]) -> Vec<u64> {
        let mut delivered = Vec::new();
        for message in wire {
            if receiver.accept_incoming(message.seq).unwrap() == InboundSeq::Deliver {
                delivered.push(message.tid);
            }
        }
        delivered
    }

    #[test]
    fn test_out_seq_is_assigned_on_write() {
        let mut session = Session::new(false, 100);
        session.enqueue(msg(1));
        session.enqueue(msg(2));
        assert_eq!(session.out_seq(), 100);

        let wire = write_all(&mut session);
        assert_eq!(wire.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![101, 102]);
        assert_eq!(session.out_seq(), 102);
        assert_eq!(session.queue().num_sent(), 2);
    }

    #[test]
    fn test_lossy_does_not_retain() {
        let mut session = Session::new(true, 0);
        session.enqueue(msg(1));
        write_all(&mut session);
        assert_eq!(session.queue().num_sent(), 0);
        assert_eq!(session.requeue_sent(), 0);
        assert_eq!(session.out_seq(), 1);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![1, 2, 3], 3)]
    #[case::duplicate(vec![1, 2, 2, 1, 3], vec![1, 2, 3], 3)]
    #[case::random_start(vec![5000, 5001], vec![5000, 5001], 5001)]
    fn test_accept_incoming(#[case] seqs: Vec<u64>, #[case] expected_delivered: Vec<u64>, #[case] expected_in_seq: u64) {
        let mut session = Session::new(false, 0);
        let mut delivered = Vec::new();
        for seq in seqs {
            if session.accept_incoming(seq).unwrap() == InboundSeq::Deliver {
                delivered.push(seq);
            }
        }
        assert_eq!(delivered, expected_delivered);
        assert_eq!(session.in_seq(), expected_in_seq);
    }

    #[test]
    fn test_gap_is_an_error() {
        let mut session = Session::new(false, 0);
        session.accept_incoming(1).unwrap();
        assert!(session.accept_incoming(3).is_err());
        assert_eq!(session.in_seq(), 1);
    }

    #[rstest]
    #[case::below_threshold(1, 2, false, None)]
    #[case::at_threshold(2, 2, false, None)]
    #[case::above_threshold(3, 2, false, Some(3))]
    #[case::forced(1, 2, true, Some(1))]
    #[case::forced_nothing_to_ack(0, 2, true, None)]
    fn test_take_ack(#[case] num_received: u64, #[case] threshold: u64, #[case] force: bool, #[case] expected: Option<u64>) {
        let mut session = Session::new(false, 0);
        for seq in 1..=num_received {
            session.accept_incoming(seq).unwrap();
        }
        assert_eq!(session.take_ack(threshold, force), expected);
        if expected.is_some() {
            assert_eq!(session.in_seq_acked(), num_received);
            assert_eq!(session.take_ack(threshold, true), None);
        }
    }

    /// A sends 1..5, B acks 3, the link drops, A reconnects: B gets 4 and 5 exactly once, in order
    #[rstest]
    #[case::b_got_3_with_seq_exchange(3, true, vec![4, 5])]
    #[case::b_got_4_with_seq_exchange(4, true, vec![5])]
    #[case::b_got_3_without_seq_exchange(3, false, vec![4, 5])]
    #[case::b_got_5_without_seq_exchange(5, false, vec![])]
    fn test_resend_after_reconnect(#[case] b_received: usize, #[case] seq_exchange: bool, #[case] expected_redelivered: Vec<u64>) {
        let mut a = Session::new(false, 0);
        let mut b = Session::new(false, 0);

        for tid in 1..=5 {
            a.enqueue(msg(tid));
        }
        let wire = write_all(&mut a);
        assert_eq!(receive(&mut b, &wire[..b_received]), (1..=b_received as u64).collect::<Vec<_>>());

        a.handle_ack(3);
        assert_eq!(a.queue().num_sent(), 2);

        // link drops
        assert_eq!(a.requeue_sent(), 2);
        assert_eq!(a.out_seq(), 3);
        if seq_exchange {
            a.discard_requeued_up_to(b.in_seq());
        }

        let wire = write_all(&mut a);
        assert_eq!(receive(&mut b, &wire), expected_redelivered);
        assert_eq!(b.in_seq(), 5);
        assert_eq!(a.out_seq(), 5);

        // the stream continues seamlessly
        a.enqueue(msg(6));
        let wire = write_all(&mut a);
        assert_eq!(receive(&mut b, &wire), vec![6]);
    }

    #[test]
    fn test_requeue_keeps_seq_contiguous_behind_fresh_messages() {
        let mut a = Session::new(false, 10);
        a.enqueue(msg(1));
        a.enqueue(msg(2));
        write_all(&mut a);
        a.enqueue(msg(3));

        a.requeue_sent();
        let wire = write_all(&mut a);
        assert_eq!(wire.iter().map(|m| (m.tid, m.seq)).collect::<Vec<_>>(), vec![(1, 11), (2, 12), (3, 13)]);
    }

    #[test]
    fn test_reset() {
        let mut session = Session::new(false, 0);
        session.enqueue(msg(1));
        write_all(&mut session);
        session.enqueue(msg(2));
        session.accept_incoming(7).unwrap();
        session.take_ack(0, true);

        assert_eq!(session.reset(1000), 2);
        assert_eq!(session.out_seq(), 1000);
        assert_eq!(session.in_seq(), 0);
        assert_eq!(session.in_seq_acked(), 0);
        assert!(!session.queue().has_queued());
        assert_eq!(session.queue().num_sent(), 0);
    }

    #[rstest]
    #[case::randomized(true, 12345)]
    #[case::fixed(false, 0)]
    fn test_initial_out_seq(#[case] randomize: bool, #[case] expected: u64) {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|_| 12345);
        assert_eq!(initial_out_seq::<MockRandom>(randomize), expected);
    }
}
