use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::wire::handshake::ConnectMsg;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// The address the listening socket binds to. An unspecified IP (`0.0.0.0` / `::`) is
    ///  legal: the messenger then learns its externally visible IP from the first peer it
    ///  connects to.
    pub bind_addr: SocketAddr,

    /// Both sides of a connection must agree on this exactly, there is no down-grading
    pub protocol_version: u32,

    /// Upper bound for the sum of a message's segment lengths. This is enforced when decoding a
    ///  message header *before* any buffer is allocated for the message body, so a peer can not
    ///  cause huge allocations by declaring huge lengths.
    pub max_message_size: u32,
    pub max_authorizer_len: u32,

    /// Acks for received messages are piggy-backed on outgoing traffic once more than this number
    ///  of received messages is unacknowledged. Pending acks are flushed on every keepalive tick
    ///  regardless of this threshold.
    pub ack_threshold: u64,

    pub keepalive_interval: Option<Duration>,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// growth factor of the reconnect delay, in eighths (i.e. 16 doubles the delay per attempt)
    pub backoff_factor_eighths: u32,

    pub connect_timeout: Duration,
    /// upper bound for an entire handshake on an accepted socket
    pub handshake_timeout: Duration,
    /// Upper bound for blocking on throttle acquisition while receiving a message. Running into
    ///  this timeout faults the connection (releasing everything it holds). `None` blocks
    ///  indefinitely.
    pub throttle_timeout: Option<Duration>,
    /// how long a connection that was told to WAIT in a connect race waits for the peer's
    ///  competing connection before dialing again
    pub wait_timeout: Duration,

    /// compute and verify CRCs of message segments (header CRCs are always verified)
    pub crc_data: bool,
    /// start every new session's outgoing sequence at a random value
    pub randomize_out_seq: bool,
    pub tcp_nodelay: bool,

    /// Outgoing messages are encoded into the write buffer until it holds at least this many
    ///  bytes, the rest stays queued until the socket accepted some of it
    pub write_buffer_soft_limit: usize,
}

impl MessengerConfig {
    pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

    pub fn new(bind_addr: SocketAddr) -> MessengerConfig {
        MessengerConfig {
            bind_addr,
            protocol_version: Self::DEFAULT_PROTOCOL_VERSION,
            max_message_size: 64*1024*1024,
            max_authorizer_len: 64*1024,
            ack_threshold: 4,
            keepalive_interval: Some(Duration::from_secs(10)),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            backoff_factor_eighths: 16,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(15),
            throttle_timeout: Some(Duration::from_secs(60)),
            wait_timeout: Duration::from_secs(5),
            crc_data: true,
            randomize_out_seq: true,
            tcp_nodelay: true,
            write_buffer_soft_limit: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.max_authorizer_len > self.max_message_size {
            bail!("max authorizer length {} exceeds max message size {}", self.max_authorizer_len, self.max_message_size);
        }
        if self.backoff_factor_eighths < 8 {
            bail!("backoff factor must be at least 8 eighths, was {}", self.backoff_factor_eighths);
        }
        if self.initial_backoff > self.max_backoff {
            bail!("initial backoff {:?} exceeds max backoff {:?}", self.initial_backoff, self.max_backoff);
        }
        if self.initial_backoff.is_zero() {
            bail!("initial backoff must be positive");
        }
        if let Some(interval) = self.keepalive_interval {
            if interval.is_zero() {
                bail!("keepalive interval must be positive");
            }
        }
        if self.write_buffer_soft_limit < ConnectMsg::SERIALIZED_LEN {
            bail!("write buffer soft limit is too small");
        }
        Ok(())
    }
}
