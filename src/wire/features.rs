use bitflags::bitflags;

bitflags! {
    /// Capabilities that are negotiated per socket: the effective set of a connection is the
    ///  intersection of what both sides support, and it may change across a reconnect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// after a successful handshake, both sides exchange the highest sequence number they
        ///  received so far, allowing the sender to skip re-sending what already arrived
        const RECONNECT_SEQ = 1 << 0;
        /// message footers carry a signature from the session security collaborator
        const MSG_AUTH      = 1 << 1;
        /// keepalive frames carry a timestamp that the peer echoes back
        const KEEPALIVE2    = 1 << 2;
        /// segment CRCs are computed and verified
        const DATA_CRC      = 1 << 3;
    }
}

impl Features {
    pub const SUPPORTED_DEFAULT: Features = Features::RECONNECT_SEQ
        .union(Features::KEEPALIVE2)
        .union(Features::DATA_CRC);

    /// returns those of `required` that are missing in `self`
    pub fn missing(self, required: Features) -> Features {
        required.difference(self)
    }
}
