use anyhow::{anyhow, bail};
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::util::random::Random;


/// The identity of a messenger endpoint: the socket address it listens on, plus a nonce that
///  distinguishes process incarnations on the same socket address. A peer that restarts gets a
///  new nonce and is therefore a different peer as far as connection state is concerned.
///
/// The derived ordering (socket address first, then nonce) is the 'numeric' address ordering
///  that breaks ties when two peers connect to each other concurrently.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr {
    pub socket_addr: SocketAddr,
    pub nonce: u32,
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}/{}]", self.socket_addr, self.nonce)
    }
}

impl PeerAddr {
    const FAMILY_V4: u8 = 4;
    const FAMILY_V6: u8 = 6;

    /// family (1) + address bytes (16, V4 addresses left-aligned) + port (2) + nonce (4)
    pub const SERIALIZED_LEN: usize = 1 + 16 + 2 + 4;

    pub fn new(socket_addr: SocketAddr, nonce: u32) -> PeerAddr {
        PeerAddr { socket_addr, nonce }
    }

    pub fn with_random_nonce<R: Random>(socket_addr: SocketAddr) -> PeerAddr {
        PeerAddr {
            socket_addr,
            nonce: R::next_u32(),
        }
    }

    #[cfg(test)]
    pub fn localhost(port: u16, nonce: u32) -> PeerAddr {
        PeerAddr {
            socket_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            nonce,
        }
    }

    pub fn is_blank_ip(&self) -> bool {
        self.socket_addr.ip().is_unspecified()
    }

    /// Replaces a blank (unspecified) IP with the given one, leaving port and nonce untouched.
    ///  Returns `true` if the address was changed.
    pub fn set_ip_if_blank(&mut self, ip: IpAddr) -> bool {
        if self.is_blank_ip() {
            self.socket_addr.set_ip(ip);
            true
        }
        else {
            false
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut raw = [0u8; 16];
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(Self::FAMILY_V4);
                raw[..4].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(Self::FAMILY_V6);
                raw.copy_from_slice(&ip.octets());
            }
        }
        buf.put_slice(&raw);
        buf.put_u16(self.socket_addr.port());
        buf.put_u32(self.nonce);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddr> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated peer address: {} bytes, need {}", buf.remaining(), Self::SERIALIZED_LEN);
        }

        let family = buf.get_u8();
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        let port = buf.get_u16();
        let nonce = buf.get_u32();

        let ip = match family {
            Self::FAMILY_V4 => {
                if raw[4..].iter().any(|&b| b != 0) {
                    bail!("padding of V4 peer address is not zero");
                }
                IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            Self::FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(raw)),
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };

        Ok(PeerAddr {
            socket_addr: SocketAddr::new(ip, port),
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::net::SocketAddrV4;

    #[rstest]
    #[case(PeerAddr { nonce: 5, socket_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9876).into() })]
    #[case(PeerAddr { nonce: 758964, socket_addr: "4.5.6.7:89".parse().unwrap() })]
    #[case(PeerAddr { nonce: 3456, socket_addr: "[2001:db8::1]:8080".parse().unwrap() })]
    #[case(PeerAddr { nonce: 0, socket_addr: "0.0.0.0:1".parse().unwrap() })]
    fn test_ser_deser(#[case] addr: PeerAddr) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.len(), PeerAddr::SERIALIZED_LEN);
        let deser = PeerAddr::try_deser(&mut buf);
        assert_eq!(deser.unwrap(), addr);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::v4(PeerAddr::localhost(0x1234, 0x01020304), vec![4, 127,0,0,1, 0,0,0,0,0,0,0,0,0,0,0,0, 0x12,0x34, 1,2,3,4])]
    #[case::v6(PeerAddr::new("[::1]:2".parse().unwrap(), 0), vec![6, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,1, 0,2, 0,0,0,0])]
    fn test_ser_layout(#[case] addr: PeerAddr, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::truncated(vec![4, 127,0,0,1])]
    #[case::bad_family(vec![5, 127,0,0,1, 0,0,0,0,0,0,0,0,0,0,0,0, 0,1, 0,0,0,0])]
    #[case::dirty_padding(vec![4, 127,0,0,1, 0,0,0,0,0,0,0,0,0,0,0,9, 0,1, 0,0,0,0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(PeerAddr::try_deser(&mut raw.as_slice()).is_err());
    }

    #[rstest]
    #[case::blank_v4("0.0.0.0:7", "10.1.2.3", true, "10.1.2.3:7")]
    #[case::blank_v6("[::]:7", "10.1.2.3", true, "10.1.2.3:7")]
    #[case::not_blank("10.9.9.9:7", "10.1.2.3", false, "10.9.9.9:7")]
    fn test_set_ip_if_blank(#[case] addr: &str, #[case] ip: &str, #[case] expected_changed: bool, #[case] expected: &str) {
        let mut addr = PeerAddr::new(addr.parse().unwrap(), 3);
        assert_eq!(addr.set_ip_if_blank(ip.parse().unwrap()), expected_changed);
        assert_eq!(addr, PeerAddr::new(expected.parse().unwrap(), 3));
    }

    #[test]
    fn test_ordering_is_address_first() {
        let low = PeerAddr::new("10.0.0.1:5".parse().unwrap(), 99);
        let high = PeerAddr::new("10.0.0.2:5".parse().unwrap(), 1);
        assert!(low < high);
    }
}
