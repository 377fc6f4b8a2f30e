use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::policy::PeerType;
use crate::util::random::{Random, RngRandom};
use crate::wire::frame::{MessageFooter, MessageHeader};

pub const AUTH_PROTOCOL_NONE: u32 = 0;
pub const AUTH_PROTOCOL_SHARED_SECRET: u32 = 2;

/// Opaque credentials that the connecting side sends in its CONNECT
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct AuthorizerBlob {
    pub protocol: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AuthVerdict {
    Accepted { reply: Bytes },
    Rejected { reply: Bytes },
}

/// Issues and checks the credentials exchanged during the handshake
pub trait Authorizer: Send + Sync + 'static {
    /// Credentials for connecting to a peer of the given type. `force_new` is set when the peer
    ///  rejected the previous credentials, so cached tickets must not be reused.
    fn build(&self, peer_type: PeerType, force_new: bool) -> AuthorizerBlob;

    /// checks credentials received from a connecting peer
    fn verify(&self, peer_type: PeerType, authorizer: &AuthorizerBlob) -> AuthVerdict;

    /// checks the accepting side's reply to our own credentials, proving that it knows them too
    fn verify_reply(&self, authorizer: &AuthorizerBlob, reply: &[u8]) -> bool;
}

/// Signs and verifies individual messages once a session is established
pub trait SessionSecurity: Send + Sync + 'static {
    fn sign(&self, header: &MessageHeader, footer: &MessageFooter) -> u64;
    fn verify(&self, header: &MessageHeader, footer: &MessageFooter) -> bool;
}


/// Accepts everyone. This is for trusted networks and tests.
pub struct NoAuth;

impl Authorizer for NoAuth {
    fn build(&self, _peer_type: PeerType, _force_new: bool) -> AuthorizerBlob {
        AuthorizerBlob {
            protocol: AUTH_PROTOCOL_NONE,
            data: Bytes::new(),
        }
    }

    fn verify(&self, _peer_type: PeerType, _authorizer: &AuthorizerBlob) -> AuthVerdict {
        AuthVerdict::Accepted { reply: Bytes::new() }
    }

    fn verify_reply(&self, _authorizer: &AuthorizerBlob, _reply: &[u8]) -> bool {
        true
    }
}

pub struct NoSecurity;

impl SessionSecurity for NoSecurity {
    fn sign(&self, _header: &MessageHeader, _footer: &MessageFooter) -> u64 {
        0
    }

    fn verify(&self, _header: &MessageHeader, _footer: &MessageFooter) -> bool {
        true
    }
}


/// Authorizer and message signer based on a secret that all peers share. An authorizer is a
///  random nonce plus a SHA-256 digest over secret and nonce; the reply is a different digest
///  over the same nonce, so both sides prove knowledge of the secret.
///
/// Authorizers are cached and reused until a peer rejects one.
pub struct SharedSecretAuth {
    secret: Vec<u8>,
    cached: Mutex<Option<AuthorizerBlob>>,
}

impl SharedSecretAuth {
    const NONCE_LEN: usize = 8;
    const AUTHORIZER_LEN: usize = Self::NONCE_LEN + 32;

    pub fn new(secret: impl Into<Vec<u8>>) -> SharedSecretAuth {
        SharedSecretAuth {
            secret: secret.into(),
            cached: Mutex::new(None),
        }
    }

    fn digest(&self, purpose: &[u8], parts: &[&[u8]]) -> [u8; 32] {
        let mut sha256 = Sha256::default();
        sha256.update(&self.secret);
        sha256.update(purpose);
        for part in parts {
            sha256.update(part);
        }
        sha256.finalize().into()
    }

    fn new_authorizer(&self) -> AuthorizerBlob {
        let nonce = RngRandom::gen_u64_range(0..u64::MAX);
        let mut data = BytesMut::with_capacity(Self::AUTHORIZER_LEN);
        data.put_u64(nonce);
        data.put_slice(&self.digest(b"authorizer", &[&nonce.to_be_bytes()]));
        AuthorizerBlob {
            protocol: AUTH_PROTOCOL_SHARED_SECRET,
            data: data.freeze(),
        }
    }

    fn reply_for(&self, authorizer: &AuthorizerBlob) -> Bytes {
        let nonce = &authorizer.data[..Self::NONCE_LEN.min(authorizer.data.len())];
        Bytes::copy_from_slice(&self.digest(b"reply", &[nonce]))
    }

    fn signature(&self, header: &MessageHeader, footer: &MessageFooter) -> u64 {
        let digest = self.digest(b"sig", &[
            &header.seq.to_be_bytes(),
            &header.crc.to_be_bytes(),
            &footer.front_crc.to_be_bytes(),
            &footer.middle_crc.to_be_bytes(),
            &footer.data_crc.to_be_bytes(),
        ]);
        let mut sig_buf = &digest[..8];
        sig_buf.get_u64()
    }
}

impl Authorizer for SharedSecretAuth {
    fn build(&self, _peer_type: PeerType, force_new: bool) -> AuthorizerBlob {
        let mut cached = match self.cached.lock() {
            Ok(cached) => cached,
            Err(poisoned) => poisoned.into_inner(),
        };
        if force_new || cached.is_none() {
            debug!("creating new authorizer");
            *cached = Some(self.new_authorizer());
        }
        cached.clone().unwrap_or_default()
    }

    fn verify(&self, peer_type: PeerType, authorizer: &AuthorizerBlob) -> AuthVerdict {
        let rejected = AuthVerdict::Rejected { reply: Bytes::new() };

        if authorizer.protocol != AUTH_PROTOCOL_SHARED_SECRET {
            warn!("peer of {:?} uses authorizer protocol {} - rejecting", peer_type, authorizer.protocol);
            return rejected;
        }
        if authorizer.data.len() != Self::AUTHORIZER_LEN {
            warn!("authorizer from peer of {:?} has length {} - rejecting", peer_type, authorizer.data.len());
            return rejected;
        }

        let (nonce, digest) = authorizer.data.split_at(Self::NONCE_LEN);
        if digest != self.digest(b"authorizer", &[nonce]) {
            warn!("authorizer from peer of {:?} does not match the shared secret - rejecting", peer_type);
            return rejected;
        }

        AuthVerdict::Accepted { reply: self.reply_for(authorizer) }
    }

    fn verify_reply(&self, authorizer: &AuthorizerBlob, reply: &[u8]) -> bool {
        self.reply_for(authorizer).as_ref() == reply
    }
}

impl SessionSecurity for SharedSecretAuth {
    fn sign(&self, header: &MessageHeader, footer: &MessageFooter) -> u64 {
        self.signature(header, footer)
    }

    fn verify(&self, header: &MessageHeader, footer: &MessageFooter) -> bool {
        self.signature(header, footer) == footer.sig
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    const PEER: PeerType = PeerType(1);

    #[test]
    fn test_authorizer_roundtrip() {
        let auth = SharedSecretAuth::new("secret");
        let authorizer = auth.build(PEER, false);
        assert_eq!(authorizer.protocol, AUTH_PROTOCOL_SHARED_SECRET);

        let reply = match Authorizer::verify(&auth, PEER, &authorizer) {
            AuthVerdict::Accepted { reply } => reply,
            AuthVerdict::Rejected { .. } => panic!("should be accepted"),
        };
        assert!(auth.verify_reply(&authorizer, &reply));
        assert!(!auth.verify_reply(&authorizer, b"forged"));
    }

    #[test]
    fn test_authorizer_is_cached_unless_forced() {
        let auth = SharedSecretAuth::new("secret");
        let first = auth.build(PEER, false);
        assert_eq!(auth.build(PEER, false), first);
        let forced = auth.build(PEER, true);
        assert_ne!(forced, first);
        assert_eq!(auth.build(PEER, false), forced);
    }

    #[rstest]
    #[case::wrong_secret(SharedSecretAuth::new("other").build(PEER, false))]
    #[case::wrong_protocol(AuthorizerBlob { protocol: AUTH_PROTOCOL_NONE, data: Bytes::new() })]
    #[case::truncated(AuthorizerBlob { protocol: AUTH_PROTOCOL_SHARED_SECRET, data: Bytes::from_static(b"12345678") })]
    fn test_authorizer_rejected(#[case] authorizer: AuthorizerBlob) {
        let auth = SharedSecretAuth::new("secret");
        assert!(matches!(Authorizer::verify(&auth, PEER, &authorizer), AuthVerdict::Rejected { .. }));
    }

    #[test]
    fn test_signature() {
        let auth = SharedSecretAuth::new("secret");
        let header = MessageHeader {
            seq: 3,
            front_len: 1,
            ..Default::default()
        };
        let mut footer = MessageFooter::for_segments(b"a", b"", b"", true);
        footer.sig = auth.sign(&header, &footer);
        assert!(SessionSecurity::verify(&auth, &header, &footer));

        let replayed = MessageHeader { seq: 4, ..header.clone() };
        assert!(!SessionSecurity::verify(&auth, &replayed, &footer));
        assert!(!SessionSecurity::verify(&SharedSecretAuth::new("other"), &header, &footer));
    }

    #[test]
    fn test_no_security() {
        assert!(SessionSecurity::verify(&NoSecurity, &MessageHeader::default(), &MessageFooter::default()));
        assert!(matches!(Authorizer::verify(&NoAuth, PEER, &AuthorizerBlob::default()), AuthVerdict::Accepted { .. }));
    }
}
