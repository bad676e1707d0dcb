use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ring::{aead, hmac};

use crate::{shared::ConnectionId, MAX_CID_SIZE, STATELESS_RESET_TOKEN_LENGTH};

/// Exact wire size of an encrypted retry token: the fixed-layout plaintext
/// plus the AEAD tag. Anything else in the token field of an Initial is
/// rejected without decryption.
pub(crate) const RETRY_TOKEN_LENGTH: usize = RETRY_TOKEN_PLAINTEXT_LENGTH + AEAD_TAG_LENGTH;

const RETRY_TOKEN_PLAINTEXT_LENGTH: usize = 1 + 16 + 2 + MAX_CID_SIZE + 1;
const AEAD_TAG_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;

/// Proof of source-address ownership handed out in Retry packets
///
/// Sealed under the process-wide retry key with a nonce derived from the
/// server-chosen CID carried in the same Retry packet; the client echoes that
/// CID as the destination of its follow-up Initial, which is where the nonce
/// for `open` comes from. Nonce uniqueness therefore rides on CID randomness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryToken {
    pub(crate) remote: SocketAddr,
    pub(crate) orig_dst_cid: ConnectionId,
}

impl RetryToken {
    pub(crate) fn seal(
        &self,
        key: &aead::LessSafeKey,
        new_dst_cid: &ConnectionId,
    ) -> [u8; RETRY_TOKEN_LENGTH] {
        let mut buf = [0; RETRY_TOKEN_LENGTH];
        let (ip, port) = match self.remote {
            SocketAddr::V4(addr) => {
                buf[0] = 4;
                let mut ip = [0; 16];
                ip[..4].copy_from_slice(&addr.ip().octets());
                (ip, addr.port())
            }
            SocketAddr::V6(addr) => {
                buf[0] = 6;
                (addr.ip().octets(), addr.port())
            }
        };
        buf[1..17].copy_from_slice(&ip);
        buf[17..19].copy_from_slice(&port.to_be_bytes());
        buf[19..19 + self.orig_dst_cid.len()].copy_from_slice(&self.orig_dst_cid);
        buf[19 + MAX_CID_SIZE] = self.orig_dst_cid.len() as u8;

        let tag = key
            .seal_in_place_separate_tag(
                nonce_from_cid(new_dst_cid),
                aead::Aad::empty(),
                &mut buf[..RETRY_TOKEN_PLAINTEXT_LENGTH],
            )
            .expect("sealing a fixed-size token cannot fail");
        buf[RETRY_TOKEN_PLAINTEXT_LENGTH..].copy_from_slice(tag.as_ref());
        buf
    }

    /// Decrypt and decode a token echoed back by a client
    ///
    /// `dst_cid` is the destination CID of the Initial carrying the token,
    /// i.e. the server-chosen CID from the Retry that issued it.
    pub(crate) fn open(
        key: &aead::LessSafeKey,
        dst_cid: &ConnectionId,
        data: &[u8],
    ) -> Option<Self> {
        if data.len() != RETRY_TOKEN_LENGTH {
            return None;
        }
        let mut buf = [0; RETRY_TOKEN_LENGTH];
        buf.copy_from_slice(data);
        key.open_in_place(nonce_from_cid(dst_cid), aead::Aad::empty(), &mut buf)
            .ok()?;

        let port = u16::from_be_bytes([buf[17], buf[18]]);
        let ip: [u8; 16] = buf[1..17].try_into().unwrap();
        let remote = match buf[0] {
            4 => {
                let v4: [u8; 4] = ip[..4].try_into().unwrap();
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(v4)), port)
            }
            6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port),
            _ => return None,
        };
        let cid_len = buf[19 + MAX_CID_SIZE] as usize;
        if cid_len > MAX_CID_SIZE {
            return None;
        }
        Some(Self {
            remote,
            orig_dst_cid: ConnectionId::new(&buf[19..19 + cid_len]),
        })
    }
}

fn nonce_from_cid(cid: &ConnectionId) -> aead::Nonce {
    let mut iv = [0; NONCE_LENGTH];
    let n = cid.len().min(NONCE_LENGTH);
    iv[..n].copy_from_slice(&cid[..n]);
    aead::Nonce::assume_unique_for_key(iv)
}

/// Stateless reset token: the leading bytes of the binding's keyed hash over
/// the connection ID
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken(pub(crate) [u8; STATELESS_RESET_TOKEN_LENGTH]);

impl ResetToken {
    pub(crate) fn new(key: &hmac::Key, cid: &ConnectionId) -> Self {
        let signature = hmac::sign(key, cid);
        let mut result = [0; STATELESS_RESET_TOKEN_LENGTH];
        result.copy_from_slice(&signature.as_ref()[..STATELESS_RESET_TOKEN_LENGTH]);
        Self(result)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::net::Ipv6Addr;

    fn random_key() -> aead::LessSafeKey {
        let mut secret = [0; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &secret).unwrap())
    }

    #[test]
    fn retry_token_roundtrip() {
        let key = random_key();
        let new_cid = ConnectionId::random(&mut rand::thread_rng(), 8);
        let token = RetryToken {
            remote: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433),
            orig_dst_cid: ConnectionId::random(&mut rand::thread_rng(), 8),
        };
        let sealed = token.seal(&key, &new_cid);
        assert_eq!(sealed.len(), RETRY_TOKEN_LENGTH);
        let opened = RetryToken::open(&key, &new_cid, &sealed).expect("token didn't open");
        assert_eq!(opened, token);
    }

    #[test]
    fn retry_token_v4_roundtrip() {
        let key = random_key();
        let new_cid = ConnectionId::random(&mut rand::thread_rng(), 8);
        let token = RetryToken {
            remote: "10.0.0.1:443".parse().unwrap(),
            orig_dst_cid: ConnectionId::random(&mut rand::thread_rng(), 20),
        };
        let sealed = token.seal(&key, &new_cid);
        assert_eq!(RetryToken::open(&key, &new_cid, &sealed), Some(token));
    }

    #[test]
    fn retry_token_rejects_tampering() {
        let key = random_key();
        let new_cid = ConnectionId::random(&mut rand::thread_rng(), 8);
        let token = RetryToken {
            remote: "10.0.0.1:443".parse().unwrap(),
            orig_dst_cid: ConnectionId::random(&mut rand::thread_rng(), 8),
        };
        let mut sealed = token.seal(&key, &new_cid);
        sealed[20] ^= 0x01;
        assert_eq!(RetryToken::open(&key, &new_cid, &sealed), None);
        // Wrong size is rejected before decryption
        assert_eq!(RetryToken::open(&key, &new_cid, &sealed[..40]), None);
    }

    #[test]
    fn retry_token_bound_to_cid() {
        let key = random_key();
        let cid_a = ConnectionId::new(&[1; 8]);
        let cid_b = ConnectionId::new(&[2; 8]);
        let token = RetryToken {
            remote: "10.0.0.1:443".parse().unwrap(),
            orig_dst_cid: ConnectionId::new(&[3; 8]),
        };
        let sealed = token.seal(&key, &cid_a);
        assert_eq!(RetryToken::open(&key, &cid_b, &sealed), None);
    }

    #[test]
    fn reset_token_stable_per_key() {
        let mut salt = [0; 20];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = hmac::Key::new(hmac::HMAC_SHA256, &salt);
        let cid = ConnectionId::new(&[7; 8]);
        assert_eq!(ResetToken::new(&key, &cid), ResetToken::new(&key, &cid));

        let mut other_salt = [0; 20];
        rand::thread_rng().fill_bytes(&mut other_salt);
        let other = hmac::Key::new(hmac::HMAC_SHA256, &other_salt);
        assert_ne!(ResetToken::new(&key, &cid), ResetToken::new(&other, &cid));
    }
}
