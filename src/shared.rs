use std::fmt;

use rand::RngCore;

use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection
///
/// Opaque bytes chosen by the peer that issued it; the demultiplexer treats
/// it purely as a lookup key. The first byte of locally issued CIDs doubles
/// as the partition hint for the lookup table.
///
/// Stored as one inline buffer whose trailing slot carries the length, so
/// equality, hashing, and copying all operate on a single flat array with the
/// unused tail zeroed.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId([u8; MAX_CID_SIZE + 1]);

const LEN_SLOT: usize = MAX_CID_SIZE;

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut buf = [0; MAX_CID_SIZE + 1];
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[LEN_SLOT] = bytes.len() as u8;
        Self(buf)
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut buf = [0; MAX_CID_SIZE + 1];
        rng.fill_bytes(&mut buf[..len]);
        buf[LEN_SLOT] = len as u8;
        Self(buf)
    }

    pub fn len(&self) -> usize {
        self.0[LEN_SLOT] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0[..self.0[LEN_SLOT] as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_lives_in_trailing_slot() {
        let cid = ConnectionId::new(&[1, 2, 3]);
        assert_eq!(cid.len(), 3);
        assert_eq!(&cid[..], &[1, 2, 3]);
        assert!(ConnectionId::new(&[]).is_empty());
    }

    #[test]
    fn same_prefix_different_length_not_equal() {
        // The zeroed tail must not make a short id equal to a longer one
        // that ends in zeros
        let short = ConnectionId::new(&[7; 4]);
        let long = ConnectionId::new(&[7, 7, 7, 7, 0]);
        assert_ne!(short, long);
        assert_eq!(&long[..], &[7, 7, 7, 7, 0]);
    }

    #[test]
    fn random_fills_only_requested_length() {
        let cid = ConnectionId::random(&mut rand::thread_rng(), 8);
        assert_eq!(cid.len(), 8);
        assert_eq!(format!("{cid}").len(), 16);
    }
}
