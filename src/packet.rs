use std::{io, ops::Range};

use bytes::Buf;
use rand::{Rng, RngCore};

use crate::{
    coding::{self, BufExt, BufMutExt},
    shared::ConnectionId,
    MAX_CID_SIZE, STATELESS_RESET_TOKEN_LENGTH,
};

/// Version code carried by Version Negotiation packets
pub const VERSION_NEGOTIATION: u32 = 0;

/// QUIC versions this build accepts for new connections, in preference order
pub const SUPPORTED_VERSIONS: &[u32] = &[0xff00_0017];

/// Reserved-version pattern, forced onto the random entry advertised first in
/// Version Negotiation so clients exercise their ignore-unknown logic
pub const VERSION_RESERVED: u32 = 0x0a0a_0a0a;
pub const VERSION_RESERVED_MASK: u32 = 0x0f0f_0f0f;

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;

/// Largest Version Negotiation datagram this build can emit: invariant header
/// with two maximum-length CIDs, the per-binding reserved version, and the
/// supported-version list.
pub(crate) const MAX_VERSION_NEGOTIATION_LENGTH: usize =
    1 + 4 + 1 + MAX_CID_SIZE + 1 + MAX_CID_SIZE + 4 + 4 * SUPPORTED_VERSIONS.len();

const DEFAULT_PATH_MTU: usize = 1280;
const _: () = assert!(
    MAX_VERSION_NEGOTIATION_LENGTH <= DEFAULT_PATH_MTU - 48,
    "supported version list too large for a version negotiation datagram"
);

pub(crate) fn is_version_recognized(version: u32) -> bool {
    version == VERSION_NEGOTIATION || SUPPORTED_VERSIONS.contains(&version)
}

/// Long packet types for the supported draft
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_byte(b: u8) -> Result<Self, InvariantError> {
        use self::LongType::*;
        if b & FIXED_BIT == 0 {
            return Err(InvariantError("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long header");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => ZeroRtt,
            0x2 => Handshake,
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

/// The version-independent fields of a received packet
///
/// Everything here can be decoded before the version is validated, which is
/// exactly what the demultiplexer needs: the destination CID for routing and
/// the version for deciding whether to negotiate. The full header is never
/// decoded at this layer.
#[derive(Debug, Clone)]
pub(crate) enum InvariantHeader {
    Short {
        first: u8,
        dst_cid: ConnectionId,
    },
    Long {
        first: u8,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct InvariantError(pub &'static str);

impl From<coding::UnexpectedEnd> for InvariantError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        InvariantError("unexpected end of packet")
    }
}

impl InvariantHeader {
    /// Decode the invariant header fields
    ///
    /// `local_cid_len` is the length of CIDs this binding issues; short
    /// headers do not carry an explicit length, so it is implied.
    pub(crate) fn decode(data: &[u8], local_cid_len: usize) -> Result<Self, InvariantError> {
        let mut buf = io::Cursor::new(data);
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            let dst_cid = Self::get_cid(&mut buf, local_cid_len)?;
            Ok(InvariantHeader::Short { first, dst_cid })
        } else {
            let version = buf.get::<u32>()?;
            let dcil = buf.get::<u8>()? as usize;
            let dst_cid = Self::get_cid(&mut buf, dcil)?;
            let scil = buf.get::<u8>()? as usize;
            let src_cid = Self::get_cid(&mut buf, scil)?;
            Ok(InvariantHeader::Long {
                first,
                version,
                dst_cid,
                src_cid,
            })
        }
    }

    fn get_cid(buf: &mut io::Cursor<&[u8]>, len: usize) -> Result<ConnectionId, InvariantError> {
        if len > MAX_CID_SIZE {
            return Err(InvariantError("illegal connection ID length"));
        }
        if buf.remaining() < len {
            return Err(InvariantError("connection ID longer than packet"));
        }
        let cid = ConnectionId::new(&buf.chunk()[..len]);
        buf.advance(len);
        Ok(cid)
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        match self {
            InvariantHeader::Short { dst_cid, .. } => dst_cid,
            InvariantHeader::Long { dst_cid, .. } => dst_cid,
        }
    }

    pub(crate) fn src_cid(&self) -> Option<&ConnectionId> {
        match self {
            InvariantHeader::Short { .. } => None,
            InvariantHeader::Long { src_cid, .. } => Some(src_cid),
        }
    }

    pub(crate) fn is_long(&self) -> bool {
        matches!(self, InvariantHeader::Long { .. })
    }

    pub(crate) fn version(&self) -> Option<u32> {
        match self {
            InvariantHeader::Short { .. } => None,
            InvariantHeader::Long { version, .. } => Some(*version),
        }
    }

    pub(crate) fn first_byte(&self) -> u8 {
        match self {
            InvariantHeader::Short { first, .. } => *first,
            InvariantHeader::Long { first, .. } => *first,
        }
    }

    pub(crate) fn long_type(&self) -> Option<LongType> {
        match self {
            InvariantHeader::Short { .. } => None,
            InvariantHeader::Long { first, version, .. } => {
                if *version == VERSION_NEGOTIATION {
                    return None;
                }
                LongType::from_byte(*first).ok()
            }
        }
    }

    /// Whether the packet belongs before data packets when reordering a burst
    ///
    /// Short-header and 0-RTT packets carry application data; everything else
    /// participates in connection establishment and must be inspected first.
    pub(crate) fn is_handshake(&self) -> bool {
        match self {
            InvariantHeader::Short { .. } => false,
            InvariantHeader::Long { version, .. } => {
                if *version == VERSION_NEGOTIATION {
                    return true;
                }
                self.long_type() != Some(LongType::ZeroRtt)
            }
        }
    }
}

/// Parse the version-specific remainder of an Initial packet and locate its
/// token field
///
/// Returns `None` when the header is malformed: fixed bit unset, wrong packet
/// type, truncated token, or a payload length pointing past the datagram.
pub(crate) fn initial_token_bounds(data: &[u8]) -> Option<Range<usize>> {
    let mut buf = io::Cursor::new(data);
    let first = buf.get::<u8>().ok()?;
    if first & LONG_HEADER_FORM == 0 || LongType::from_byte(first).ok()? != LongType::Initial {
        return None;
    }
    buf.get::<u32>().ok()?; // version, validated by the caller
    let dcil = buf.get::<u8>().ok()? as usize;
    if buf.remaining() < dcil {
        return None;
    }
    buf.advance(dcil);
    let scil = buf.get::<u8>().ok()? as usize;
    if buf.remaining() < scil {
        return None;
    }
    buf.advance(scil);

    let token_len = buf.get_var().ok()? as usize;
    let token_start = buf.position() as usize;
    if buf.remaining() < token_len {
        return None;
    }
    buf.advance(token_len);

    let payload_len = buf.get_var().ok()? as usize;
    if buf.remaining() < payload_len || payload_len == 0 {
        return None;
    }

    Some(token_start..token_start + token_len)
}

/// Encode a Version Negotiation packet
///
/// CIDs are swapped relative to the packet that provoked it, and the version
/// list leads with the binding's random reserved entry.
pub(crate) fn encode_version_negotiation<R: RngCore>(
    rng: &mut R,
    recv_dst_cid: &ConnectionId,
    recv_src_cid: &ConnectionId,
    reserved_version: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VERSION_NEGOTIATION_LENGTH);
    buf.write(LONG_HEADER_FORM | (rng.gen::<u8>() & 0x7f));
    buf.write(VERSION_NEGOTIATION);
    buf.write(recv_src_cid.len() as u8);
    buf.extend_from_slice(recv_src_cid);
    buf.write(recv_dst_cid.len() as u8);
    buf.extend_from_slice(recv_dst_cid);
    buf.write(reserved_version);
    for &version in SUPPORTED_VERSIONS {
        buf.write(version);
    }
    buf
}

/// Encode a Retry packet for the supported draft
///
/// The original destination CID rides in the header and the encrypted token
/// occupies the remainder of the packet.
pub(crate) fn encode_retry(
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    orig_dst_cid: &ConnectionId,
    token: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write(LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4));
    buf.write(version);
    buf.write(dst_cid.len() as u8);
    buf.extend_from_slice(dst_cid);
    buf.write(src_cid.len() as u8);
    buf.extend_from_slice(src_cid);
    buf.write(orig_dst_cid.len() as u8);
    buf.extend_from_slice(orig_dst_cid);
    buf.extend_from_slice(token);
    buf
}

/// Encode a Stateless Reset datagram of `length` bytes
///
/// The whole buffer is random; only the header form, fixed bit, echoed key
/// phase bit, and the trailing token are meaningful. `length` must leave room
/// for the token and one leading byte.
pub(crate) fn encode_stateless_reset<R: RngCore>(
    rng: &mut R,
    length: usize,
    recv_first_byte: u8,
    token: &[u8; STATELESS_RESET_TOKEN_LENGTH],
) -> Vec<u8> {
    debug_assert!(length > STATELESS_RESET_TOKEN_LENGTH);
    let mut buf = vec![0; length];
    rng.fill_bytes(&mut buf);
    buf[0] = (buf[0] & !LONG_HEADER_FORM & !KEY_PHASE_BIT)
        | FIXED_BIT
        | (recv_first_byte & KEY_PHASE_BIT);
    let token_start = length - STATELESS_RESET_TOKEN_LENGTH;
    buf[token_start..].copy_from_slice(token);
    buf
}
