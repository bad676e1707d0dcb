use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;

use crate::packet::InvariantHeader;

/// An outgoing datagram handed to the datapath
///
/// Stateless responses pin the source address to the one the inciting packet
/// arrived on, so replies leave the same interface they were provoked from.
#[derive(Debug)]
pub struct Transmit {
    pub source: Option<SocketAddr>,
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}

/// A received UDP datagram, owned by the binding for the duration of
/// processing and returned to the datapath afterwards
///
/// `header` is filled in by preprocessing and never outlives the datagram.
#[derive(Debug)]
pub struct RecvDatagram {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub buffer: BytesMut,
    pub(crate) header: Option<InvariantHeader>,
    pub(crate) token_valid: bool,
}

impl RecvDatagram {
    pub fn new(local: SocketAddr, remote: SocketAddr, buffer: BytesMut) -> Self {
        Self {
            local,
            remote,
            buffer,
            header: None,
            token_valid: false,
        }
    }

    /// Whether this datagram's Initial carried a retry token that validated
    pub fn token_validated(&self) -> bool {
        self.token_valid
    }
}

/// The raw UDP I/O collaborator
///
/// Implementations up-call `Binding::on_receive` / `Binding::on_unreachable`
/// from one or more dispatch threads; those calls may run concurrently.
pub trait Datapath: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Send one datagram. Failures are the caller's to log; they are never
    /// fatal to the binding.
    fn send(&self, transmit: Transmit) -> io::Result<()>;

    /// Give receive buffers back to the datapath. Whole chains may be
    /// returned in any order.
    fn return_recv(&self, datagrams: Vec<RecvDatagram>);

    /// Tear down the underlying socket. Blocks until all in-flight receive
    /// up-calls have completed.
    fn close(&self);
}
