use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::datapath::RecvDatagram;
use crate::shared::ConnectionId;

/// Work queued to a connection by the demultiplexer
///
/// The connection state machine itself lives elsewhere; this is the hand-off
/// surface. Datagram bursts arrive pre-split and pre-ordered (handshake
/// before data within a burst).
#[derive(Debug)]
pub enum ConnectionEvent {
    Datagrams(Vec<RecvDatagram>),
    Unreachable(SocketAddr),
}

/// The per-connection collaborator of a binding
///
/// A connection may be present in the CID lookup table under several CIDs at
/// once. Handles returned by the lookup table are `Arc` clones; holding one
/// keeps the connection alive across the observation, which is the whole
/// refcounting contract the receive path relies on.
#[derive(Debug)]
pub struct Connection {
    local: SocketAddr,
    remote: SocketAddr,
    source_cids: Mutex<Vec<ConnectionId>>,
    events: Mutex<VecDeque<ConnectionEvent>>,
    silent_shutdown: AtomicBool,
    handshake_accounted: AtomicBool,
}

impl Connection {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            source_cids: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            silent_shutdown: AtomicBool::new(false),
            handshake_accounted: AtomicBool::new(false),
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// CIDs this connection is currently reachable under
    pub fn source_cids(&self) -> Vec<ConnectionId> {
        self.source_cids.lock().unwrap().clone()
    }

    pub(crate) fn record_source_cid(&self, cid: ConnectionId) {
        self.source_cids.lock().unwrap().push(cid);
    }

    pub(crate) fn forget_source_cid(&self, cid: &ConnectionId) {
        self.source_cids.lock().unwrap().retain(|c| c != cid);
    }

    pub(crate) fn forget_all_source_cids(&self) {
        self.source_cids.lock().unwrap().clear();
    }

    pub(crate) fn queue_datagrams(&self, chain: Vec<RecvDatagram>) {
        self.events
            .lock()
            .unwrap()
            .push_back(ConnectionEvent::Datagrams(chain));
    }

    pub(crate) fn queue_unreachable(&self, remote: SocketAddr) {
        self.events
            .lock()
            .unwrap()
            .push_back(ConnectionEvent::Unreachable(remote));
    }

    /// Single-use reclamation channel for a connection that lost the insert
    /// race or failed mid-creation: no allocation, idempotent, observed by the
    /// connection's owner which then tears the half-born connection down.
    pub(crate) fn queue_silent_shutdown(&self) -> bool {
        self.silent_shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn silent_shutdown_queued(&self) -> bool {
        self.silent_shutdown.load(Ordering::Acquire)
    }

    /// Drain the next queued event, if any
    pub fn poll_event(&self) -> Option<ConnectionEvent> {
        self.events.lock().unwrap().pop_front()
    }

    pub(crate) fn begin_handshake_accounting(&self) {
        self.handshake_accounted.store(true, Ordering::Release);
    }

    /// Clears the accounting mark; true when this call did the clearing
    pub(crate) fn end_handshake_accounting(&self) -> bool {
        self.handshake_accounted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
