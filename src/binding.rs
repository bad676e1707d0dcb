use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::{Rng, RngCore};
use ring::hmac;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{BindingConfig, LibraryContext};
use crate::connection::Connection;
use crate::datapath::{Datapath, RecvDatagram, Transmit};
use crate::listener::{Listener, ListenerRef, ListenerRegistry, RegisterOutcome};
use crate::lookup::{CidInsertResult, CidTable};
use crate::packet::{self, InvariantHeader, LongType};
use crate::shared::ConnectionId;
use crate::stateless::{StatelessContext, StatelessKind, StatelessOperTable};
use crate::token::{ResetToken, RetryToken, RETRY_TOKEN_LENGTH};
use crate::worker::StatelessOperation;
use crate::{
    MIN_INITIAL_CONNECTION_ID_LENGTH, MIN_STATELESS_RESET_PACKET_LENGTH,
    RECOMMENDED_STATELESS_RESET_PACKET_LENGTH, SERVER_CHOSEN_CID_LENGTH,
};

/// Errors surfaced by binding initialization
///
/// Everything past initialization degrades to logged drops instead.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("illegal binding configuration: {0}")]
    IllegalConfig(&'static str),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BindingStats {
    pub version_negotiations_sent: u64,
    pub retries_sent: u64,
    pub resets_sent: u64,
    pub dropped_packets: u64,
}

#[derive(Default)]
struct StatCounters {
    version_negotiations_sent: AtomicU64,
    retries_sent: AtomicU64,
    resets_sent: AtomicU64,
    dropped_packets: AtomicU64,
}

/// The per-UDP-socket demultiplexer
///
/// Owns the listener registry, the CID lookup table, and the stateless
/// operation table for one socket. Entirely passive: the datapath up-calls
/// `on_receive`/`on_unreachable`, workers call
/// `process_stateless_operation`, and the owning endpoint drives the rest.
/// All entry points are bounded, non-blocking work; only `shutdown` blocks.
pub struct Binding {
    library: Arc<LibraryContext>,
    datapath: Arc<dyn Datapath>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    exclusive: bool,
    /// Random value with the reserved-version pattern, advertised first in
    /// Version Negotiation as a grease slot
    random_reserved_version: u32,
    reset_token_key: hmac::Key,
    listeners: ListenerRegistry,
    lookup: CidTable,
    stateless: StatelessOperTable,
    refs: AtomicU32,
    closing: AtomicBool,
    handshake_connections: AtomicU32,
    stats: StatCounters,
}

impl Binding {
    /// Create a binding over an already-bound datapath socket
    pub fn new(
        library: Arc<LibraryContext>,
        datapath: Arc<dyn Datapath>,
        config: BindingConfig,
    ) -> Result<Arc<Self>, BindingError> {
        let local_addr = datapath.local_addr();
        if let Some(remote) = config.remote {
            if remote.is_ipv4() != local_addr.is_ipv4() {
                return Err(BindingError::IllegalConfig(
                    "local and remote address families differ",
                ));
            }
        }
        let exclusive = !config.share;
        let connected = config.remote.is_some();

        let mut rng = rand::thread_rng();
        let random_reserved_version = (rng.gen::<u32>() & !packet::VERSION_RESERVED_MASK)
            | packet::VERSION_RESERVED;
        let mut salt = [0; 20];
        rng.fill_bytes(&mut salt);

        let binding = Arc::new(Self {
            library,
            datapath,
            local_addr,
            remote_addr: config.remote,
            exclusive,
            random_reserved_version,
            reset_token_key: hmac::Key::new(hmac::HMAC_SHA256, &salt),
            listeners: ListenerRegistry::new(),
            lookup: CidTable::new(connected || exclusive),
            stateless: StatelessOperTable::new(),
            refs: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            handshake_connections: AtomicU32::new(0),
            stats: StatCounters::default(),
        });
        debug!(local = %binding.local_addr, exclusive, "binding created");
        Ok(binding)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn random_reserved_version(&self) -> u32 {
        self.random_reserved_version
    }

    pub fn stats(&self) -> BindingStats {
        BindingStats {
            version_negotiations_sent: self.stats.version_negotiations_sent.load(Ordering::Relaxed),
            retries_sent: self.stats.retries_sent.load(Ordering::Relaxed),
            resets_sent: self.stats.resets_sent.load(Ordering::Relaxed),
            dropped_packets: self.stats.dropped_packets.load(Ordering::Relaxed),
        }
    }

    /// Length of CIDs this binding expects on short-header packets
    fn local_cid_len(&self) -> usize {
        if self.exclusive {
            0
        } else {
            SERVER_CHOSEN_CID_LENGTH
        }
    }

    /// Tear the binding down
    ///
    /// Blocks in `Datapath::close` until in-flight receive up-calls complete,
    /// then drains leftover stateless contexts; safe because no new work can
    /// arrive. All connections and listeners must already be gone.
    pub fn shutdown(&self) {
        debug!(local = %self.local_addr, "binding cleanup");
        self.closing.store(true, Ordering::Release);
        debug_assert_eq!(self.refs.load(Ordering::Acquire), 0);
        debug_assert_eq!(self.handshake_connections.load(Ordering::Acquire), 0);
        debug_assert!(!self.listeners.has_any());

        self.datapath.close();
        self.stateless.drain();
    }

    pub(crate) fn try_add_ref(&self) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn release_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    //
    // Listener registry
    //

    pub fn has_listener_registered(&self) -> bool {
        self.listeners.has_any()
    }

    /// Register a listener; `false` on a duplicate (address, ALPN) pair
    ///
    /// The first listener upgrades the lookup table to full partitioning; if
    /// that fails the registration is rolled back.
    pub fn register_listener(&self, listener: &Arc<Listener>) -> bool {
        let first = match self.listeners.register(listener) {
            RegisterOutcome::Duplicate => return false,
            RegisterOutcome::Added { first } => first,
        };
        if first && !self.lookup.maximize_partitioning() {
            self.unregister_listener(listener);
            return false;
        }
        true
    }

    pub fn unregister_listener(&self, listener: &Arc<Listener>) {
        self.listeners.unregister(listener);
    }

    /// Match an incoming handshake's local address and ALPN offer to a
    /// listener, client ALPN preference first
    pub fn get_listener(&self, local: &SocketAddr, alpn_list: &[u8]) -> Option<ListenerRef> {
        self.listeners.select(local, alpn_list)
    }

    /// Trace enumeration of binding state
    pub fn trace_rundown(&self) {
        debug!(local = %self.local_addr, remote = ?self.remote_addr, "binding rundown");
        self.listeners.rundown();
    }

    //
    // Lookup facade
    //

    /// Route packets destined to `cid` to `conn`; `false` on collision
    pub fn add_source_cid(&self, cid: ConnectionId, conn: &Arc<Connection>) -> bool {
        matches!(self.lookup.insert(cid, conn), CidInsertResult::Inserted)
    }

    pub fn remove_source_cid(&self, cid: &ConnectionId) {
        self.lookup.remove(cid);
    }

    /// Drop all routing state for `conn` and release its binding reference
    pub fn remove_connection(&self, conn: &Arc<Connection>) {
        self.lookup.remove_all(conn);
        if conn.end_handshake_accounting() {
            self.handshake_connections.fetch_sub(1, Ordering::AcqRel);
            self.library.on_handshake_ended();
        }
        self.release_ref();
    }

    /// The connection's handshake finished; it no longer counts against the
    /// Retry memory gate
    pub fn on_handshake_confirmed(&self, conn: &Arc<Connection>) {
        if conn.end_handshake_accounting() {
            self.handshake_connections.fetch_sub(1, Ordering::AcqRel);
            self.library.on_handshake_ended();
        }
    }

    /// Migrate all of `conn`'s source CIDs to another binding's table
    pub fn move_source_cids(src: &Binding, dst: &Binding, conn: &Arc<Connection>) {
        CidTable::move_all(&src.lookup, &dst.lookup, conn);
    }

    pub fn connection_count(&self) -> usize {
        self.lookup.len()
    }

    /// Look up the connection a CID currently routes to
    ///
    /// The returned handle is the caller's liveness guard for the connection.
    pub fn find_connection(&self, cid: &ConnectionId) -> Option<Arc<Connection>> {
        self.lookup.find_by_cid(cid)
    }

    /// Number of currently tracked stateless operations
    pub fn stateless_operation_count(&self) -> usize {
        self.stateless.len()
    }

    /// Reset token this binding would emit for `cid`
    ///
    /// Stable for the binding's lifetime; bindings derive from independent
    /// salts, so tokens for the same CID differ across bindings.
    pub fn stateless_reset_token(&self, cid: &ConnectionId) -> ResetToken {
        ResetToken::new(&self.reset_token_key, cid)
    }

    //
    // Receive path
    //

    /// Datapath receive up-call; may run concurrently on several threads
    ///
    /// Splits the burst into per-CID sub-chains, reorders handshake packets
    /// ahead of data packets within each sub-chain, and delivers or answers
    /// each one. Datagrams not consumed by a connection or a stateless
    /// context are returned to the datapath before this returns.
    pub fn on_receive(&self, now: Instant, chain: Vec<RecvDatagram>) {
        let mut release = Vec::new();
        let mut subchain: Vec<RecvDatagram> = Vec::new();
        let mut handshake_count = 0;

        for datagram in chain {
            let datagram = match self.preprocess(now, datagram) {
                Preprocessed::Deliver(datagram) => datagram,
                Preprocessed::Release(datagram) => {
                    release.push(datagram);
                    continue;
                }
                Preprocessed::Consumed => continue,
            };

            let header = datagram.header.as_ref().unwrap();
            // On an exclusive binding every packet belongs to the one
            // connection, so there is never more than one sub-chain.
            if !self.exclusive
                && !subchain.is_empty()
                && subchain[0].header.as_ref().unwrap().dst_cid() != header.dst_cid()
            {
                if let Err(chain) = self.deliver(now, std::mem::take(&mut subchain)) {
                    release.extend(chain);
                }
                handshake_count = 0;
            }

            // Handshake packets order before data packets so the sub-chain
            // head alone decides whether a connection may be created.
            if header.is_handshake() {
                subchain.insert(handshake_count, datagram);
                handshake_count += 1;
            } else {
                subchain.push(datagram);
            }
        }

        if !subchain.is_empty() {
            if let Err(chain) = self.deliver(now, subchain) {
                release.extend(chain);
            }
        }

        if !release.is_empty() {
            self.datapath.return_recv(release);
        }
    }

    /// ICMP/port-unreachable up-call
    pub fn on_unreachable(&self, remote: &SocketAddr) {
        if let Some(conn) = self.lookup.find_by_remote(remote) {
            conn.queue_unreachable(*remote);
        }
    }

    /// Validate the version-independent header and apply CID length policy
    fn preprocess(&self, now: Instant, mut datagram: RecvDatagram) -> Preprocessed {
        let header = match InvariantHeader::decode(&datagram.buffer, self.local_cid_len()) {
            Ok(header) => header,
            Err(e) => {
                self.log_drop(&datagram, e.0);
                return Preprocessed::Release(datagram);
            }
        };

        if self.exclusive {
            if !header.dst_cid().is_empty() {
                self.log_drop(&datagram, "non-zero length CID on exclusive binding");
                return Preprocessed::Release(datagram);
            }
        } else if header.dst_cid().is_empty() {
            self.log_drop(&datagram, "zero length CID on non-exclusive binding");
            return Preprocessed::Release(datagram);
        } else if header.dst_cid().len() < MIN_INITIAL_CONNECTION_ID_LENGTH {
            self.log_drop(&datagram, "less than min length CID on non-exclusive binding");
            return Preprocessed::Release(datagram);
        }

        if let Some(version) = header.version() {
            if !packet::is_version_recognized(version) {
                datagram.header = Some(header);
                if !self.has_listener_registered() {
                    self.log_drop(&datagram, "no listener to send VN");
                    return Preprocessed::Release(datagram);
                }
                return match self.queue_stateless_operation(
                    now,
                    StatelessKind::VersionNegotiation,
                    vec![datagram],
                ) {
                    Ok(()) => Preprocessed::Consumed,
                    Err(mut chain) => Preprocessed::Release(chain.pop().unwrap()),
                };
            }
        }

        datagram.header = Some(header);
        Preprocessed::Deliver(datagram)
    }

    /// Deliver one validated, same-CID sub-chain
    ///
    /// On miss, the sub-chain head decides between a stateless response,
    /// a new connection, or a drop. `Err` hands the chain back for release.
    fn deliver(
        &self,
        now: Instant,
        mut chain: Vec<RecvDatagram>,
    ) -> Result<(), Vec<RecvDatagram>> {
        let dst_cid = *chain[0]
            .header
            .as_ref()
            .expect("delivered packets are preprocessed")
            .dst_cid();

        if let Some(conn) = self.lookup.find_by_cid(&dst_cid) {
            conn.queue_datagrams(chain);
            return Ok(());
        }

        let mut drop_packet = false;
        if !self.should_create_connection(&chain[0]) {
            self.queue_stateless_reset(now, chain)
        } else if self.should_retry_connection(&mut chain[0], &mut drop_packet) {
            self.queue_stateless_operation(now, StatelessKind::Retry, chain)
        } else if drop_packet {
            Err(chain)
        } else {
            match self.create_connection(&chain) {
                Some(conn) => {
                    conn.queue_datagrams(chain);
                    Ok(())
                }
                None => Err(chain),
            }
        }
    }

    /// Whether the sub-chain head may create a new connection
    fn should_create_connection(&self, datagram: &RecvDatagram) -> bool {
        let header = datagram.header.as_ref().unwrap();
        if !header.is_long() {
            return false; // No drop log; the stateless reset path may answer
        }
        if !self.has_listener_registered() {
            self.log_drop(
                datagram,
                "LH packet not matched with a connection and no listeners registered",
            );
            return false;
        }
        if header.version() == Some(packet::VERSION_NEGOTIATION) {
            self.log_drop(
                datagram,
                "version negotiation packet not matched with a connection",
            );
            return false;
        }
        if header.long_type() != Some(LongType::Initial) {
            self.log_drop(datagram, "non-initial packet cannot create a new connection");
            return false;
        }
        true
    }

    /// Whether the client must first prove source-address ownership
    ///
    /// Only meaningful once `should_create_connection` passed. Under
    /// handshake memory pressure an Initial without a token earns a Retry; a
    /// token is validated and, on failure, the packet is dropped.
    fn should_retry_connection(&self, datagram: &mut RecvDatagram, drop_packet: &mut bool) -> bool {
        if !self.library.retry_required() {
            return false;
        }

        let Some(bounds) = packet::initial_token_bounds(&datagram.buffer) else {
            self.log_drop(datagram, "malformed initial packet");
            *drop_packet = true;
            return false;
        };
        if bounds.is_empty() {
            return true;
        }

        let header = datagram.header.as_ref().unwrap();
        if bounds.len() != RETRY_TOKEN_LENGTH {
            self.log_drop(datagram, "invalid retry token length");
            *drop_packet = true;
            return false;
        }
        let token = match RetryToken::open(
            self.library.retry_key(),
            header.dst_cid(),
            &datagram.buffer[bounds],
        ) {
            Some(token) => token,
            None => {
                self.log_drop(datagram, "retry token decryption failure");
                *drop_packet = true;
                return false;
            }
        };
        if token.remote != datagram.remote {
            self.log_drop(datagram, "retry token address mismatch");
            *drop_packet = true;
            return false;
        }

        datagram.token_valid = true;
        false
    }

    /// Create a connection for the sub-chain, or return the existing one that
    /// won an insertion race
    fn create_connection(&self, chain: &[RecvDatagram]) -> Option<Arc<Connection>> {
        let head = &chain[0];
        let initial_cid = *head.header.as_ref().unwrap().dst_cid();
        let conn = Connection::new(head.local, head.remote);

        let worker = self.library.worker();
        if worker.is_overloaded() {
            self.log_drop(head, "worker overloaded");
            return None;
        }

        // The connection must be fully set up before insertion; once in the
        // table other threads can find it immediately.
        if !self.try_add_ref() {
            self.log_drop(head, "clean up in progress");
            return None;
        }
        self.handshake_connections.fetch_add(1, Ordering::AcqRel);
        self.library.on_handshake_started();
        conn.begin_handshake_accounting();

        match self.lookup.insert(initial_cid, &conn) {
            CidInsertResult::Inserted => Some(conn),
            CidInsertResult::Collided(existing) => {
                // The existing connection wins. The newborn never became
                // reachable, so its state can be unwound here; its owner is
                // told through the single-use shutdown channel.
                if conn.end_handshake_accounting() {
                    self.handshake_connections.fetch_sub(1, Ordering::AcqRel);
                    self.library.on_handshake_ended();
                }
                self.release_ref();
                conn.queue_silent_shutdown();
                Some(existing)
            }
        }
    }

    //
    // Stateless responses
    //

    /// Queue a stateless reset for an unmatched sub-chain
    ///
    /// Never answers long headers (the peer does not know the token yet),
    /// short packets (reset loops), or exclusive bindings (no CID, so no
    /// derivable token).
    fn queue_stateless_reset(
        &self,
        now: Instant,
        chain: Vec<RecvDatagram>,
    ) -> Result<(), Vec<RecvDatagram>> {
        let head = &chain[0];
        if head.header.as_ref().unwrap().is_long() {
            return Err(chain); // Already logged by should_create_connection
        }
        if head.buffer.len() <= MIN_STATELESS_RESET_PACKET_LENGTH {
            self.log_drop(head, "packet too short for stateless reset");
            return Err(chain);
        }
        if self.exclusive {
            self.log_drop(head, "no stateless reset on exclusive binding");
            return Err(chain);
        }
        self.queue_stateless_operation(now, StatelessKind::Reset, chain)
    }

    /// Admit a stateless operation and park it on a worker
    fn queue_stateless_operation(
        &self,
        now: Instant,
        kind: StatelessKind,
        chain: Vec<RecvDatagram>,
    ) -> Result<(), Vec<RecvDatagram>> {
        let worker = self.library.worker();
        if worker.is_overloaded() {
            self.log_drop(&chain[0], "worker overloaded (stateless oper)");
            return Err(chain);
        }
        if !self.try_add_ref() {
            self.log_drop(&chain[0], "clean up in progress");
            return Err(chain);
        }

        let context = match self.stateless.try_admit(now, chain, &worker) {
            Ok(context) => context,
            Err(rejected) => {
                self.release_ref();
                self.log_drop(&rejected.datagrams[0], rejected.reason);
                return Err(rejected.datagrams);
            }
        };
        context.has_binding_ref.store(true, Ordering::Release);
        worker.queue_stateless(StatelessOperation { kind, context });
        Ok(())
    }

    /// Build and send a queued stateless response; runs on a worker
    pub fn process_stateless_operation(&self, operation: StatelessOperation) {
        let context = operation.context;
        let Some(chain) = context.take_datagrams() else {
            debug_assert!(false, "stateless context processed twice");
            return;
        };
        let head = &chain[0];
        let header = head.header.as_ref().expect("admitted packets are preprocessed");

        let contents = match operation.kind {
            StatelessKind::VersionNegotiation => {
                let src_cid = header.src_cid().expect("VN is only queued for long headers");
                let buf = packet::encode_version_negotiation(
                    &mut rand::thread_rng(),
                    header.dst_cid(),
                    src_cid,
                    self.random_reserved_version,
                );
                self.stats
                    .version_negotiations_sent
                    .fetch_add(1, Ordering::Relaxed);
                trace!(remote = %head.remote, "TX version negotiation");
                buf
            }
            StatelessKind::Retry => {
                let mut rng = rand::thread_rng();
                let new_cid = ConnectionId::random(&mut rng, SERVER_CHOSEN_CID_LENGTH);
                let token = RetryToken {
                    remote: head.remote,
                    orig_dst_cid: *header.dst_cid(),
                }
                .seal(self.library.retry_key(), &new_cid);
                let buf = packet::encode_retry(
                    header.version().expect("retry is only queued for initials"),
                    header.src_cid().expect("retry is only queued for long headers"),
                    &new_cid,
                    header.dst_cid(),
                    &token,
                );
                self.stats.retries_sent.fetch_add(1, Ordering::Relaxed);
                trace!(remote = %head.remote, cid = %new_cid, "TX retry");
                buf
            }
            StatelessKind::Reset => {
                // Randomize the length (3 bits of entropy above the
                // recommended size), but stay strictly below the inciting
                // packet to stop reset loops.
                let mut rng = rand::thread_rng();
                let mut length =
                    RECOMMENDED_STATELESS_RESET_PACKET_LENGTH + (rng.gen::<u8>() >> 5) as usize;
                if length >= head.buffer.len() {
                    length = head.buffer.len() - 1;
                }
                debug_assert!(length >= MIN_STATELESS_RESET_PACKET_LENGTH);
                let token = self.stateless_reset_token(header.dst_cid());
                let buf = packet::encode_stateless_reset(
                    &mut rng,
                    length,
                    header.first_byte(),
                    &token.0,
                );
                self.stats.resets_sent.fetch_add(1, Ordering::Relaxed);
                trace!(remote = %head.remote, "TX stateless reset");
                buf
            }
        };

        self.send_from_to(head.local, head.remote, contents);
        self.release_stateless_operation(&context, Some(chain));
    }

    /// Finish a stateless operation: hand datagrams back, mark the context
    /// processed, and drop the binding reference it held
    pub(crate) fn release_stateless_operation(
        &self,
        context: &Arc<StatelessContext>,
        datagrams: Option<Vec<RecvDatagram>>,
    ) {
        if let Some(datagrams) = datagrams {
            self.datapath.return_recv(datagrams);
        }
        self.stateless.complete(context);
        if context.has_binding_ref.swap(false, Ordering::AcqRel) {
            self.release_ref();
        }
    }

    //
    // Send helpers
    //

    /// Send a datagram to `remote`, letting the datapath pick the source
    /// address. Failures are logged, never propagated.
    pub fn send_to(&self, remote: SocketAddr, contents: Vec<u8>) {
        if let Err(e) = self.datapath.send(Transmit {
            source: None,
            destination: remote,
            contents,
        }) {
            warn!(local = %self.local_addr, "send failed: {e}");
        }
    }

    /// Send a datagram from a pinned local address, as stateless responses do
    pub fn send_from_to(&self, local: SocketAddr, remote: SocketAddr, contents: Vec<u8>) {
        if let Err(e) = self.datapath.send(Transmit {
            source: Some(local),
            destination: remote,
            contents,
        }) {
            warn!(local = %self.local_addr, "send failed: {e}");
        }
    }

    fn log_drop(&self, datagram: &RecvDatagram, reason: &'static str) {
        self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
        debug!(remote = %datagram.remote, reason, "packet dropped");
    }
}

enum Preprocessed {
    /// Validated; route it to a connection
    Deliver(RecvDatagram),
    /// Rejected; give the buffer back to the datapath
    Release(RecvDatagram),
    /// Absorbed by a stateless operation
    Consumed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::datapath::Transmit;
    use std::io;

    struct NullDatapath(SocketAddr);

    impl Datapath for NullDatapath {
        fn local_addr(&self) -> SocketAddr {
            self.0
        }
        fn send(&self, _: Transmit) -> io::Result<()> {
            Ok(())
        }
        fn return_recv(&self, _: Vec<RecvDatagram>) {}
        fn close(&self) {}
    }

    fn binding(share: bool) -> Arc<Binding> {
        let library = LibraryContext::new(Settings::default());
        let datapath = Arc::new(NullDatapath("[::1]:4433".parse().unwrap()));
        Binding::new(
            library,
            datapath,
            BindingConfig {
                share,
                remote: (!share).then(|| "[::2]:9000".parse().unwrap()),
            },
        )
        .unwrap()
    }

    #[test]
    fn reserved_version_pattern() {
        for _ in 0..32 {
            let b = binding(true);
            assert_eq!(
                b.random_reserved_version() & packet::VERSION_RESERVED_MASK,
                packet::VERSION_RESERVED
            );
        }
    }

    #[test]
    fn reset_tokens_differ_across_bindings() {
        let a = binding(true);
        let b = binding(true);
        let cid = ConnectionId::new(&[9; 8]);
        assert_eq!(a.stateless_reset_token(&cid), a.stateless_reset_token(&cid));
        assert_ne!(a.stateless_reset_token(&cid), b.stateless_reset_token(&cid));
    }

    #[test]
    fn family_mismatch_rejected() {
        let library = LibraryContext::new(Settings::default());
        let datapath = Arc::new(NullDatapath("[::1]:4433".parse().unwrap()));
        let err = Binding::new(
            library,
            datapath,
            BindingConfig {
                share: true,
                remote: Some("192.0.2.1:443".parse().unwrap()),
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn first_listener_maximizes_partitioning() {
        let b = binding(true);
        assert_eq!(b.lookup.partition_count(), 1);
        let listener = Listener::new(crate::listener::ListenAddress::Any, b"h3");
        assert!(b.register_listener(&listener));
        let partitions = b.lookup.partition_count();
        assert!(partitions >= 1);
        // Further registrations leave partitioning alone
        let other = Listener::new(crate::listener::ListenAddress::Any, b"hq-23");
        assert!(b.register_listener(&other));
        assert_eq!(b.lookup.partition_count(), partitions);
        b.unregister_listener(&listener);
        b.unregister_listener(&other);
    }

    #[test]
    fn duplicate_listener_rejected() {
        let b = binding(true);
        let listener = Listener::new(crate::listener::ListenAddress::Any, b"h3");
        let dup = Listener::new(crate::listener::ListenAddress::Any, b"h3");
        assert!(b.register_listener(&listener));
        assert!(!b.register_listener(&dup));
        b.unregister_listener(&listener);
    }
}
