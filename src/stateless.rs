use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::datapath::RecvDatagram;
use crate::worker::Worker;
use crate::{MAX_BINDING_STATELESS_OPERATIONS, STATELESS_OP_EXPIRATION};

/// The three responses a binding can produce without per-connection state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatelessKind {
    VersionNegotiation,
    Retry,
    Reset,
}

/// Tracking state for one admitted stateless response
///
/// Owns the inciting datagram chain until the response has been built. The
/// context stays in the table after processing so its remote address keeps
/// deduplicating follow-up packets for the rest of the TTL; the last of
/// {expiration, completion} drops the final reference.
#[derive(Debug)]
pub struct StatelessContext {
    remote: SocketAddr,
    created: Instant,
    worker: Arc<Worker>,
    datagrams: Mutex<Option<Vec<RecvDatagram>>>,
    // Both flags are only written under the table lock
    processed: AtomicBool,
    expired: AtomicBool,
    pub(crate) has_binding_ref: AtomicBool,
}

impl StatelessContext {
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// The worker this operation was parked on
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Take ownership of the inciting datagrams; `None` once already taken
    pub(crate) fn take_datagrams(&self) -> Option<Vec<RecvDatagram>> {
        self.datagrams.lock().unwrap().take()
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

/// A datagram chain bounced by admission, with the drop reason
#[derive(Debug)]
pub(crate) struct AdmitRejected {
    pub(crate) datagrams: Vec<RecvDatagram>,
    pub(crate) reason: &'static str,
}

/// Per-binding table of pending stateless responses
///
/// Bounds amplification work two ways: a hard cap on concurrently tracked
/// operations, and at most one live operation per remote address. Expiration
/// is enforced lazily, on the next admission under the same lock.
pub struct StatelessOperTable {
    inner: Mutex<Inner>,
}

struct Inner {
    by_remote: FxHashMap<SocketAddr, Arc<StatelessContext>>,
    fifo: VecDeque<Arc<StatelessContext>>,
}

impl StatelessOperTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_remote: FxHashMap::default(),
                fifo: VecDeque::new(),
            }),
        }
    }

    /// Admit a new stateless operation for the chain's remote address
    ///
    /// Ages out expired entries first, then rejects if the table is full or
    /// the remote address already has a live operation.
    pub(crate) fn try_admit(
        &self,
        now: Instant,
        datagrams: Vec<RecvDatagram>,
        worker: &Arc<Worker>,
    ) -> Result<Arc<StatelessContext>, AdmitRejected> {
        let remote = datagrams[0].remote;
        let mut inner = self.inner.lock().unwrap();

        while let Some(oldest) = inner.fifo.front() {
            if now.duration_since(oldest.created) < STATELESS_OP_EXPIRATION {
                break;
            }
            oldest.expired.store(true, Ordering::Release);
            let oldest = inner.fifo.pop_front().unwrap();
            inner.by_remote.remove(&oldest.remote);
        }

        if inner.fifo.len() >= MAX_BINDING_STATELESS_OPERATIONS {
            return Err(AdmitRejected {
                datagrams,
                reason: "max binding operations reached",
            });
        }

        if inner.by_remote.contains_key(&remote) {
            return Err(AdmitRejected {
                datagrams,
                reason: "already in stateless oper table",
            });
        }

        let ctx = Arc::new(StatelessContext {
            remote,
            created: now,
            worker: worker.clone(),
            datagrams: Mutex::new(Some(datagrams)),
            processed: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            has_binding_ref: AtomicBool::new(false),
        });
        inner.by_remote.insert(remote, ctx.clone());
        inner.fifo.push_back(ctx.clone());
        Ok(ctx)
    }

    /// Mark a context processed; returns whether expiration already removed
    /// it from the table (in which case this was the final transition)
    pub(crate) fn complete(&self, ctx: &StatelessContext) -> bool {
        let _inner = self.inner.lock().unwrap();
        ctx.processed.store(true, Ordering::Release);
        ctx.expired.load(Ordering::Acquire)
    }

    /// Unconditionally empty the table at teardown
    ///
    /// Only legal once no new admissions can occur. Every remaining entry
    /// must already have been processed by its worker.
    pub(crate) fn drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(ctx) = inner.fifo.pop_front() {
            debug_assert!(ctx.is_processed());
            ctx.expired.store(true, Ordering::Release);
            inner.by_remote.remove(&ctx.remote);
        }
        debug_assert!(inner.by_remote.is_empty());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STATELESS_OP_EXPIRATION;
    use bytes::BytesMut;
    use std::time::Duration;

    fn datagram(remote: SocketAddr) -> Vec<RecvDatagram> {
        vec![RecvDatagram::new(
            "[::1]:443".parse().unwrap(),
            remote,
            BytesMut::from(&[0u8; 64][..]),
        )]
    }

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::new("203.0.113.7".parse().unwrap(), port)
    }

    #[test]
    fn duplicate_remote_rejected() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let now = Instant::now();

        table.try_admit(now, datagram(remote(1000)), &worker).unwrap();
        let err = table
            .try_admit(now, datagram(remote(1000)), &worker)
            .unwrap_err();
        assert_eq!(err.reason, "already in stateless oper table");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dedup_persists_after_processing() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let now = Instant::now();

        let ctx = table.try_admit(now, datagram(remote(1)), &worker).unwrap();
        ctx.take_datagrams();
        assert!(!table.complete(&ctx));
        // Still tracked for the rest of the TTL
        let err = table
            .try_admit(now + Duration::from_millis(10), datagram(remote(1)), &worker)
            .unwrap_err();
        assert_eq!(err.reason, "already in stateless oper table");
    }

    #[test]
    fn cardinality_bounded() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let now = Instant::now();

        for port in 0..MAX_BINDING_STATELESS_OPERATIONS as u16 {
            table
                .try_admit(now, datagram(remote(2000 + port)), &worker)
                .unwrap();
        }
        let err = table
            .try_admit(now, datagram(remote(5000)), &worker)
            .unwrap_err();
        assert_eq!(err.reason, "max binding operations reached");
        assert_eq!(table.len(), MAX_BINDING_STATELESS_OPERATIONS);
    }

    #[test]
    fn expiration_frees_capacity() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let start = Instant::now();

        for port in 0..MAX_BINDING_STATELESS_OPERATIONS as u16 {
            table
                .try_admit(start, datagram(remote(3000 + port)), &worker)
                .unwrap();
        }
        let later = start + STATELESS_OP_EXPIRATION;
        let ctx = table.try_admit(later, datagram(remote(6000)), &worker).unwrap();
        assert!(!ctx.is_expired());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expiration_reopens_remote() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let start = Instant::now();

        let first = table.try_admit(start, datagram(remote(7)), &worker).unwrap();
        let later = start + STATELESS_OP_EXPIRATION;
        let second = table.try_admit(later, datagram(remote(7)), &worker).unwrap();
        assert!(first.is_expired());
        assert!(!second.is_expired());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn drain_empties_table() {
        let table = StatelessOperTable::new();
        let worker = Worker::new();
        let now = Instant::now();

        let ctx = table.try_admit(now, datagram(remote(9)), &worker).unwrap();
        ctx.take_datagrams();
        table.complete(&ctx);
        table.drain();
        assert!(table.is_empty());
    }
}
