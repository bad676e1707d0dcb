use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use ring::aead;

use crate::worker::{Worker, WorkerPool};

/// Estimated memory footprint of one connection during its handshake, used
/// for the Retry admission gate
const HANDSHAKE_CONNECTION_MEMORY: u64 = 6 * 1024;

/// Process-wide tunables
///
/// `retry_memory_limit` is a fraction of `total_memory` in 1/65535 units;
/// once aggregate handshake memory passes it, new Initials must present a
/// valid Retry token.
#[derive(Debug, Clone)]
pub struct Settings {
    pub retry_memory_limit: u16,
    pub total_memory: u64,
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_memory_limit: 65, // ~0.1%
            total_memory: 1 << 30,
            workers: 1,
        }
    }
}

/// Process-wide immutable context threaded through every binding
///
/// Owns the Retry AEAD key, the supported-version list (a build-time
/// constant), the memory estimate backing the Retry gate, and the worker
/// pool. Nothing here is ambient global state.
pub struct LibraryContext {
    settings: Settings,
    retry_key: aead::LessSafeKey,
    current_handshake_memory: AtomicU64,
    worker_pool: WorkerPool,
}

impl LibraryContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        let mut secret = [0; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let retry_key = aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_256_GCM, &secret)
                .expect("AES-256-GCM accepts a 32-byte key"),
        );
        let workers = settings.workers;
        Arc::new(Self {
            settings,
            retry_key,
            current_handshake_memory: AtomicU64::new(0),
            worker_pool: WorkerPool::new(workers),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn retry_key(&self) -> &aead::LessSafeKey {
        &self.retry_key
    }

    pub fn worker(&self) -> Arc<Worker> {
        self.worker_pool.get()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    /// Whether handshake memory pressure currently demands address validation
    pub(crate) fn retry_required(&self) -> bool {
        let limit = (u64::from(self.settings.retry_memory_limit) * self.settings.total_memory)
            / u64::from(u16::MAX);
        self.current_handshake_memory.load(Ordering::Relaxed) >= limit
    }

    pub(crate) fn on_handshake_started(&self) {
        self.current_handshake_memory
            .fetch_add(HANDSHAKE_CONNECTION_MEMORY, Ordering::Relaxed);
    }

    pub(crate) fn on_handshake_ended(&self) {
        let prev = self
            .current_handshake_memory
            .fetch_sub(HANDSHAKE_CONNECTION_MEMORY, Ordering::Relaxed);
        debug_assert!(prev >= HANDSHAKE_CONNECTION_MEMORY);
    }

    pub fn current_handshake_memory(&self) -> u64 {
        self.current_handshake_memory.load(Ordering::Relaxed)
    }
}

/// Parameters for creating a binding
#[derive(Debug, Clone, Default)]
pub struct BindingConfig {
    /// Allow multiple connections on the socket; `false` pins the binding to
    /// one connection and disables CIDs entirely
    pub share: bool,
    /// Pin the socket to a single remote peer (client-style use)
    pub remote: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_gate_tracks_handshake_memory() {
        let ctx = LibraryContext::new(Settings {
            retry_memory_limit: u16::MAX,
            total_memory: 2 * HANDSHAKE_CONNECTION_MEMORY,
            workers: 1,
        });
        assert!(!ctx.retry_required());
        ctx.on_handshake_started();
        assert!(!ctx.retry_required());
        ctx.on_handshake_started();
        assert!(ctx.retry_required());
        ctx.on_handshake_ended();
        assert!(!ctx.retry_required());
    }

    #[test]
    fn zero_limit_always_requires_retry() {
        let ctx = LibraryContext::new(Settings {
            retry_memory_limit: 0,
            total_memory: 1 << 30,
            workers: 1,
        });
        assert!(ctx.retry_required());
    }
}
