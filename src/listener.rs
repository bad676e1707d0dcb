use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{debug, warn};

/// Address family, ordered by registry priority
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum AddressFamily {
    Unspecified = 0,
    Inet = 1,
    Inet6 = 2,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }
}

/// What a listener binds to within its binding's local port
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListenAddress {
    /// Any family, any address
    Any,
    /// Any address within one family
    Wildcard(AddressFamily),
    /// One specific address
    Specific(IpAddr),
}

impl ListenAddress {
    fn family(&self) -> AddressFamily {
        match self {
            ListenAddress::Any => AddressFamily::Unspecified,
            ListenAddress::Wildcard(family) => *family,
            ListenAddress::Specific(ip) => AddressFamily::of(ip),
        }
    }

    fn is_wildcard(&self) -> bool {
        !matches!(self, ListenAddress::Specific(_))
    }

    fn ip(&self) -> Option<IpAddr> {
        match self {
            ListenAddress::Specific(ip) => Some(*ip),
            _ => None,
        }
    }
}

/// Liveness guard: acquiring prevents the listener being torn down while an
/// incoming handshake still references it
pub(crate) struct Rundown {
    state: Mutex<RundownState>,
    drained: Condvar,
}

struct RundownState {
    refs: usize,
    closed: bool,
}

impl Rundown {
    fn new() -> Self {
        Self {
            state: Mutex::new(RundownState {
                refs: 0,
                closed: false,
            }),
            drained: Condvar::new(),
        }
    }

    fn acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.refs += 1;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.refs > 0);
        state.refs -= 1;
        if state.refs == 0 && state.closed {
            self.drained.notify_all();
        }
    }

    /// Refuse new acquisitions and block until outstanding ones release
    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        while state.refs > 0 {
            state = self.drained.wait(state).unwrap();
        }
    }
}

/// A registered accept point: one (address, ALPN) pair on a binding
pub struct Listener {
    address: ListenAddress,
    alpn: Box<[u8]>,
    rundown: Rundown,
}

impl Listener {
    pub fn new(address: ListenAddress, alpn: &[u8]) -> Arc<Self> {
        debug_assert!(!alpn.is_empty() && alpn.len() <= u8::MAX as usize);
        Arc::new(Self {
            address,
            alpn: alpn.into(),
            rundown: Rundown::new(),
        })
    }

    pub fn address(&self) -> ListenAddress {
        self.address
    }

    pub fn alpn(&self) -> &[u8] {
        &self.alpn
    }

    pub fn family(&self) -> AddressFamily {
        self.address.family()
    }

    /// Run the listener down before dropping it: no further selections will
    /// return it, and any in-flight references have drained on return
    pub fn shutdown(&self) {
        self.rundown.shutdown();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("alpn", &String::from_utf8_lossy(&self.alpn))
            .finish()
    }
}

/// A selected listener with its rundown held; dropping releases it
pub struct ListenerRef {
    listener: Arc<Listener>,
}

impl std::ops::Deref for ListenerRef {
    type Target = Listener;
    fn deref(&self) -> &Listener {
        &self.listener
    }
}

impl Drop for ListenerRef {
    fn drop(&mut self) {
        self.listener.rundown.release();
    }
}

#[derive(Debug)]
pub(crate) enum RegisterOutcome {
    /// `first` set when this registration made the registry non-empty
    Added { first: bool },
    Duplicate,
}

/// Ordered set of a binding's listeners
///
/// Kept sorted by family descending (Inet6, Inet, Unspecified), specific
/// addresses before wildcards within a family. New listeners land at the end
/// of their equivalence group. No two listeners may share
/// (family, wildcard, address, ALPN).
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<Listener>>>,
    count: AtomicUsize,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Cheap emptiness probe for the receive path
    pub fn has_any(&self) -> bool {
        self.count.load(Ordering::Acquire) != 0
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, new: &Arc<Listener>) -> RegisterOutcome {
        let new_family = new.family();
        let new_wildcard = new.address.is_wildcard();
        let mut listeners = self.listeners.write().unwrap();

        let mut insert_at = listeners.len();
        for (i, existing) in listeners.iter().enumerate() {
            let existing_family = existing.family();
            if new_family > existing_family {
                // End of possible family matches
                insert_at = i;
                break;
            } else if new_family != existing_family {
                continue;
            }

            let existing_wildcard = existing.address.is_wildcard();
            if !new_wildcard && existing_wildcard {
                // End of specific-address matches
                insert_at = i;
                break;
            } else if new_wildcard != existing_wildcard {
                continue;
            }

            if new_family != AddressFamily::Unspecified && new.address.ip() != existing.address.ip()
            {
                continue;
            }

            if new.alpn == existing.alpn {
                warn!(listener = ?existing, "listener already registered");
                return RegisterOutcome::Duplicate;
            }
        }

        let first = listeners.is_empty();
        listeners.insert(insert_at, new.clone());
        self.count.store(listeners.len(), Ordering::Release);
        RegisterOutcome::Added { first }
    }

    pub(crate) fn unregister(&self, listener: &Arc<Listener>) {
        let mut listeners = self.listeners.write().unwrap();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.count.store(listeners.len(), Ordering::Release);
    }

    /// Select the listener for an incoming handshake
    ///
    /// `alpn_list` is the client's offer in wire form (length-prefixed
    /// entries) and its order is authoritative: the outer iteration walks the
    /// client's preferences, the inner one the registry's sorted order. The
    /// first registry hit for an ALPN decides, even if its rundown has
    /// already closed.
    pub fn select(&self, local: &SocketAddr, alpn_list: &[u8]) -> Option<ListenerRef> {
        let family = AddressFamily::of(&local.ip());
        let listeners = self.listeners.read().unwrap();

        let mut rest = alpn_list;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            rest = &rest[1..];
            if len == 0 || len > rest.len() {
                return None;
            }
            let alpn = &rest[..len];
            rest = &rest[len..];

            for listener in listeners.iter() {
                if listener.family() != AddressFamily::Unspecified {
                    if family != listener.family()
                        || (!listener.address.is_wildcard()
                            && listener.address.ip() != Some(local.ip()))
                    {
                        continue;
                    }
                }
                if alpn == &*listener.alpn {
                    return listener.rundown.acquire().then(|| ListenerRef {
                        listener: listener.clone(),
                    });
                }
            }
        }
        None
    }

    /// Trace enumeration of the registered listeners
    pub fn rundown(&self) {
        for listener in self.listeners.read().unwrap().iter() {
            debug!(listener = ?listener, "listener registered");
        }
    }
}
