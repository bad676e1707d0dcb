//! UDP binding demultiplexer for a QUIC endpoint
//!
//! A [`Binding`] owns one UDP socket and decides what every received datagram
//! becomes: delivery to an existing connection, a new connection for a
//! registered listener, a stateless response (Version Negotiation, Retry, or
//! Stateless Reset), or a diagnosed drop. It performs no I/O itself; a
//! [`Datapath`] implementation up-calls into it and carries its transmits.
//!
//! This is the point where an unauthenticated packet stream turns into
//! trusted per-connection state, so the hot path is lock-scoped and bounded:
//! CID lookups touch one partition, stateless responses are deduplicated per
//! remote address and capped per binding, and connection creation is gated on
//! worker load and handshake memory pressure.

use std::time::Duration;

mod coding;
mod varint;

mod binding;
pub use crate::binding::{Binding, BindingError, BindingStats};

mod config;
pub use crate::config::{BindingConfig, LibraryContext, Settings};

mod connection;
pub use crate::connection::{Connection, ConnectionEvent};

mod datapath;
pub use crate::datapath::{Datapath, RecvDatagram, Transmit};

mod listener;
pub use crate::listener::{AddressFamily, ListenAddress, Listener, ListenerRef};

mod lookup;
pub use crate::lookup::{CidInsertResult, CidTable};

mod packet;
pub use crate::packet::{SUPPORTED_VERSIONS, VERSION_RESERVED, VERSION_RESERVED_MASK};

mod shared;
pub use crate::shared::ConnectionId;

mod stateless;
pub use crate::stateless::{StatelessContext, StatelessKind, StatelessOperTable};

mod token;
pub use crate::token::ResetToken;

mod worker;
pub use crate::worker::{StatelessOperation, Worker, WorkerPool};


//
// Protocol constants (overridable only at build time)
//

/// How long an admitted stateless operation keeps deduplicating its remote
pub const STATELESS_OP_EXPIRATION: Duration = Duration::from_millis(3000);
/// Cap on concurrently tracked stateless operations per binding
pub const MAX_BINDING_STATELESS_OPERATIONS: usize = 16;
/// Spec floor for a stateless reset datagram
pub const MIN_STATELESS_RESET_PACKET_LENGTH: usize = 39;
/// Base length for emitted stateless resets, before randomization
pub const RECOMMENDED_STATELESS_RESET_PACKET_LENGTH: usize = 42;
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;
/// Shortest initial destination CID accepted on a shared binding
pub const MIN_INITIAL_CONNECTION_ID_LENGTH: usize = 8;
/// Length of CIDs this endpoint issues
pub const SERVER_CHOSEN_CID_LENGTH: usize = 8;

pub(crate) const MAX_CID_SIZE: usize = 20;
