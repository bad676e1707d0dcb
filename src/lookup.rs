use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use rustc_hash::FxHashMap;

use crate::connection::Connection;
use crate::shared::ConnectionId;

/// Outcome of inserting a source CID
///
/// A collision hands back the already-present connection and leaves the table
/// untouched; the existing connection always wins.
#[derive(Debug)]
pub enum CidInsertResult {
    Inserted,
    Collided(Arc<Connection>),
}

type Partition = Mutex<FxHashMap<ConnectionId, Arc<Connection>>>;

/// Concurrent map from source CID to connection
///
/// Starts with a single partition and grows, once, to the CPU count when the
/// owning binding first gains a listener. Lookups take the shared lock on the
/// partition vector plus exactly one partition lock; the partition is derived
/// from the CID's first byte, which locally issued CIDs use as a hint.
///
/// The secondary remote-address index only exists on bindings pinned to a
/// single peer, where ICMP unreachable notifications have no CID to route by.
pub struct CidTable {
    partitions: RwLock<Vec<Partition>>,
    by_remote: Option<Mutex<FxHashMap<SocketAddr, Arc<Connection>>>>,
}

fn partition_index(cid: &ConnectionId, count: usize) -> usize {
    cid.first().copied().unwrap_or(0) as usize % count
}

impl CidTable {
    pub fn new(track_remotes: bool) -> Self {
        Self {
            partitions: RwLock::new(vec![Mutex::new(FxHashMap::default())]),
            by_remote: track_remotes.then(|| Mutex::new(FxHashMap::default())),
        }
    }

    /// Grow to one partition per CPU. Monotone: repeated calls are no-ops.
    pub fn maximize_partitioning(&self) -> bool {
        let mut partitions = self.partitions.write().unwrap();
        if partitions.len() > 1 {
            return true;
        }
        let count = thread::available_parallelism().map_or(1, |n| n.get());
        if count == 1 {
            return true;
        }
        let old = std::mem::take(&mut *partitions);
        let mut grown: Vec<Partition> = (0..count)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        for partition in old {
            for (cid, conn) in partition.into_inner().unwrap() {
                grown[partition_index(&cid, count)]
                    .get_mut()
                    .unwrap()
                    .insert(cid, conn);
            }
        }
        *partitions = grown;
        true
    }

    pub fn insert(&self, cid: ConnectionId, conn: &Arc<Connection>) -> CidInsertResult {
        let partitions = self.partitions.read().unwrap();
        let mut partition = partitions[partition_index(&cid, partitions.len())]
            .lock()
            .unwrap();
        if let Some(existing) = partition.get(&cid) {
            return CidInsertResult::Collided(existing.clone());
        }
        partition.insert(cid, conn.clone());
        drop(partition);
        drop(partitions);

        conn.record_source_cid(cid);
        if let Some(by_remote) = &self.by_remote {
            by_remote
                .lock()
                .unwrap()
                .insert(conn.remote_address(), conn.clone());
        }
        CidInsertResult::Inserted
    }

    pub fn remove(&self, cid: &ConnectionId) {
        let partitions = self.partitions.read().unwrap();
        let removed = partitions[partition_index(cid, partitions.len())]
            .lock()
            .unwrap()
            .remove(cid);
        drop(partitions);
        if let Some(conn) = removed {
            conn.forget_source_cid(cid);
        }
    }

    /// Remove every CID mapping to `conn`, and its remote-index entry
    pub fn remove_all(&self, conn: &Arc<Connection>) {
        let partitions = self.partitions.read().unwrap();
        for partition in partitions.iter() {
            partition
                .lock()
                .unwrap()
                .retain(|_, c| !Arc::ptr_eq(c, conn));
        }
        drop(partitions);
        conn.forget_all_source_cids();
        if let Some(by_remote) = &self.by_remote {
            by_remote
                .lock()
                .unwrap()
                .retain(|_, c| !Arc::ptr_eq(c, conn));
        }
    }

    /// Atomically migrate all of `conn`'s CIDs from `src` to `dst`
    ///
    /// Both partition vectors are locked exclusively, in table address order,
    /// so a concurrent `move_all` in the opposite direction cannot deadlock.
    pub fn move_all(src: &CidTable, dst: &CidTable, conn: &Arc<Connection>) {
        if std::ptr::eq(src, dst) {
            return;
        }
        let src_first = (src as *const CidTable as usize) < (dst as *const CidTable as usize);
        let (mut first, mut second) = if src_first {
            (
                src.partitions.write().unwrap(),
                dst.partitions.write().unwrap(),
            )
        } else {
            (
                dst.partitions.write().unwrap(),
                src.partitions.write().unwrap(),
            )
        };
        let (src_parts, dst_parts) = if src_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        let mut moved = Vec::new();
        for partition in src_parts.iter_mut() {
            let map = partition.get_mut().unwrap();
            map.retain(|cid, c| {
                if Arc::ptr_eq(c, conn) {
                    moved.push(*cid);
                    false
                } else {
                    true
                }
            });
        }
        let count = dst_parts.len();
        for cid in moved {
            dst_parts[partition_index(&cid, count)]
                .get_mut()
                .unwrap()
                .insert(cid, conn.clone());
        }
        drop(first);
        drop(second);

        if let Some(by_remote) = &src.by_remote {
            by_remote
                .lock()
                .unwrap()
                .retain(|_, c| !Arc::ptr_eq(c, conn));
        }
        if let Some(by_remote) = &dst.by_remote {
            by_remote
                .lock()
                .unwrap()
                .insert(conn.remote_address(), conn.clone());
        }
    }

    /// Look up the connection a packet's destination CID routes to
    ///
    /// The returned clone is the caller's liveness guard; drop it after the
    /// datagrams are queued.
    pub fn find_by_cid(&self, cid: &ConnectionId) -> Option<Arc<Connection>> {
        let partitions = self.partitions.read().unwrap();
        let result = partitions[partition_index(cid, partitions.len())]
            .lock()
            .unwrap()
            .get(cid)
            .cloned();
        result
    }

    pub fn find_by_remote(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.by_remote
            .as_ref()?
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().unwrap().len()
    }

    pub fn len(&self) -> usize {
        let partitions = self.partitions.read().unwrap();
        partitions.iter().map(|p| p.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn conn(port: u16) -> Arc<Connection> {
        Connection::new(
            "[::1]:443".parse().unwrap(),
            SocketAddr::new("203.0.113.9".parse().unwrap(), port),
        )
    }

    fn cid(first: u8) -> ConnectionId {
        let mut bytes = [0xee; 8];
        bytes[0] = first;
        ConnectionId::new(&bytes)
    }

    #[test]
    fn insert_find_remove() {
        let table = CidTable::new(false);
        let c = conn(1);
        assert_matches!(table.insert(cid(1), &c), CidInsertResult::Inserted);
        assert!(Arc::ptr_eq(&table.find_by_cid(&cid(1)).unwrap(), &c));
        assert_eq!(c.source_cids(), vec![cid(1)]);
        table.remove(&cid(1));
        assert!(table.find_by_cid(&cid(1)).is_none());
        assert!(c.source_cids().is_empty());
    }

    #[test]
    fn collision_returns_existing() {
        let table = CidTable::new(false);
        let first = conn(1);
        let second = conn(2);
        table.insert(cid(5), &first);
        let existing = match table.insert(cid(5), &second) {
            CidInsertResult::Collided(existing) => existing,
            CidInsertResult::Inserted => panic!("collision not detected"),
        };
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(table.len(), 1);
        assert!(second.source_cids().is_empty());
    }

    #[test]
    fn connection_under_multiple_cids() {
        let table = CidTable::new(false);
        let c = conn(1);
        for first in 0..4 {
            table.insert(cid(first), &c);
        }
        assert_eq!(table.len(), 4);
        table.remove_all(&c);
        assert!(table.is_empty());
    }

    #[test]
    fn maximize_preserves_entries() {
        let table = CidTable::new(false);
        let conns: Vec<_> = (0..8).map(conn).collect();
        for (i, c) in conns.iter().enumerate() {
            table.insert(cid(i as u8), c);
        }
        assert!(table.maximize_partitioning());
        assert!(table.maximize_partitioning()); // idempotent
        for (i, c) in conns.iter().enumerate() {
            assert!(Arc::ptr_eq(&table.find_by_cid(&cid(i as u8)).unwrap(), c));
        }
    }

    #[test]
    fn move_all_migrates() {
        let src = CidTable::new(false);
        let dst = CidTable::new(false);
        dst.maximize_partitioning();
        let c = conn(1);
        let other = conn(2);
        src.insert(cid(0), &c);
        src.insert(cid(1), &c);
        src.insert(cid(2), &other);

        CidTable::move_all(&src, &dst, &c);
        assert_eq!(src.len(), 1);
        assert_eq!(dst.len(), 2);
        assert!(dst.find_by_cid(&cid(0)).is_some());
        assert!(dst.find_by_cid(&cid(1)).is_some());
        assert!(src.find_by_cid(&cid(2)).is_some());
    }

    #[test]
    fn remote_index_tracks_pinned_peer() {
        let table = CidTable::new(true);
        let c = conn(7);
        table.insert(cid(3), &c);
        let remote = c.remote_address();
        assert!(Arc::ptr_eq(&table.find_by_remote(&remote).unwrap(), &c));
        table.remove_all(&c);
        assert!(table.find_by_remote(&remote).is_none());
    }

    #[test]
    fn untracked_remote_index_finds_nothing() {
        let table = CidTable::new(false);
        let c = conn(7);
        table.insert(cid(3), &c);
        assert!(table.find_by_remote(&c.remote_address()).is_none());
    }
}
