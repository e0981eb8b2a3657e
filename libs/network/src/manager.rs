//! Sharded connection registry
//!
//! Keys are the decimal string form of the connection id. Shards are
//! independent locks, so operations on different shards never contend.
//! Aggregates (`count`, `keys`, `range`) walk the shards one at a time and
//! see a reasonably consistent, not atomic, view.

use crate::connection::Connection;
use dashmap::DashMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of shards
pub const DEFAULT_SHARD_COUNT: usize = 32;

pub struct ConnManager {
    conns: DashMap<String, Arc<Connection>>,
    shard_count: usize,
}

impl ConnManager {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// `shards` is rounded up to a power of two, minimum 2
    pub fn with_shards(shards: usize) -> Self {
        let shard_count = shards.max(2).next_power_of_two();
        Self {
            conns: DashMap::with_shard_amount(shard_count),
            shard_count,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        if let Some(previous) = self.conns.insert(conn.conn_id_str().to_string(), conn) {
            warn!(conn_id, previous = ?previous, "connection id reused while tracked");
        }
        debug!(conn_id, count = self.count(), "connection added");
    }

    /// Forget `conn`; a different connection registered under the same id stays
    pub fn remove(&self, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let removed = self
            .conns
            .remove_if(conn.conn_id_str(), |_, tracked| Arc::ptr_eq(tracked, conn))
            .map(|(_, c)| c);
        if removed.is_some() {
            debug!(conn_id = conn.conn_id(), count = self.count(), "connection removed");
        }
        removed
    }

    pub fn remove_by_id(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.conns.remove(&conn_id.to_string()).map(|(_, c)| c)
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.get_by_str(&conn_id.to_string())
    }

    pub fn get_by_str(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.conns.get(conn_id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// String ids of every tracked connection
    pub fn keys(&self) -> Vec<String> {
        self.conns.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Numeric ids; keys that do not parse are logged and skipped
    pub fn all_conn_ids(&self) -> Vec<u64> {
        self.conns
            .iter()
            .filter_map(|entry| match entry.key().parse::<u64>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(key = %entry.key(), "unparsable connection key: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Call `f` for every connection; errors are logged and the walk continues
    ///
    /// Runs on a snapshot taken outside the shard locks, so `f` may add or
    /// remove connections. Returns the last error seen.
    pub fn range<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(u64, &Arc<Connection>) -> Result<(), E>,
        E: Display,
    {
        let mut last_err = None;
        for conn in self.snapshot() {
            if let Err(e) = f(conn.conn_id(), &conn) {
                warn!(conn_id = conn.conn_id(), "range callback failed: {}", e);
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// [`ConnManager::range`] keyed by the string id
    pub fn range_by_str<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, &Arc<Connection>) -> Result<(), E>,
        E: Display,
    {
        self.range(|_, conn| f(conn.conn_id_str(), conn))
    }

    /// Stop every connection; each leaves the registry as its own close completes
    pub fn clear_all(&self) {
        let conns = self.snapshot();
        debug!(count = conns.len(), "stopping all connections");
        for conn in conns {
            conn.stop();
        }
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnManager")
            .field("count", &self.count())
            .field("shards", &self.shard_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_rounding() {
        assert_eq!(ConnManager::new().shard_count(), 32);
        assert_eq!(ConnManager::with_shards(0).shard_count(), 2);
        assert_eq!(ConnManager::with_shards(5).shard_count(), 8);
        assert_eq!(ConnManager::with_shards(64).shard_count(), 64);
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let manager = ConnManager::new();
        assert!(manager.get(1).is_none());
        assert!(manager.get_by_str("not-a-number").is_none());
        assert!(manager.all_conn_ids().is_empty());
        assert!(manager.is_empty());
    }
}
