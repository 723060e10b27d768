//! A keyed cache of live connections with hint-driven eviction.
//!
//! Connections fall into four buckets, from most to least worth keeping:
//! - busy: mid-message and not timed out. Never evicted while capacity allows.
//! - probable: hinted "expect response" or "expect to respond". Kept up to the hard cap, most recent activity first.
//! - maybe: hinted "expect more transactions", or unhinted but still active. Kept up to the smaller
//!   "maintained connections" cap. Connections that carried the most inbound messages are kept first.
//! - idle: unhinted and silent past the idle timeout. Evicted on sight.
//!
//! The pool never closes a connection itself. Evicted entries are handed back to the owner, which closes them and
//! fails their queued sends.

use crate::hints::CommHints;
use log::*;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use thiserror::Error;

const NICE_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

pub type ConnId = u64;

pub trait PooledConnection {
    fn conn_id(&self) -> ConnId;
    fn is_closing(&self) -> bool;
    fn is_busy(&self, timeout: Duration, now: Instant) -> bool;
    fn is_idle(&self, timeout: Duration, now: Instant) -> bool;
    fn last_io(&self) -> Instant;
    /// Complete messages received so far.
    fn inbound_messages(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub maintained_connections: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits { max_connections: 50, maintained_connections: 5, idle_timeout: Duration::from_secs(60) }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Too many busy connections to admit another one.")]
    TooManyBusyConnections,
}

/// The result of a cleanup pass: whether the pool now fits the requested size, and what was taken out of it.
pub struct Cleanup<K, C> {
    pub success: bool,
    pub evicted: Vec<(K, C)>,
}

pub struct ConnectionPool<K, C> {
    conns: HashMap<K, C>,
    by_id: HashMap<ConnId, K>,
    limits: PoolLimits,
    last_cleaned: Option<Instant>,
    last_nice_result: bool,
}

impl<K, C> ConnectionPool<K, C>
where
    K: Hash + Eq + Clone + std::fmt::Display,
    C: PooledConnection,
{
    pub fn new(limits: PoolLimits) -> Self {
        ConnectionPool {
            conns: HashMap::new(),
            by_id: HashMap::new(),
            limits,
            last_cleaned: None,
            last_nice_result: true,
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&C> {
        self.conns.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut C> {
        self.conns.get_mut(key)
    }

    pub fn key_of(&self, conn_id: ConnId) -> Option<&K> {
        self.by_id.get(&conn_id)
    }

    pub fn get_by_id_mut(&mut self, conn_id: ConnId) -> Option<&mut C> {
        let key = self.by_id.get(&conn_id)?;
        self.conns.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.conns.keys()
    }

    /// Admit a connection under `key`. An existing entry for the key is replaced and handed back with any other
    /// evicted entries. If the pool is full of busy connections the new connection is refused and returned.
    pub fn insert<H>(&mut self, key: K, conn: C, hints: H, now: Instant) -> Result<Vec<(K, C)>, (PoolError, C)>
    where
        H: Fn(&K) -> CommHints,
    {
        let mut evicted = Vec::new();
        if let Some(current) = self.conns.get(&key) {
            if current.conn_id() == conn.conn_id() {
                return Ok(evicted);
            }
        }
        if let Some(old) = self.remove(&key) {
            evicted.push((key.clone(), old));
        }
        let cap = self.limits.max_connections.saturating_sub(1);
        if self.conns.len() > cap {
            let cleanup = self.cleanup(cap, &hints, now);
            evicted.extend(cleanup.evicted);
            if !cleanup.success {
                warn!("Connection pool is full of busy connections. Refusing connection for {key}");
                return Err((PoolError::TooManyBusyConnections, conn));
            }
        }
        self.by_id.insert(conn.conn_id(), key.clone());
        self.conns.insert(key, conn);
        Ok(evicted)
    }

    pub fn remove(&mut self, key: &K) -> Option<C> {
        let conn = self.conns.remove(key)?;
        self.by_id.remove(&conn.conn_id());
        Some(conn)
    }

    /// Remove a connection by id, but only if it is the one currently held for its key.
    pub fn remove_connection(&mut self, conn_id: ConnId) -> Option<(K, C)> {
        let key = self.by_id.get(&conn_id)?.clone();
        self.remove(&key).map(|c| (key, c))
    }

    /// Move the connection held under `old` to `new`, replacing anything already there. The displaced connection is
    /// returned.
    pub fn rekey(&mut self, old: &K, new: K) -> Option<(K, C)> {
        if old == &new {
            return None;
        }
        let conn = self.remove(old)?;
        let displaced = self.remove(&new).map(|c| (new.clone(), c));
        self.by_id.insert(conn.conn_id(), new.clone());
        self.conns.insert(new, conn);
        displaced
    }

    pub fn drain(&mut self) -> Vec<(K, C)> {
        self.by_id.clear();
        self.conns.drain().collect()
    }

    /// Like [`Self::cleanup`] at the full capacity, but does nothing if a cleanup ran in the last few seconds.
    pub fn cleanup_nice<H>(&mut self, hints: H, now: Instant) -> Cleanup<K, C>
    where
        H: Fn(&K) -> CommHints,
    {
        if let Some(last) = self.last_cleaned {
            if now.saturating_duration_since(last) < NICE_CLEANUP_INTERVAL {
                return Cleanup { success: self.last_nice_result, evicted: Vec::new() };
            }
        }
        let result = self.cleanup(self.limits.max_connections, &hints, now);
        self.last_nice_result = result.success;
        result
    }

    /// Pare the pool down to at most `max_conns` connections. Fails only if more than `max_conns` connections are
    /// busy.
    pub fn cleanup<H>(&mut self, max_conns: usize, hints: &H, now: Instant) -> Cleanup<K, C>
    where
        H: Fn(&K) -> CommHints,
    {
        self.last_cleaned = Some(now);
        let timeout = self.limits.idle_timeout;
        let mut doomed = Vec::new();
        let mut probables = Vec::new();
        let mut maybes = Vec::new();
        for (key, conn) in &self.conns {
            let hint = hints(key);
            if conn.is_closing() {
                doomed.push(key.clone());
            } else if conn.is_busy(timeout, now) {
                probables.push((key.clone(), true, conn.last_io()));
            } else if hint.intersects(CommHints::EXPECT_RESPONSE | CommHints::EXPECT_TO_RESPOND) {
                probables.push((key.clone(), false, conn.last_io()));
            } else if hint.contains(CommHints::EXPECT_NO_MORE_COMMS) {
                doomed.push(key.clone());
            } else if hint.contains(CommHints::EXPECT_MORE_TRANSACTIONS) || !conn.is_idle(timeout, now) {
                maybes.push((key.clone(), conn.inbound_messages(), conn.last_io()));
            } else {
                trace!("Connection {key} is idle. Evicting.");
                doomed.push(key.clone());
            }
        }
        // Busy first, then most recent activity first.
        probables.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        // Most used first, then most recent activity first.
        maybes.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));

        let mut success = true;
        if probables.len() > max_conns {
            for (key, busy, _) in probables.split_off(max_conns) {
                if busy {
                    success = false;
                } else {
                    doomed.push(key);
                }
            }
        }
        let maybe_cap = self.limits.maintained_connections.min(max_conns.saturating_sub(probables.len()));
        if maybes.len() > maybe_cap {
            doomed.extend(maybes.split_off(maybe_cap).into_iter().map(|(k, _, _)| k));
        }
        let evicted = doomed.into_iter().filter_map(|k| self.remove(&k).map(|c| (k, c))).collect::<Vec<_>>();
        if !evicted.is_empty() {
            debug!("Connection pool cleanup evicted {} connection(s). {} remain.", evicted.len(), self.conns.len());
        }
        Cleanup { success, evicted }
    }
}
