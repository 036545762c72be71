//! # Routing table
//!
//! A mutable map from 32-byte identity hash to known peer. The table is the
//! single source of truth for peer state: insertion is first-writer-wins,
//! the local node is never present, and peers are not evicted on failure —
//! a misbehaving peer is locked for a growing backoff interval instead.
//! Bucket-based eviction is a possible future revision; the current
//! contract is append-mostly with lock/backoff.
//!
//! Reads take a shared lock, writes are serialized; the lock is never held
//! across network or file I/O.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::identity::{distance_cmp, Destination, IdentityHash};

/// Base lock interval after the first failure; doubles per failure.
const LOCK_BASE: Duration = Duration::from_secs(60);

/// Upper bound on the lock interval.
const LOCK_MAX: Duration = Duration::from_secs(60 * 60);

/// The routing key a lookup key is mapped to before XOR comparison.
///
/// Date-rotated routing keys would need directory state this node does not
/// carry; selection operates on the raw key.
#[inline]
pub fn routing_key(key: &IdentityHash) -> IdentityHash {
    *key
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub destination: Destination,
    pub hash: IdentityHash,
    locked_until: Option<Instant>,
    failures: u32,
    seq: u64,
}

impl Peer {
    fn new(destination: Destination, seq: u64) -> Self {
        let hash = destination.hash();
        Self {
            destination,
            hash,
            locked_until: None,
            failures: 0,
            seq,
        }
    }

    /// A lock timestamp in the past is equivalent to unlocked.
    pub fn is_locked(&self) -> bool {
        match self.locked_until {
            Some(until) => until > Instant::now(),
            None => false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Default)]
struct Inner {
    peers: HashMap<IdentityHash, Peer>,
    next_seq: u64,
}

pub struct RoutingTable {
    local: IdentityHash,
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new(local: IdentityHash) -> Self {
        Self {
            local,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("routing table lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("routing table lock poisoned")
    }

    pub fn local_hash(&self) -> IdentityHash {
        self.local
    }

    /// Insert a peer if absent. Rejects the local identity and duplicates;
    /// returns true only on insert.
    pub fn add(&self, destination: Destination) -> bool {
        let hash = destination.hash();
        if hash == self.local {
            debug!("skipping local destination");
            return false;
        }
        let mut inner = self.write();
        if inner.peers.contains_key(&hash) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.peers.insert(hash, Peer::new(destination, seq));
        true
    }

    /// Insert from a Base64 line (peer file, bootstrap config, wire `from`).
    pub fn add_base64(&self, encoded: &str) -> bool {
        match Destination::from_base64(encoded) {
            Ok(dest) => self.add(dest),
            Err(e) => {
                debug!(error = %e, "cannot build peer from base64");
                false
            }
        }
    }

    pub fn get(&self, hash: &IdentityHash) -> Option<Peer> {
        self.read().peers.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().peers.is_empty()
    }

    pub fn all(&self) -> Vec<Peer> {
        self.read().peers.values().cloned().collect()
    }

    pub fn unlocked(&self) -> Vec<Peer> {
        self.read()
            .peers
            .values()
            .filter(|p| !p.is_locked())
            .cloned()
            .collect()
    }

    /// Up to `n` unlocked peers minimizing XOR distance to the routing key.
    ///
    /// With `to_us` set, only peers strictly closer to the key than the
    /// local node are admitted. Ties break by insertion order, and the
    /// result is sorted non-decreasing in distance.
    pub fn k_closest(&self, key: &IdentityHash, n: usize, to_us: bool) -> Vec<Peer> {
        if n == 0 {
            return Vec::new();
        }
        let dest_key = routing_key(key);
        let our_metric = dest_key.xor_distance(&self.local);

        let mut candidates: Vec<(Peer, [u8; 32])> = self
            .read()
            .peers
            .values()
            .filter(|p| !p.is_locked())
            .map(|p| {
                let dist = dest_key.xor_distance(&p.hash);
                (p.clone(), dist)
            })
            .filter(|(_, dist)| {
                !to_us || distance_cmp(dist, &our_metric) == std::cmp::Ordering::Less
            })
            .collect();

        candidates.sort_by(|(a, da), (b, db)| distance_cmp(da, db).then_with(|| a.seq.cmp(&b.seq)));
        candidates.truncate(n);
        candidates.into_iter().map(|(p, _)| p).collect()
    }

    /// Clear one failure step and unlock; called when a peer answers.
    pub fn mark_responsive(&self, hash: &IdentityHash) {
        let mut inner = self.write();
        if let Some(peer) = inner.peers.get_mut(hash) {
            peer.failures = peer.failures.saturating_sub(1);
            peer.locked_until = None;
        }
    }

    /// Record a missed response and lock the peer for a growing interval.
    pub fn mark_failed(&self, hash: &IdentityHash) {
        let mut inner = self.write();
        if let Some(peer) = inner.peers.get_mut(hash) {
            peer.failures = peer.failures.saturating_add(1);
            let shift = peer.failures.min(6);
            let lock = LOCK_BASE.saturating_mul(1 << (shift - 1)).min(LOCK_MAX);
            peer.locked_until = Some(Instant::now() + lock);
        }
    }

    /// Write the peer file: header comment, one Base64 destination per line.
    pub fn persist_snapshot<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let peers = self.all();
        writeln!(writer, "# Each line is one Base64-encoded destination.")?;
        writeln!(
            writer,
            "# This file is rewritten periodically; do not edit it while the daemon is running."
        )?;
        writeln!(writer)?;
        for peer in &peers {
            writeln!(writer, "{}", peer.destination.to_base64())?;
        }
        Ok(())
    }

    /// Load peers from a peer file; `#` and blank lines are ignored.
    /// Returns the number of peers inserted.
    pub fn load_snapshot<R: BufRead>(&self, reader: R) -> usize {
        let mut added = 0usize;
        let mut duplicates = 0usize;
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "unreadable line in peer file");
                    continue;
                }
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if self.add_base64(line) {
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        info!(added, duplicates, "peer file loaded");
        added
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("peers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_destination;

    fn table_with_local(seed: u8) -> (RoutingTable, Destination) {
        let local = test_destination(seed);
        (RoutingTable::new(local.hash()), local)
    }

    #[test]
    fn add_rejects_local_and_duplicates() {
        let (table, local) = table_with_local(0);
        assert!(!table.add(local.clone()));

        let peer = test_destination(1);
        assert!(table.add(peer.clone()));
        assert!(!table.add(peer.clone()));
        assert_eq!(table.len(), 1);

        // every stored peer satisfies hash(identity) == identity_hash
        for p in table.all() {
            assert_eq!(p.destination.hash(), p.hash);
            assert_ne!(p.hash, table.local_hash());
        }
    }

    #[test]
    fn add_base64_rejects_garbage() {
        let (table, _) = table_with_local(0);
        assert!(!table.add_base64("not!base64"));
        assert!(!table.add_base64("aGVsbG8="));
        assert!(table.is_empty());
    }

    #[test]
    fn k_closest_sorted_and_bounded() {
        let (table, _) = table_with_local(0);
        for seed in 1..=8u8 {
            table.add(test_destination(seed));
        }
        let key = test_destination(3).hash();
        let closest = table.k_closest(&key, 5, false);
        assert_eq!(closest.len(), 5);

        let dest_key = routing_key(&key);
        for pair in closest.windows(2) {
            let da = dest_key.xor_distance(&pair[0].hash);
            let db = dest_key.xor_distance(&pair[1].hash);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }

        let everything = table.k_closest(&key, 100, false);
        assert_eq!(everything.len(), 8);
    }

    #[test]
    fn bias_toward_self_admits_only_strictly_closer() {
        let (table, local) = table_with_local(0);
        for seed in 1..=6u8 {
            table.add(test_destination(seed));
        }
        let key = test_destination(9).hash();
        let our_metric = routing_key(&key).xor_distance(&local.hash());

        for peer in table.k_closest(&key, 100, true) {
            let dist = routing_key(&key).xor_distance(&peer.hash);
            assert_eq!(distance_cmp(&dist, &our_metric), std::cmp::Ordering::Less);
        }

        // biased selection is a subset of the unbiased one
        let own_key = local.hash();
        let biased = table.k_closest(&own_key, 100, true);
        let unbiased = table.k_closest(&own_key, 100, false);
        assert!(biased.len() <= unbiased.len());
    }

    #[test]
    fn locked_peers_are_skipped() {
        let (table, _) = table_with_local(0);
        let a = test_destination(1);
        let b = test_destination(2);
        table.add(a.clone());
        table.add(b.clone());

        table.mark_failed(&a.hash());
        let unlocked = table.unlocked();
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].hash, b.hash());
        assert_eq!(table.k_closest(&b.hash(), 10, false).len(), 1);

        table.mark_responsive(&a.hash());
        assert_eq!(table.unlocked().len(), 2);
        assert_eq!(table.get(&a.hash()).unwrap().failures(), 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let (table, _) = table_with_local(0);
        for seed in 1..=3u8 {
            table.add(test_destination(seed));
        }

        let mut buf = Vec::new();
        table.persist_snapshot(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with('#'));

        let (restored, _) = table_with_local(0);
        let added = restored.load_snapshot(std::io::Cursor::new(buf));
        assert_eq!(added, 3);
        for peer in table.all() {
            assert!(restored.get(&peer.hash).is_some());
        }
    }

    #[test]
    fn load_snapshot_ignores_comments_and_blanks() {
        let (table, _) = table_with_local(0);
        let text = format!(
            "# header\n\n{}\n# trailing comment\n\n",
            test_destination(5).to_base64()
        );
        let added = table.load_snapshot(std::io::Cursor::new(text.into_bytes()));
        assert_eq!(added, 1);
        assert_eq!(table.len(), 1);
    }
}
