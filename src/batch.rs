//! # Packet batches
//!
//! A batch multiplexes a set of in-flight requests over the shared inbound
//! queue. Each outbound request is registered under its 32-byte correlation
//! id before anything is sent; inbound packets are matched by CID *and*
//! source destination, delivered at most once per CID, and exposed to the
//! waiting caller in arrival order.
//!
//! Waits are condition-style: the caller blocks on [`PacketBatch::wait_first`]
//! or [`PacketBatch::wait_all`] until enough responses arrive or the timeout
//! elapses. Retries retransmit only the still-unanswered CIDs, so an answered
//! peer is never asked twice.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

use crate::packet::{Cid, CommPacket};

/// Fresh correlation id from the OS CSPRNG. Uniqueness across live batches
/// rests on the 256-bit birthday bound.
pub fn random_cid() -> Cid {
    let mut cid = [0u8; 32];
    OsRng.fill_bytes(&mut cid);
    cid
}

/// An outbound request queued for the transport.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// Base64 destination the request goes to.
    pub destination: String,
    pub payload: Vec<u8>,
}

/// A parsed inbound packet together with its source destination.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub from: String,
    pub packet: CommPacket,
}

#[derive(Default)]
struct BatchInner {
    requests: HashMap<Cid, QueuedPacket>,
    answered: HashSet<Cid>,
    responses: Vec<ReceivedPacket>,
}

pub struct PacketBatch {
    owner: String,
    inner: Mutex<BatchInner>,
    signal: Notify,
}

impl PacketBatch {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: Mutex::new(BatchInner::default()),
            signal: Notify::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchInner> {
        self.inner.lock().expect("batch lock poisoned")
    }

    /// Register an outbound request. Must happen before the first send so a
    /// racing response cannot be lost.
    pub fn add(&self, cid: Cid, destination: String, payload: Vec<u8>) {
        let mut inner = self.lock();
        inner
            .requests
            .insert(cid, QueuedPacket { destination, payload });
    }

    pub fn remove(&self, cid: &Cid) {
        let mut inner = self.lock();
        inner.requests.remove(cid);
        inner.answered.remove(cid);
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn response_count(&self) -> usize {
        self.lock().responses.len()
    }

    /// Requests that have not been answered yet; these are what a retry
    /// retransmits.
    pub fn unanswered(&self) -> Vec<(Cid, QueuedPacket)> {
        let inner = self.lock();
        inner
            .requests
            .iter()
            .filter(|(cid, _)| !inner.answered.contains(*cid))
            .map(|(cid, packet)| (*cid, packet.clone()))
            .collect()
    }

    /// Offer an inbound packet to this batch. Accepted only when the CID is
    /// an outstanding request of this batch, the source matches the request's
    /// destination, and the CID has not been answered before.
    pub fn deliver(&self, from: &str, packet: CommPacket) -> bool {
        let mut inner = self.lock();
        let matches = match inner.requests.get(&packet.cid) {
            Some(request) => request.destination == from,
            None => false,
        };
        if !matches || inner.answered.contains(&packet.cid) {
            return false;
        }
        inner.answered.insert(packet.cid);
        inner.responses.push(ReceivedPacket {
            from: from.to_string(),
            packet,
        });
        drop(inner);
        self.signal.notify_waiters();
        true
    }

    /// Block until at least one response arrived or the timeout elapsed.
    /// Returns whether the condition was met.
    pub async fn wait_first(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |inner| !inner.responses.is_empty())
            .await
    }

    /// Block until every registered CID has a response or the timeout
    /// elapsed. Returns whether the condition was met.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |inner| {
            inner.answered.len() >= inner.requests.len()
        })
        .await
    }

    async fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&BatchInner) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            // arm the waiter before checking, so a delivery between the
            // check and the await still wakes us
            let mut notified = std::pin::pin!(self.signal.notified());
            notified.as_mut().enable();
            if done(&self.lock()) {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return done(&self.lock());
            }
        }
    }

    /// Snapshot of the responses accumulated so far, in arrival order.
    pub fn responses(&self) -> Vec<ReceivedPacket> {
        self.lock().responses.clone()
    }

    /// Drop accumulated responses. Answered CIDs stay answered, preserving
    /// the at-most-once delivery per CID.
    pub fn clear_responses(&self) {
        self.lock().responses.clear();
    }
}

impl std::fmt::Debug for PacketBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PacketBatch")
            .field("owner", &self.owner)
            .field("requests", &inner.requests.len())
            .field("responses", &inner.responses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketType, ResponsePacket, StatusCode, PROTOCOL_V4};
    use std::sync::Arc;

    fn response_packet(cid: Cid) -> CommPacket {
        CommPacket::new(
            PacketType::Response,
            PROTOCOL_V4,
            cid,
            ResponsePacket::new(StatusCode::Ok, vec![]).encode(),
        )
    }

    #[test]
    fn deliver_requires_matching_cid_and_source() {
        let batch = PacketBatch::new("test");
        let cid = random_cid();
        batch.add(cid, "peer-a".into(), vec![1]);

        // wrong source
        assert!(!batch.deliver("peer-b", response_packet(cid)));
        // unknown cid
        assert!(!batch.deliver("peer-a", response_packet(random_cid())));
        // match
        assert!(batch.deliver("peer-a", response_packet(cid)));
        // at most once per cid
        assert!(!batch.deliver("peer-a", response_packet(cid)));

        assert_eq!(batch.response_count(), 1);
        // every answered cid is a registered request
        for received in batch.responses() {
            assert!(batch
                .unanswered()
                .iter()
                .all(|(cid, _)| *cid != received.packet.cid));
        }
    }

    #[test]
    fn unanswered_shrinks_as_responses_arrive() {
        let batch = PacketBatch::new("test");
        let a = random_cid();
        let b = random_cid();
        batch.add(a, "peer-a".into(), vec![]);
        batch.add(b, "peer-b".into(), vec![]);
        assert_eq!(batch.unanswered().len(), 2);

        batch.deliver("peer-a", response_packet(a));
        let rest = batch.unanswered();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, b);
    }

    #[test]
    fn responses_kept_in_arrival_order() {
        let batch = PacketBatch::new("test");
        let cids: Vec<Cid> = (0..4u8).map(|_| random_cid()).collect();
        for cid in &cids {
            batch.add(*cid, "peer".into(), vec![]);
        }
        for cid in cids.iter().rev() {
            batch.deliver("peer", response_packet(*cid));
        }
        let got: Vec<Cid> = batch.responses().iter().map(|r| r.packet.cid).collect();
        let want: Vec<Cid> = cids.into_iter().rev().collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn wait_first_wakes_on_delivery() {
        let batch = Arc::new(PacketBatch::new("test"));
        let cid = random_cid();
        batch.add(cid, "peer".into(), vec![]);

        let waiter = batch.clone();
        let handle = tokio::spawn(async move { waiter.wait_first(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        batch.deliver("peer", response_packet(cid));
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_all_times_out_when_short() {
        let batch = PacketBatch::new("test");
        let a = random_cid();
        let b = random_cid();
        batch.add(a, "peer-a".into(), vec![]);
        batch.add(b, "peer-b".into(), vec![]);

        batch.deliver("peer-a", response_packet(a));
        assert!(!batch.wait_all(Duration::from_millis(50)).await);
        assert!(batch.wait_first(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_all_on_empty_batch_is_immediate() {
        let batch = PacketBatch::new("test");
        assert!(batch.wait_all(Duration::from_millis(10)).await);
    }

    #[test]
    fn clear_responses_keeps_answered() {
        let batch = PacketBatch::new("test");
        let cid = random_cid();
        batch.add(cid, "peer".into(), vec![]);
        batch.deliver("peer", response_packet(cid));
        batch.clear_responses();
        assert_eq!(batch.response_count(), 0);
        assert!(!batch.deliver("peer", response_packet(cid)));
        assert!(batch.unanswered().is_empty());
    }

    #[test]
    fn random_cids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(random_cid()));
        }
    }
}
