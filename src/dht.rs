//! # DHT engine
//!
//! The engine drives the iterative closest-peers search and the
//! lookup/store/delete operations built on top of it, and answers the same
//! requests when they arrive from other peers.
//!
//! The lookup deliberately seeds its candidate set with every known peer
//! and keeps them all in flight at once, pruning by response. Textbook
//! Kademlia would seed with the K closest and bound the window by ALPHA;
//! querying broadly first and pruning by response is the current contract,
//! and the narrower seeding is a future optimization. [`ALPHA`] is carried
//! for that revision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::batch::{random_cid, PacketBatch, ReceivedPacket};
use crate::fabric::PacketFabric;
use crate::identity::{Destination, IdentityHash};
use crate::packet::{
    is_peer_list_marker, CommPacket, EmailDeleteRequest, FindClosePeersRequest, IndexDeleteEntry,
    IndexDeleteRequest, PacketType, PeerList, RecordType, ResponsePacket, RetrieveRequest,
    StatusCode, StoreRequest, PROTOCOL_V5,
};
use crate::routing::{Peer, RoutingTable};
use crate::storage::PacketStore;

/// Closest-peers target for selections and peer-list replies.
pub const K: usize = 20;

/// Below this many close peers, operations fall back to every known peer.
pub const MIN_CLOSEST_NODES: usize = 5;

/// Kademlia parallelism bound. Unused while the lookup keeps every
/// candidate in flight; kept for the narrower-seeding revision.
pub const ALPHA: usize = 3;

/// Per-batch wait deadline per send attempt.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global deadline for one iterative lookup.
pub const CLOSEST_NODES_LOOKUP_TIMEOUT: Duration = Duration::from_secs(25);

/// Additional send+wait cycles after a silent first round.
pub const MAX_RETRIES: usize = 5;

#[derive(Clone)]
pub struct DhtEngine {
    local: Destination,
    routing: Arc<RoutingTable>,
    fabric: Arc<PacketFabric>,
    store: Arc<dyn PacketStore>,
}

impl DhtEngine {
    pub fn new(
        local: Destination,
        routing: Arc<RoutingTable>,
        fabric: Arc<PacketFabric>,
        store: Arc<dyn PacketStore>,
    ) -> Self {
        Self {
            local,
            routing,
            fabric,
            store,
        }
    }

    pub fn local_destination(&self) -> &Destination {
        &self.local
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn fabric(&self) -> &Arc<PacketFabric> {
        &self.fabric
    }

    pub fn store_backend(&self) -> &Arc<dyn PacketStore> {
        &self.store
    }

    /// Iterative closest-peers search converging on the peers nearest `key`.
    ///
    /// Returns the union of every peer learned from OK peer-list responses,
    /// not pruned to the K best (kept contract; callers select themselves).
    pub async fn closest_nodes_lookup(&self, key: &IdentityHash) -> Vec<Peer> {
        let batch = Arc::new(PacketBatch::new("dht::closest_nodes_lookup"));
        let mut outstanding: HashMap<[u8; 32], IdentityHash> = HashMap::new();

        // all candidates in parallel; see module docs
        for peer in self.routing.all() {
            let request = FindClosePeersRequest {
                key: *key.as_bytes(),
            };
            let cid = random_cid();
            let packet =
                CommPacket::new(PacketType::FindClosePeers, PROTOCOL_V5, cid, request.encode());
            outstanding.insert(cid, peer.hash);
            batch.add(cid, peer.destination.to_base64(), packet.encode());
        }

        if outstanding.is_empty() {
            debug!("no peers to query");
            return Vec::new();
        }

        self.fabric.register(batch.clone());
        let started = Instant::now();

        while !outstanding.is_empty() && started.elapsed() < CLOSEST_NODES_LOOKUP_TIMEOUT {
            debug!(pending = outstanding.len(), "sending lookup batch");
            self.fabric.send_batch(&batch).await;
            batch.wait_all(RESPONSE_TIMEOUT).await;

            let responses = batch.responses();
            if responses.is_empty() {
                warn!("no lookup responses, resending batch");
                continue;
            }
            for response in &responses {
                if let Some(hash) = outstanding.remove(&response.packet.cid) {
                    self.routing.mark_responsive(&hash);
                }
            }
            if responses.len() >= MIN_CLOSEST_NODES {
                break;
            }
        }

        let responses = batch.responses();
        self.fabric.unregister(&batch);

        for hash in outstanding.values() {
            self.routing.mark_failed(hash);
        }

        let mut closest = Vec::new();
        let mut seen: HashSet<IdentityHash> = HashSet::new();
        for response in &responses {
            if response.packet.packet_type != PacketType::Response {
                warn!(
                    packet_type = ?response.packet.packet_type,
                    version = response.packet.version,
                    "non-response packet in lookup batch"
                );
                continue;
            }
            let parsed = match ResponsePacket::decode(&response.packet.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "undecodable lookup response");
                    continue;
                }
            };
            if parsed.status != StatusCode::Ok {
                warn!(status = %parsed.status, "lookup response status");
                continue;
            }
            if parsed.data.len() < 4 {
                warn!("lookup response without payload, skip parsing");
                continue;
            }
            if !is_peer_list_marker(parsed.data[0]) {
                warn!(marker = parsed.data[0], "lookup response is not a peer list");
                continue;
            }
            match PeerList::decode(&parsed.data) {
                Ok(list) => {
                    for dest in list.peers {
                        let hash = dest.hash();
                        self.routing.add(dest);
                        if seen.insert(hash) {
                            if let Some(peer) = self.routing.get(&hash) {
                                closest.push(peer);
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "undecodable peer list"),
            }
        }

        debug!(
            peers = closest.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "closest nodes lookup finished"
        );
        closest
    }

    /// Peers an operation on `key` should address: the lookup result, padded
    /// with every known peer when the close set is too small. Empty when the
    /// network is too sparse to be useful.
    async fn eligible_peers(&self, key: &IdentityHash) -> Vec<Peer> {
        let mut peers = self.closest_nodes_lookup(key).await;
        if peers.len() < MIN_CLOSEST_NODES {
            warn!(
                close = peers.len(),
                "not enough close peers, using every known peer"
            );
            let mut seen: HashSet<IdentityHash> = peers.iter().map(|p| p.hash).collect();
            for peer in self.routing.all() {
                if seen.insert(peer.hash) {
                    peers.push(peer);
                }
            }
            if peers.len() < MIN_CLOSEST_NODES {
                warn!(known = peers.len(), "not enough peers for the operation");
                return Vec::new();
            }
        }
        peers
    }

    /// Register, send and wait, retrying while the batch stays silent.
    async fn run_batch(&self, batch: &Arc<PacketBatch>, exhaustive: bool) {
        self.fabric.register(batch.clone());
        self.fabric.send_batch(batch).await;
        self.wait(batch, exhaustive).await;

        let mut attempt = 0;
        while batch.response_count() == 0 && attempt < MAX_RETRIES {
            warn!(
                owner = batch.owner(),
                attempt, "no responses, resending batch"
            );
            self.fabric.send_batch(batch).await;
            self.wait(batch, exhaustive).await;
            attempt += 1;
        }
        self.fabric.unregister(batch);
    }

    async fn wait(&self, batch: &PacketBatch, exhaustive: bool) {
        if exhaustive {
            batch.wait_all(RESPONSE_TIMEOUT).await;
        } else {
            batch.wait_first(RESPONSE_TIMEOUT).await;
        }
    }

    /// Retrieve a record, satisfied by the first answering peer.
    pub async fn find_one(
        &self,
        key: &IdentityHash,
        record_type: RecordType,
    ) -> Vec<ReceivedPacket> {
        self.find(key, record_type, false).await
    }

    /// Retrieve a record from every close peer; some peers may hold an
    /// incomplete set, and deletes want every holder.
    pub async fn find_all(
        &self,
        key: &IdentityHash,
        record_type: RecordType,
    ) -> Vec<ReceivedPacket> {
        self.find(key, record_type, true).await
    }

    async fn find(
        &self,
        key: &IdentityHash,
        record_type: RecordType,
        exhaustive: bool,
    ) -> Vec<ReceivedPacket> {
        let peers = self.eligible_peers(key).await;
        if peers.is_empty() {
            return Vec::new();
        }

        debug!(
            record_type = %(record_type.as_byte() as char),
            key = %key,
            peers = peers.len(),
            "starting find"
        );
        let batch = Arc::new(PacketBatch::new("dht::find"));
        for peer in &peers {
            let request = RetrieveRequest::new(record_type, *key.as_bytes());
            let packet = CommPacket::new(
                PacketType::Retrieve,
                crate::packet::PROTOCOL_V4,
                random_cid(),
                request.encode(),
            );
            batch.add(packet.cid, peer.destination.to_base64(), packet.encode());
        }

        self.run_batch(&batch, exhaustive).await;
        let responses = batch.responses();
        debug!(
            responses = responses.len(),
            record_type = %(record_type.as_byte() as char),
            "find complete"
        );
        responses
    }

    /// Store a record on the peers closest to `key`. Returns the source
    /// destinations of every peer that acknowledged; interpreting their
    /// statuses is the caller's business.
    pub async fn store(
        &self,
        key: &IdentityHash,
        record_type: RecordType,
        request: &StoreRequest,
    ) -> Vec<String> {
        let peers = self.eligible_peers(key).await;
        if peers.is_empty() {
            return Vec::new();
        }

        debug!(
            record_type = %(record_type.as_byte() as char),
            key = %key,
            peers = peers.len(),
            "starting store"
        );
        let batch = Arc::new(PacketBatch::new("dht::store"));
        let payload = request.encode();
        for peer in &peers {
            // each peer gets its own clone of the packet under a fresh CID
            let packet = CommPacket::new(
                PacketType::Store,
                crate::packet::PROTOCOL_V4,
                random_cid(),
                payload.clone(),
            );
            batch.add(packet.cid, peer.destination.to_base64(), packet.encode());
        }

        self.run_batch(&batch, true).await;
        let responses = batch.responses();
        info!(
            acks = responses.len(),
            record_type = %(record_type.as_byte() as char),
            "store complete"
        );
        responses.into_iter().map(|r| r.from).collect()
    }

    /// Ask every peer close to the email's DHT key to drop it.
    pub async fn delete_email(
        &self,
        key: [u8; 32],
        delete_auth: [u8; 32],
    ) -> Vec<ReceivedPacket> {
        let hash = IdentityHash::from_bytes(key);
        let peers = self.eligible_peers(&hash).await;
        if peers.is_empty() {
            return Vec::new();
        }

        let batch = Arc::new(PacketBatch::new("dht::delete_email"));
        let request = EmailDeleteRequest { key, delete_auth };
        for peer in &peers {
            let packet = CommPacket::new(
                PacketType::EmailDelete,
                crate::packet::PROTOCOL_V4,
                random_cid(),
                request.encode(),
            );
            batch.add(packet.cid, peer.destination.to_base64(), packet.encode());
        }

        self.run_batch(&batch, true).await;
        batch.responses()
    }

    /// Remove one index entry from the index stored under `dest_hash`.
    pub async fn delete_index_entry(
        &self,
        dest_hash: IdentityHash,
        key: [u8; 32],
        delete_auth: [u8; 32],
    ) -> Vec<ReceivedPacket> {
        let peers = self.eligible_peers(&dest_hash).await;
        if peers.is_empty() {
            return Vec::new();
        }

        let batch = Arc::new(PacketBatch::new("dht::delete_index_entry"));
        let request = IndexDeleteRequest {
            dest_hash: *dest_hash.as_bytes(),
            entries: vec![IndexDeleteEntry { key, delete_auth }],
        };
        for peer in &peers {
            let packet = CommPacket::new(
                PacketType::IndexDelete,
                crate::packet::PROTOCOL_V4,
                random_cid(),
                request.encode(),
            );
            batch.add(packet.cid, peer.destination.to_base64(), packet.encode());
        }

        self.run_batch(&batch, true).await;
        batch.responses()
    }

    // ------------------------------------------------------------------
    // Server side: handlers for requests from other peers. Every handler
    // adds the requester to the routing table, replies at most once, and
    // echoes the request CID so the peer's correlator can match it.
    // ------------------------------------------------------------------

    fn add_requester(&self, from: &str) {
        if self.routing.add_base64(from) {
            debug!("added requester to node list");
        }
    }

    pub(crate) async fn handle_retrieve(&self, from: &str, packet: &CommPacket) {
        debug!("retrieve request");
        self.add_requester(from);

        let request = match RetrieveRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable retrieve request");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
                return;
            }
        };

        match request.record_type() {
            Some(kind) => {
                let data = match kind {
                    RecordType::Index => self.store.get_index(&request.key),
                    RecordType::Email => self.store.get_email(&request.key),
                    RecordType::Contact => self.store.get_contact(&request.key),
                };
                match data {
                    Some(bytes) => {
                        debug!(
                            key = %hex::encode(&request.key[..8]),
                            len = bytes.len(),
                            "record found"
                        );
                        self.respond(from, packet, StatusCode::Ok, bytes).await;
                    }
                    None => {
                        debug!(key = %hex::encode(&request.key[..8]), "record not found");
                        self.respond(from, packet, StatusCode::NoDataFound, Vec::new())
                            .await;
                    }
                }
            }
            None => {
                debug!(data_type = request.data_type, "unknown data type");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
            }
        }
    }

    pub(crate) async fn handle_deletion_query(&self, from: &str, packet: &CommPacket) {
        debug!("deletion query");
        self.add_requester(from);

        if packet.payload.len() < 32 {
            self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                .await;
            return;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&packet.payload[..32]);

        match self.store.get_email(&key) {
            Some(_) => debug!(key = %hex::encode(&key[..8]), "queried email is held"),
            None => debug!(key = %hex::encode(&key[..8]), "queried email not found"),
        }

        // TODO: answer from a delete log once delete-authorization
        // verification is wired into the store
        self.respond(from, packet, StatusCode::NoDataFound, Vec::new())
            .await;
    }

    pub(crate) async fn handle_store_request(&self, from: &str, packet: &CommPacket) {
        debug!("store request");
        self.add_requester(from);

        let request = match StoreRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable store request");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
                return;
            }
        };
        debug!(
            hashcash_len = request.hashcash.len(),
            data_type = request.data.first().copied().unwrap_or_default(),
            data_len = request.data.len(),
            "store payload parsed"
        );

        // TODO: validate the hashcash token and persist via the local store
        self.respond(from, packet, StatusCode::NoDiskSpace, Vec::new())
            .await;
    }

    pub(crate) async fn handle_email_delete(&self, from: &str, packet: &CommPacket) {
        debug!("email delete request");
        self.add_requester(from);

        let request = match EmailDeleteRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable email delete request");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
                return;
            }
        };
        match self.store.get_email(&request.key) {
            Some(_) => debug!(key = %hex::encode(&request.key[..8]), "email packet is held"),
            None => debug!(key = %hex::encode(&request.key[..8]), "email packet not found"),
        }

        // TODO: verify SHA-256(delete_auth) against the stored envelope's
        // delete hash and remove the packet
        self.respond(from, packet, StatusCode::NoDataFound, Vec::new())
            .await;
    }

    pub(crate) async fn handle_index_delete(&self, from: &str, packet: &CommPacket) {
        debug!("index delete request");
        self.add_requester(from);

        let request = match IndexDeleteRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable index delete request");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
                return;
            }
        };
        match self.store.get_index(&request.dest_hash) {
            Some(_) => debug!(
                hash = %hex::encode(&request.dest_hash[..8]),
                entries = request.entries.len(),
                "index packet is held"
            ),
            None => debug!(
                hash = %hex::encode(&request.dest_hash[..8]),
                "index packet not found"
            ),
        }

        // TODO: verify each entry's delete authorization and rewrite the
        // stored index without the deleted entries
        self.respond(from, packet, StatusCode::NoDataFound, Vec::new())
            .await;
    }

    pub(crate) async fn handle_find_close_peers(&self, from: &str, packet: &CommPacket) {
        debug!("find close peers request");
        self.add_requester(from);

        let request = match FindClosePeersRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable find close peers request");
                self.respond(from, packet, StatusCode::InvalidPacket, Vec::new())
                    .await;
                return;
            }
        };

        let key = IdentityHash::from_bytes(request.key);
        let mut peers = self.routing.k_closest(&key, K, false);
        if peers.is_empty() {
            peers = self.routing.all();
        }
        if peers.is_empty() {
            debug!("no peers to answer with");
            self.respond(from, packet, StatusCode::GeneralError, Vec::new())
                .await;
            return;
        }

        let list = PeerList::new(peers.into_iter().map(|p| p.destination).collect());
        let data = list.encode(packet.version);
        debug!(
            count = list.peers.len(),
            version = packet.version,
            "answering with peer list"
        );
        self.respond(from, packet, StatusCode::Ok, data).await;
    }

    pub(crate) async fn handle_peer_list_request(&self, from: &str, packet: &CommPacket) {
        debug!("peer list request");
        self.add_requester(from);

        let peers = self.routing.unlocked();
        let list = PeerList::new(peers.into_iter().map(|p| p.destination).collect());
        let data = list.encode(packet.version);
        self.respond(from, packet, StatusCode::Ok, data).await;
    }

    async fn respond(&self, to: &str, request: &CommPacket, status: StatusCode, data: Vec<u8>) {
        let response = ResponsePacket::new(status, data);
        let packet = CommPacket::new(
            PacketType::Response,
            request.version,
            request.cid,
            response.encode(),
        );
        self.fabric.send_one(to, &packet.encode()).await;
    }
}
