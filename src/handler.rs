//! # Inbound packet dispatcher
//!
//! One task drains the transport's receive queue. Each datagram is decoded,
//! offered to the live batches first (request/response correlation), and
//! only then dispatched by type and version to the server-side handlers.
//! A malformed packet is dropped with a warning; nothing that arrives from
//! the network can take the loop down.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::batch::ReceivedPacket;
use crate::dht::DhtEngine;
use crate::fabric::InboundDatagram;
use crate::packet::{
    CommPacket, PacketType, ResponsePacket, PROTOCOL_V4, PROTOCOL_V5,
};

pub struct PacketDispatcher {
    engine: DhtEngine,
}

impl PacketDispatcher {
    pub fn new(engine: DhtEngine) -> Self {
        Self { engine }
    }

    /// Drain the inbound queue until shutdown is signalled.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<InboundDatagram>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("packet dispatcher running");
        loop {
            tokio::select! {
                datagram = inbound.recv() => match datagram {
                    Some((from, bytes)) => self.handle_frame(from, bytes).await,
                    None => {
                        debug!("inbound queue closed");
                        break;
                    }
                },
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("packet dispatcher stopped");
    }

    async fn handle_frame(&self, from: String, bytes: Vec<u8>) {
        let packet = match CommPacket::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "cannot parse packet");
                return;
            }
        };

        // live batches get first claim on the CID
        let unclaimed = match self.engine.fabric().dispatch(&from, packet) {
            Some(received) => received,
            None => return,
        };
        self.dispatch_request(unclaimed).await;
    }

    async fn dispatch_request(&self, received: ReceivedPacket) {
        let ReceivedPacket { from, packet } = received;
        match (packet.packet_type, packet.version) {
            (PacketType::Retrieve, PROTOCOL_V4) => {
                self.engine.handle_retrieve(&from, &packet).await;
            }
            (PacketType::DeletionQuery, PROTOCOL_V4) => {
                self.engine.handle_deletion_query(&from, &packet).await;
            }
            (PacketType::Store, PROTOCOL_V4) => {
                self.engine.handle_store_request(&from, &packet).await;
            }
            (PacketType::EmailDelete, PROTOCOL_V4) => {
                self.engine.handle_email_delete(&from, &packet).await;
            }
            (PacketType::IndexDelete, PROTOCOL_V4) => {
                self.engine.handle_index_delete(&from, &packet).await;
            }
            (PacketType::FindClosePeers, PROTOCOL_V4 | PROTOCOL_V5) => {
                self.engine.handle_find_close_peers(&from, &packet).await;
            }
            (PacketType::PeerListRequest, PROTOCOL_V4 | PROTOCOL_V5) => {
                self.engine.handle_peer_list_request(&from, &packet).await;
            }
            (PacketType::Response, _) => {
                // arrives here only when no live batch claimed the CID
                warn!("Unexpected Response received");
                match ResponsePacket::decode(&packet.payload) {
                    Ok(parsed) => warn!(
                        status = %parsed.status,
                        data_len = parsed.data.len(),
                        "orphan response dropped"
                    ),
                    Err(e) => warn!(error = %e, "orphan response unparseable"),
                }
            }
            (PacketType::Relay | PacketType::RelayReturn, _) => {
                debug!(packet_type = ?packet.packet_type, "relay packet ignored");
            }
            (packet_type, version) => {
                warn!(?packet_type, version, "no handler for packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::random_cid;
    use crate::fabric::{InProcessNet, PacketFabric};
    use crate::identity::test_destination;
    use crate::packet::StatusCode;
    use crate::routing::RoutingTable;
    use crate::storage::{MemoryStore, PacketStore};
    use std::sync::Arc;

    fn dispatcher(net: &InProcessNet) -> (PacketDispatcher, DhtEngine) {
        let local = test_destination(0);
        let (transport, _rx) = net.endpoint(&local.to_base64());
        let routing = Arc::new(RoutingTable::new(local.hash()));
        let fabric = Arc::new(PacketFabric::new(transport));
        let store: Arc<dyn PacketStore> = Arc::new(MemoryStore::new());
        let engine = DhtEngine::new(local, routing, fabric, store);
        (PacketDispatcher::new(engine.clone()), engine)
    }

    #[tokio::test]
    async fn orphan_response_changes_no_state() {
        let net = InProcessNet::new();
        let (dispatcher, engine) = dispatcher(&net);
        let stranger = test_destination(9);

        let orphan = CommPacket::new(
            PacketType::Response,
            PROTOCOL_V4,
            random_cid(),
            crate::packet::ResponsePacket::new(StatusCode::Ok, vec![0, 0, 0, 0]).encode(),
        );
        dispatcher
            .handle_frame(stranger.to_base64(), orphan.encode())
            .await;

        // responses are not requests: the sender is not learned, nothing stored
        assert!(engine.routing().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let net = InProcessNet::new();
        let (dispatcher, engine) = dispatcher(&net);

        dispatcher.handle_frame("x".into(), vec![]).await;
        dispatcher.handle_frame("x".into(), vec![0xFF; 64]).await;

        let mut bad_version = CommPacket::new(
            PacketType::Retrieve,
            PROTOCOL_V4,
            random_cid(),
            vec![b'E'; 33],
        )
        .encode();
        bad_version[5] = 7;
        dispatcher.handle_frame("x".into(), bad_version).await;

        assert!(engine.routing().is_empty());
    }

    #[tokio::test]
    async fn request_is_routed_to_server_handler() {
        let net = InProcessNet::new();
        let requester = test_destination(3);
        let (_t, mut requester_rx) = net.endpoint(&requester.to_base64());
        let (dispatcher, engine) = dispatcher(&net);

        let request = CommPacket::new(
            PacketType::Retrieve,
            PROTOCOL_V4,
            random_cid(),
            crate::packet::RetrieveRequest::new(crate::packet::RecordType::Email, [1u8; 32])
                .encode(),
        );
        dispatcher
            .handle_frame(requester.to_base64(), request.encode())
            .await;

        // requester learned, reply sent
        assert!(engine.routing().get(&requester.hash()).is_some());
        let (_, bytes) = requester_rx.recv().await.unwrap();
        let reply = CommPacket::decode(&bytes).unwrap();
        assert_eq!(reply.packet_type, PacketType::Response);
    }
}
