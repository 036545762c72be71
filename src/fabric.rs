//! # Send/receive fabric
//!
//! The fabric is the thin layer between the batches and the overlay
//! transport. It owns the list of live batches and fans every outbound
//! packet into the transport's single send primitive; the inbound side is
//! one queue of `(source destination, bytes)` datagrams drained by the
//! dispatcher.
//!
//! An inbound packet is offered to the live batches first (matched by CID
//! and source); only unclaimed packets continue to the server dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::batch::{PacketBatch, ReceivedPacket};
use crate::packet::CommPacket;

/// Datagram as yielded by the transport's inbound queue.
pub type InboundDatagram = (String, Vec<u8>);

/// The overlay transport seam (a SAM-like bridge in production).
///
/// `send` is a non-blocking enqueue toward the bridge; delivery is best
/// effort and a datagram either fits a whole protocol packet or is lost.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &str, payload: &[u8]) -> Result<()>;
}

pub struct PacketFabric {
    transport: Arc<dyn Transport>,
    batches: Mutex<Vec<Arc<PacketBatch>>>,
}

impl PacketFabric {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PacketBatch>>> {
        self.batches.lock().expect("batch registry lock poisoned")
    }

    /// Register a batch with the inbound dispatch. Callers register before
    /// the first send so responses cannot race past the batch.
    pub fn register(&self, batch: Arc<PacketBatch>) {
        self.batches().push(batch);
    }

    pub fn unregister(&self, batch: &Arc<PacketBatch>) {
        self.batches().retain(|b| !Arc::ptr_eq(b, batch));
    }

    pub fn live_batches(&self) -> usize {
        self.batches().len()
    }

    /// Transmit every still-unanswered request of the batch once.
    pub async fn send_batch(&self, batch: &PacketBatch) {
        let pending = batch.unanswered();
        trace!(owner = batch.owner(), count = pending.len(), "sending batch");
        for (_cid, request) in pending {
            if let Err(e) = self
                .transport
                .send(&request.destination, &request.payload)
                .await
            {
                warn!(owner = batch.owner(), error = %e, "transport send failed");
            }
        }
    }

    /// Send a single packet outside any batch (server replies).
    pub async fn send_one(&self, destination: &str, payload: &[u8]) {
        if let Err(e) = self.transport.send(destination, payload).await {
            warn!(error = %e, "transport send failed");
        }
    }

    /// Offer an inbound packet to the live batches. Returns the packet when
    /// no batch claimed it, i.e. it is a server request (or an orphan).
    pub fn dispatch(&self, from: &str, packet: CommPacket) -> Option<ReceivedPacket> {
        let candidates: Vec<Arc<PacketBatch>> = self.batches().clone();
        for batch in candidates {
            if batch.deliver(from, packet.clone()) {
                trace!(
                    owner = batch.owner(),
                    packet_type = ?packet.packet_type,
                    "packet passed to batch"
                );
                return None;
            }
        }
        Some(ReceivedPacket {
            from: from.to_string(),
            packet,
        })
    }
}

/// In-process overlay: routes datagrams between registered destinations.
///
/// Stands in for the SAM bridge in tests and local simulation; each
/// endpoint gets a [`Transport`] handle stamped with its own source address
/// and an inbound receiver.
#[derive(Default, Clone)]
pub struct InProcessNet {
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InboundDatagram>>>>,
}

impl InProcessNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint; returns its transport handle and inbound queue.
    pub fn endpoint(&self, local: &str) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<InboundDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .expect("route table lock poisoned")
            .insert(local.to_string(), tx);
        let transport = Arc::new(InProcessTransport {
            local: local.to_string(),
            routes: self.routes.clone(),
        });
        (transport, rx)
    }
}

struct InProcessTransport {
    local: String,
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InboundDatagram>>>>,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, destination: &str, payload: &[u8]) -> Result<()> {
        let target = {
            let routes = self.routes.lock().expect("route table lock poisoned");
            routes.get(destination).cloned()
        };
        match target {
            Some(tx) => {
                // a closed endpoint behaves like an unreachable peer
                let _ = tx.send((self.local.clone(), payload.to_vec()));
                Ok(())
            }
            None => Ok(()),
        }
    }
}
