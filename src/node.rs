//! # Node supervisor
//!
//! Owns startup and shutdown: loads the peer file (falling back to the
//! configured bootstrap destinations), wires the fabric to the transport,
//! spawns the inbound dispatcher, the DHT maintenance loop and the mailbox
//! worker, and rewrites the peer file every minute. Shutdown is
//! cooperative: one stop signal, every loop finishes its current
//! iteration, the supervisor joins the handles and flushes the peer file a
//! last time.

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dht::DhtEngine;
use crate::fabric::{InboundDatagram, PacketFabric, Transport};
use crate::handler::PacketDispatcher;
use crate::identity::Destination;
use crate::mailbox::{AddressBook, MailDirs, MailIdentity, MailboxWorker};
use crate::routing::RoutingTable;
use crate::storage::PacketStore;

/// Period of the peer-file persistence loop.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Dump the node list at debug level every this many persistence rounds.
const DEBUG_DUMP_ROUNDS: u32 = 10;

/// Initialize tracing from the configured log level. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging(loglevel: &str) {
    let directive = match loglevel {
        "none" => "off",
        "debug" | "info" | "warn" | "error" => loglevel,
        other => {
            eprintln!("unknown loglevel {other:?}, using info");
            "info"
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct Node {
    config: Config,
    engine: DhtEngine,
    routing: Arc<RoutingTable>,
    mailbox: Arc<MailboxWorker>,
    stop: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bring the node up. Fails only when the data directory cannot be
    /// created; an empty routing table is survivable (the node waits for
    /// inbound contacts).
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: Config,
        local: Destination,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundDatagram>,
        store: Arc<dyn PacketStore>,
        identities: Vec<Arc<MailIdentity>>,
        address_book: AddressBook,
    ) -> Result<Arc<Self>> {
        init_logging(&config.loglevel);
        config
            .ensure_dirs()
            .context("cannot initialize data directory")?;

        let routing = Arc::new(RoutingTable::new(local.hash()));
        let fabric = Arc::new(PacketFabric::new(transport));
        let engine = DhtEngine::new(local.clone(), routing.clone(), fabric, store);

        load_peers(&config, &routing);
        if routing.is_empty() {
            error!("have no nodes for start");
        }
        if config.loglevel == "debug" && !routing.is_empty() {
            debug!("node stats:");
            for peer in routing.all() {
                debug!(hash = %peer.hash, "node");
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mailbox = Arc::new(MailboxWorker::new(
            engine.clone(),
            identities,
            address_book,
            MailDirs {
                inbox: config.inbox_dir(),
                outbox: config.outbox_dir(),
                sent: config.sent_dir(),
            },
        ));

        let mut tasks = Vec::new();

        let dispatcher = PacketDispatcher::new(engine.clone());
        tasks.push(tokio::spawn(dispatcher.run(inbound, stop_rx.clone())));

        tasks.push(tokio::spawn(maintenance_loop(
            routing.clone(),
            config.nodes_file(),
            config.loglevel == "debug",
            stop_rx.clone(),
        )));

        tasks.push(tokio::spawn(mailbox.clone().drive(stop_rx)));

        info!(
            peers = routing.len(),
            datadir = %config.datadir.display(),
            "node started"
        );
        Ok(Arc::new(Self {
            config,
            engine,
            routing,
            mailbox,
            stop: stop_tx,
            tasks: tokio::sync::Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &DhtEngine {
        &self.engine
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn mailbox(&self) -> &Arc<MailboxWorker> {
        &self.mailbox
    }

    pub fn local_destination(&self) -> &Destination {
        self.engine.local_destination()
    }

    /// Cooperative shutdown: signal, join every task, flush the peer file.
    pub async fn shutdown(&self) {
        warn!("node stopping");
        let _ = self.stop.send(true);

        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }

        write_peer_file(&self.routing, &self.config.nodes_file());
        warn!("node stopped");
    }
}

fn load_peers(config: &Config, routing: &RoutingTable) {
    let nodes_file = config.nodes_file();
    match std::fs::File::open(&nodes_file) {
        Ok(file) => {
            info!(path = %nodes_file.display(), "reading peer file");
            routing.load_snapshot(BufReader::new(file));
        }
        Err(e) => info!(path = %nodes_file.display(), error = %e, "no peer file"),
    }

    // only when the peer file gave us nothing
    if routing.is_empty() {
        for address in &config.bootstrap {
            if routing.add_base64(address) {
                debug!("bootstrap peer added");
            }
        }
        if !config.bootstrap.is_empty() {
            info!(peers = routing.len(), "bootstrapped from config");
        }
    }
}

fn write_peer_file(routing: &RoutingTable, path: &PathBuf) {
    let mut buf = Vec::new();
    if let Err(e) = routing.persist_snapshot(&mut buf) {
        error!(error = %e, "cannot serialize peer file");
        return;
    }
    if let Err(e) = std::fs::write(path, buf) {
        error!(path = %path.display(), error = %e, "cannot write peer file");
        return;
    }
    debug!(path = %path.display(), peers = routing.len(), "peer file saved");
}

async fn maintenance_loop(
    routing: Arc<RoutingTable>,
    nodes_file: PathBuf,
    debug_dump: bool,
    mut stop: watch::Receiver<bool>,
) {
    let mut rounds = 0u32;
    loop {
        rounds += 1;
        write_peer_file(&routing, &nodes_file);

        if debug_dump && rounds > DEBUG_DUMP_ROUNDS && !routing.is_empty() {
            debug!("node stats:");
            for peer in routing.all() {
                debug!(hash = %peer.hash, failures = peer.failures(), "node");
            }
            rounds = 0;
        }

        tokio::select! {
            _ = tokio::time::sleep(PERSIST_INTERVAL) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}
