pub mod batch;
pub mod config;
pub mod dht;
pub mod fabric;
pub mod handler;
pub mod identity;
pub mod mailbox;
pub mod node;
pub mod packet;
pub mod routing;
pub mod storage;

pub use config::Config;
pub use dht::DhtEngine;
pub use fabric::{PacketFabric, Transport};
pub use identity::{Destination, IdentityHash};
pub use node::Node;
pub use storage::PacketStore;
