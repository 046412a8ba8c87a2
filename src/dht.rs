//! Distributed Hash Table crawling (BEP-5).
//!
//! This module implements the Kademlia-based DHT used by BitTorrent for
//! trackerless peer discovery, shaped for crawling: the routing table, the
//! KRPC wire protocol, the typed message vocabulary, and the engine that
//! keeps the table populated while watching the traffic for announcements.

mod crawler;
mod error;
mod id;
mod krpc;
mod message;
mod node;
mod routing;

pub use crawler::{Crawler, CrawlerListener, BOOTSTRAP_NODES};
pub use error::DhtError;
pub use id::Id;
pub use krpc::{KrpcMessage, TransactionId};
pub use message::{CompactNode, DhtMessage, FaultKind, QueryMethod, QueryTracker};
pub use node::Node;
pub use routing::{Bucket, RoutingTable, Touch, K};

#[cfg(test)]
mod tests;
