//! dhtspider - a BitTorrent DHT crawler
//!
//! The crawler joins the mainline DHT as an ordinary node, keeps a
//! Kademlia routing table populated, and watches the lookup and announce
//! traffic that flows past it. Announcements its listener finds interesting
//! trigger a best-effort metadata fetch from the announcing peer.
//!
//! # Modules
//!
//! - [`bencode`] - the self-describing wire encoding
//! - [`dht`] - routing table, KRPC protocol, and the crawler engine
//! - [`metadata`] - best-effort content-descriptor fetching

pub mod bencode;
pub mod dht;
pub mod metadata;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{Crawler, CrawlerListener, DhtError, DhtMessage, Id, Node, RoutingTable};
pub use metadata::{Descriptor, FetchError};
