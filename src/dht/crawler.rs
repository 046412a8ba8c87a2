use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metadata::{Descriptor, Fetcher};

use super::error::DhtError;
use super::id::Id;
use super::krpc::KrpcMessage;
use super::message::{CompactNode, DhtMessage, QueryMethod, QueryTracker};
use super::node::{fresh_token, Node};
use super::routing::{RoutingTable, Touch};

/// Well-known entry points used to seed an empty routing table.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// A bucket or node untouched for this long is considered stale.
const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Cadence of the routing-table maintenance pass.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the pending-query sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

const RECV_BUFFER_LEN: usize = 65536;

/// Hooks the crawler calls as it observes the swarm.
pub trait CrawlerListener: Send + Sync + 'static {
    /// A peer asked the network who has `info_hash`.
    fn on_peer_lookup(&self, info_hash: &Id);

    /// A peer announced itself as a source for `info_hash`. Return true to
    /// have its metadata fetched.
    fn on_announce(&self, info_hash: &Id) -> bool;

    /// A metadata fetch for `info_hash` completed.
    fn on_metadata(&self, info_hash: &Id, descriptor: &Descriptor);
}

/// The crawler engine.
///
/// Owns the UDP socket, the local node id, the routing table, and the
/// pending-query tracker, and runs three tasks over them: the receive
/// loop, the once-a-second maintenance pass, and the pending-query sweep.
pub struct Crawler {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    socket: UdpSocket,
    own_id: Id,
    table: RoutingTable,
    tracker: QueryTracker,
    listener: Arc<dyn CrawlerListener>,
    fetcher: Fetcher,
}

impl Crawler {
    /// Generates a node id, binds `host:port`, and starts the receive loop
    /// and both timers.
    pub async fn start(
        host: &str,
        port: u16,
        listener: Arc<dyn CrawlerListener>,
    ) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind((host, port)).await?;
        let own_id = Id::generate();
        info!("crawler bound to {} as {}", socket.local_addr()?, own_id);

        let inner = Arc::new(Inner {
            socket,
            own_id,
            table: RoutingTable::new(own_id),
            tracker: QueryTracker::new(),
            listener: Arc::clone(&listener),
            fetcher: Fetcher::new(listener),
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).receive_loop()),
            tokio::spawn(Arc::clone(&inner).maintenance_loop()),
            tokio::spawn(Arc::clone(&inner).sweep_loop()),
        ];

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn own_id(&self) -> &Id {
        &self.inner.own_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn table(&self) -> &RoutingTable {
        &self.inner.table
    }

    /// Stops the timers and the receive loop and waits for them to finish.
    /// The socket closes once the last task has let go of it.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("crawler stopped");
    }
}

impl Inner {
    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("receive loop exiting: {}", e);
                    return;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..len], from).await {
                debug!("dropping datagram from {}: {}", from, e);
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Result<(), DhtError> {
        let envelope = KrpcMessage::from_bytes(data)?;
        let msg = DhtMessage::from_krpc(envelope, &self.tracker)?;
        self.dispatch(msg, from).await
    }

    async fn dispatch(&self, msg: DhtMessage, from: SocketAddr) -> Result<(), DhtError> {
        self.observe_sender(&msg, from);
        match msg {
            DhtMessage::PingQuery { tid, .. } => {
                self.send(
                    DhtMessage::PingReply {
                        tid,
                        id: self.own_id,
                    },
                    from,
                )
                .await
            }
            DhtMessage::FindNodeQuery { tid, target, .. } => {
                let nodes = self.nearest_records(&target);
                self.send(
                    DhtMessage::FindNodeReply {
                        tid,
                        id: self.own_id,
                        nodes,
                    },
                    from,
                )
                .await
            }
            DhtMessage::GetPeersQuery { tid, id, info_hash } => {
                // reuse the sender's fresh token when it made it into the
                // table; a one-shot token otherwise
                let token = self
                    .table
                    .with_node_mut(&id, |node| node.grant_token())
                    .unwrap_or_else(fresh_token);
                let nodes = self.nearest_records(&info_hash);
                self.send(
                    DhtMessage::GetPeersReply {
                        tid,
                        id: self.own_id,
                        token,
                        peers: None,
                        nodes: Some(nodes),
                    },
                    from,
                )
                .await?;
                self.listener.on_peer_lookup(&info_hash);
                Ok(())
            }
            DhtMessage::AnnouncePeerQuery {
                tid,
                id,
                info_hash,
                port,
                ..
            } => {
                self.send(
                    DhtMessage::AnnouncePeerReply {
                        tid,
                        id: self.own_id,
                    },
                    from,
                )
                .await?;
                if self.listener.on_announce(&info_hash) {
                    self.fetcher
                        .spawn(info_hash, SocketAddr::new(from.ip(), port), id);
                }
                Ok(())
            }
            DhtMessage::FindNodeReply { nodes, .. } => {
                for found in nodes {
                    self.table.insert(Node::new(found.id, found.addr.into()));
                    self.send_find_node(found.addr.into(), self.own_id).await?;
                }
                Ok(())
            }
            DhtMessage::PingReply { .. }
            | DhtMessage::GetPeersReply { .. }
            | DhtMessage::AnnouncePeerReply { .. } => Ok(()),
            DhtMessage::Fault { kind, message, .. } => {
                debug!("remote fault {:?} from {}: {}", kind, from, message);
                Ok(())
            }
        }
    }

    /// Folds the sender of any query or reply into the routing table.
    fn observe_sender(&self, msg: &DhtMessage, from: SocketAddr) {
        let (id, touch) = match msg {
            DhtMessage::PingQuery { id, .. }
            | DhtMessage::FindNodeQuery { id, .. }
            | DhtMessage::GetPeersQuery { id, .. }
            | DhtMessage::AnnouncePeerQuery { id, .. } => (id, Touch::Query),
            DhtMessage::PingReply { id, .. }
            | DhtMessage::FindNodeReply { id, .. }
            | DhtMessage::GetPeersReply { id, .. }
            | DhtMessage::AnnouncePeerReply { id, .. } => (id, Touch::Reply),
            DhtMessage::Fault { .. } => return,
        };
        self.table.insert_with(Node::new(*id, from), touch);
    }

    fn nearest_records(&self, target: &Id) -> Vec<CompactNode> {
        self.table
            .nearest(target)
            .into_iter()
            .filter_map(|node| match node.addr {
                SocketAddr::V4(v4) => Some(CompactNode {
                    id: node.id,
                    addr: v4,
                }),
                SocketAddr::V6(_) => None,
            })
            .collect()
    }

    async fn send(&self, msg: DhtMessage, to: SocketAddr) -> Result<(), DhtError> {
        let data = msg.to_krpc().to_bytes();
        self.socket.send_to(&data, to).await?;
        Ok(())
    }

    async fn send_find_node(&self, to: SocketAddr, target: Id) -> Result<(), DhtError> {
        let tid = KrpcMessage::new_tid();
        self.tracker.record(tid.clone(), QueryMethod::FindNode);
        self.send(
            DhtMessage::FindNodeQuery {
                tid,
                id: self.own_id,
                target,
            },
            to,
        )
        .await
    }

    async fn send_ping(&self, to: SocketAddr) -> Result<(), DhtError> {
        let tid = KrpcMessage::new_tid();
        self.tracker.record(tid.clone(), QueryMethod::Ping);
        self.send(
            DhtMessage::PingQuery {
                tid,
                id: self.own_id,
            },
            to,
        )
        .await
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = self.maintain().await {
                warn!("maintenance pass failed: {}", e);
            }
        }
    }

    /// One maintenance pass: refresh stale buckets, evict silent nodes,
    /// then look our own id up to keep the table growing.
    async fn maintain(&self) -> Result<(), DhtError> {
        let now = Instant::now();
        for bucket in self.table.snapshot() {
            if now.duration_since(bucket.last_changed) > STALE_AFTER {
                let target = Id::random_in(bucket.min, bucket.max);
                self.find_nodes(target).await?;
            }
            for node in &bucket.nodes {
                let fresh = now.duration_since(node.last_reply_at) < STALE_AFTER
                    || (node.replied && now.duration_since(node.last_query_at) < STALE_AFTER);
                if !fresh {
                    // probe it, but evict without waiting for the answer;
                    // a node that is merely slow gets re-discovered later
                    self.send_ping(node.addr).await?;
                    self.table.remove(&node.id);
                }
            }
        }
        self.find_nodes(self.own_id).await
    }

    /// Sends `find_node` for `target` to the nearest known nodes, or to
    /// the bootstrap entry points while the table is still empty.
    async fn find_nodes(&self, target: Id) -> Result<(), DhtError> {
        let nearest = self.table.nearest(&target);
        if nearest.is_empty() {
            for entry in BOOTSTRAP_NODES {
                match tokio::net::lookup_host(entry).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            self.send_find_node(addr, target).await?;
                        }
                    }
                    Err(e) => warn!("cannot resolve bootstrap node {}: {}", entry, e),
                }
            }
        } else {
            for node in nearest {
                self.send_find_node(node.addr, target).await?;
            }
        }
        Ok(())
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            self.tracker.sweep();
            debug!(
                "pending-query sweep done, {} still in flight",
                self.tracker.len()
            );
        }
    }
}
