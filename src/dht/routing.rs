use std::time::Instant;

use parking_lot::RwLock;
use primitive_types::U256;

use super::id::Id;
use super::node::Node;

/// Bucket capacity, Kademlia's K.
pub const K: usize = 8;

/// How an insert refreshes a node that is already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// Leave the existing entry untouched.
    None,
    /// The peer sent us a query: refresh its address and query timestamp.
    Query,
    /// The peer sent us a reply: refresh its address and reply timestamp
    /// and mark it as having replied.
    Reply,
}

/// Signal that a bucket already holds `K` other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketFull;

/// A contiguous slice of the id space holding up to `K` nodes.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub min: U256,
    pub max: U256,
    pub nodes: Vec<Node>,
    /// Last add, merge, or remove. Buckets untouched for too long get
    /// refreshed by the maintenance pass.
    pub last_changed: Instant,
}

impl Bucket {
    pub(crate) fn new(min: U256, max: U256) -> Self {
        Self {
            min,
            max,
            nodes: Vec::new(),
            last_changed: Instant::now(),
        }
    }

    /// Whether `id` falls inside this bucket, bounds inclusive.
    pub fn covers(&self, id: &Id) -> bool {
        let value = id.to_u256();
        self.min <= value && value <= self.max
    }

    /// Adds `node`, or refreshes the entry already holding its id according
    /// to `touch`. Fails only when the bucket is full of other nodes.
    pub(crate) fn add(&mut self, node: Node, touch: Touch) -> Result<(), BucketFull> {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            match touch {
                Touch::None => {}
                Touch::Query => {
                    existing.addr = node.addr;
                    existing.last_query_at = node.last_query_at;
                }
                Touch::Reply => {
                    existing.addr = node.addr;
                    existing.last_reply_at = node.last_reply_at;
                    existing.replied = true;
                }
            }
            self.last_changed = Instant::now();
            return Ok(());
        }
        if self.nodes.len() >= K {
            return Err(BucketFull);
        }
        self.nodes.push(node);
        self.last_changed = Instant::now();
        Ok(())
    }

    /// Removes the node with `id` if present. The change timestamp is
    /// bumped whether or not anything was removed.
    pub(crate) fn remove(&mut self, id: &Id) {
        self.nodes.retain(|n| n.id != *id);
        self.last_changed = Instant::now();
    }
}

/// The Kademlia routing table: an ordered sequence of buckets tiling
/// `[0, 2^160)`, initially one bucket spanning the whole space.
///
/// Only the branch of the id space covering our own id grows past one
/// bucket: a full bucket splits when it covers `own_id`, and silently
/// drops the insert otherwise.
pub struct RoutingTable {
    own_id: Id,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(own_id: Id) -> Self {
        let whole = Bucket::new(U256::zero(), U256::one() << 160);
        Self {
            own_id,
            buckets: RwLock::new(vec![whole]),
        }
    }

    pub fn own_id(&self) -> &Id {
        &self.own_id
    }

    /// Inserts without refreshing an already-known node.
    pub fn insert(&self, node: Node) {
        self.insert_with(node, Touch::None);
    }

    /// Inserts `node`, refreshing any existing entry per `touch`.
    /// Inserting our own id is a no-op, and an insert into a full bucket
    /// that does not cover our own id is silently dropped.
    pub fn insert_with(&self, node: Node, touch: Touch) {
        if node.id == self.own_id {
            return;
        }
        let mut buckets = self.buckets.write();
        loop {
            let index = bucket_index(&buckets, &node.id);
            match buckets[index].add(node.clone(), touch) {
                Ok(()) => return,
                Err(BucketFull) => {
                    if !buckets[index].covers(&self.own_id) || !split(&mut buckets, index) {
                        return;
                    }
                }
            }
        }
    }

    /// Up to `K` nodes sorted by ascending XOR distance to `target`.
    ///
    /// Candidates come from the bucket covering `target`, widened one
    /// bucket outward on each side per round until `K` have been gathered
    /// or the table runs out.
    pub fn nearest(&self, target: &Id) -> Vec<Node> {
        let buckets = self.buckets.read();
        let center = bucket_index(&buckets, target);
        let mut found: Vec<Node> = buckets[center].nodes.clone();
        let mut below = center.checked_sub(1);
        let mut above = center + 1;
        while found.len() < K && (below.is_some() || above < buckets.len()) {
            if let Some(index) = below {
                found.extend(buckets[index].nodes.iter().cloned());
                below = index.checked_sub(1);
            }
            if above < buckets.len() {
                found.extend(buckets[above].nodes.iter().cloned());
                above += 1;
            }
        }
        drop(buckets);
        found.sort_by_key(|n| n.id.distance(target));
        found.truncate(K);
        found
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().iter().all(|b| b.nodes.is_empty())
    }

    pub fn node_count(&self) -> usize {
        self.buckets.read().iter().map(|b| b.nodes.len()).sum()
    }

    /// Point-in-time copy of every bucket, for scans that must not hold
    /// the table lock while they work.
    pub fn snapshot(&self) -> Vec<Bucket> {
        self.buckets.read().clone()
    }

    /// Removes `id` from the bucket covering it.
    pub fn remove(&self, id: &Id) {
        let mut buckets = self.buckets.write();
        let index = bucket_index(&buckets, id);
        buckets[index].remove(id);
    }

    /// Runs `f` on the live entry for `id`, if the table holds one.
    pub fn with_node_mut<T>(&self, id: &Id, f: impl FnOnce(&mut Node) -> T) -> Option<T> {
        let mut buckets = self.buckets.write();
        let index = bucket_index(&buckets, id);
        buckets[index].nodes.iter_mut().find(|n| n.id == *id).map(f)
    }
}

/// Index of the first bucket covering `id`. The buckets tile the space, so
/// the fallback is never reached in practice.
fn bucket_index(buckets: &[Bucket], id: &Id) -> usize {
    buckets
        .iter()
        .position(|b| b.covers(id))
        .unwrap_or(buckets.len() - 1)
}

/// Splits `buckets[index]` at its midpoint, moving nodes in the upper half
/// of the range into a new bucket inserted just after it. Returns false
/// when the range is too narrow to split further.
fn split(buckets: &mut Vec<Bucket>, index: usize) -> bool {
    let (min, max) = (buckets[index].min, buckets[index].max);
    if max - min <= U256::one() {
        return false;
    }
    let mid = max - (max - min) / 2;
    let mut upper = Bucket::new(mid, max);
    let lower = &mut buckets[index];
    lower.max = mid;
    let (keep, moved): (Vec<Node>, Vec<Node>) = lower
        .nodes
        .drain(..)
        .partition(|n| n.id.to_u256() < mid);
    lower.nodes = keep;
    upper.nodes = moved;
    buckets.insert(index + 1, upper);
    true
}
