//! Kademlia routing table: a binary trie of k-buckets.
//!
//! The trie branches on successive bits of PeerIds starting at bit 0.
//! Leaves are buckets of up to `k` entries in insertion order, each with a
//! FIFO replacement cache of at most `k` candidate nodes. The branch
//! holding the local id (the home branch) may split past the global depth
//! cap `b`; all other branches stop splitting at `b` and reject further
//! insertions instead.

use std::collections::VecDeque;

use crate::domain::{DiscoveryConfig, Node, NodeInfo, PeerId};


/// Outcome of a routing-table insertion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    /// The node was appended to a bucket with room.
    Added,
    /// The id was already present at the same endpoint; its timeout
    /// counter was reset.
    Refreshed,
    /// The bucket could not take the node. Carries the entry the caller
    /// would have to verify before anything changes: the stored node when
    /// the id is already present at a different endpoint, otherwise the
    /// least-recently-refreshed (front) entry of the full bucket.
    Full(Node),
}

/// Cloned snapshot of one leaf bucket, for maintenance sweeps.
#[derive(Debug, Clone)]
pub struct BucketView {
    pub entries: Vec<NodeInfo>,
    pub cache: Vec<Node>,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<NodeInfo>,
    cache: VecDeque<Node>,
}

impl Bucket {
    /// Append to the replacement cache, bounded to `k` entries with the
    /// oldest dropped. Ids already cached are not duplicated.
    fn push_cache(&mut self, k: usize, node: Node) {
        if self.cache.iter().any(|cached| cached.id == node.id) {
            return;
        }
        if self.cache.len() >= k {
            self.cache.pop_front();
        }
        self.cache.push_back(node);
    }

    /// Partition entries and cache by `bit` at `depth` into (zero, one).
    fn split(self, depth: usize) -> (Bucket, Bucket) {
        let mut zero = Bucket::default();
        let mut one = Bucket::default();
        for entry in self.entries {
            if entry.node.id.bit(depth) {
                one.entries.push(entry);
            } else {
                zero.entries.push(entry);
            }
        }
        for cached in self.cache {
            if cached.id.bit(depth) {
                one.cache.push_back(cached);
            } else {
                zero.cache.push_back(cached);
            }
        }
        (zero, one)
    }
}

#[derive(Debug)]
enum RoutingTree {
    Bucket(Bucket),
    Split {
        zero: Box<RoutingTree>,
        one: Box<RoutingTree>,
    },
}

/// The routing table owned by one discovery instance.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    root: RoutingTree,
}

impl RoutingTable {
    /// Create an empty table for the given owner id.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            root: RoutingTree::Bucket(Bucket::default()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Attempt to insert a node.
    ///
    /// A stored endpoint is never rewritten here: re-announcing a known id
    /// from a new address yields `Insert::Full` with the stored node, so
    /// the caller can verify the old address before trusting the new one.
    pub fn insert(&mut self, cfg: &DiscoveryConfig, node: Node) -> Insert {
        insert_at(&mut self.root, self.local_id, cfg, node, 0, true, false)
    }

    /// Insert a node whose liveness has already been verified, discarding
    /// any `Full` outcome. Unlike [`RoutingTable::insert`], a known id
    /// announced from a new endpoint has its endpoint rewritten.
    pub fn insert_forced(&mut self, cfg: &DiscoveryConfig, node: Node) {
        let _ = insert_at(&mut self.root, self.local_id, cfg, node, 0, true, true);
    }

    /// Up to `n` nodes closest to `target` by XOR distance, nearest first.
    pub fn find_closest(&self, n: usize, target: &PeerId) -> Vec<Node> {
        let mut nodes = Vec::new();
        collect_nodes(&self.root, &mut nodes);
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes.truncate(n);
        nodes
    }

    /// Increment the timeout counter of `id`, returning the new count.
    /// `None` when the id is not in the table.
    pub fn timeout(&mut self, id: &PeerId) -> Option<u32> {
        let entry = self.entry_mut(id)?;
        entry.timeout_count += 1;
        Some(entry.timeout_count)
    }

    /// Reset the timeout counter of `id` to zero, if present.
    pub fn clear_timeout(&mut self, id: &PeerId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.timeout_count = 0;
        }
    }

    /// Swap a dead entry for a node promoted from the same bucket's
    /// replacement cache. The promoted node takes the dead entry's slot
    /// with a fresh counter and leaves the cache. No-op if `dead` is gone.
    pub fn replace(&mut self, dead: &PeerId, promoted: Node) {
        let bucket = bucket_mut(&mut self.root, dead, 0);
        let Some(pos) = bucket.entries.iter().position(|e| e.node.id == *dead) else {
            return;
        };
        bucket.entries.remove(pos);
        bucket.cache.retain(|cached| cached.id != promoted.id);
        bucket.entries.insert(pos, NodeInfo::new(promoted));
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    /// Look up the entry for `id`.
    pub fn get(&self, id: &PeerId) -> Option<&NodeInfo> {
        let mut tree = &self.root;
        let mut depth = 0;
        loop {
            match tree {
                RoutingTree::Bucket(bucket) => {
                    return bucket.entries.iter().find(|e| e.node.id == *id);
                }
                RoutingTree::Split { zero, one } => {
                    tree = if id.bit(depth) { one } else { zero };
                    depth += 1;
                }
            }
        }
    }

    /// Total number of entries across all buckets.
    pub fn len(&self) -> usize {
        let mut nodes = Vec::new();
        collect_nodes(&self.root, &mut nodes);
        nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cloned per-bucket snapshots, for the maintenance sweep.
    pub fn buckets(&self) -> Vec<BucketView> {
        let mut views = Vec::new();
        collect_buckets(&self.root, &mut views);
        views
    }

    fn entry_mut(&mut self, id: &PeerId) -> Option<&mut NodeInfo> {
        let bucket = bucket_mut(&mut self.root, id, 0);
        bucket.entries.iter_mut().find(|e| e.node.id == *id)
    }
}

/// Recursive insertion. `home` tracks whether the path so far matches the
/// local id bit-for-bit, i.e. whether this leaf lies on the home branch.
fn insert_at(
    tree: &mut RoutingTree,
    local_id: PeerId,
    cfg: &DiscoveryConfig,
    node: Node,
    depth: usize,
    home: bool,
    forced: bool,
) -> Insert {
    match tree {
        RoutingTree::Split { zero, one } => {
            let bit = node.id.bit(depth);
            let child = if bit { one } else { zero };
            let home = home && bit == local_id.bit(depth);
            insert_at(child, local_id, cfg, node, depth + 1, home, forced)
        }
        RoutingTree::Bucket(bucket) => {
            if let Some(entry) = bucket
                .entries
                .iter_mut()
                .find(|e| e.node.id == node.id)
            {
                if entry.node.peer == node.peer || forced {
                    entry.node = node;
                    entry.timeout_count = 0;
                    return Insert::Refreshed;
                }
                return Insert::Full(entry.node);
            }

            if bucket.entries.len() < cfg.k {
                bucket.entries.push(NodeInfo::new(node));
                return Insert::Added;
            }

            if !home && depth >= cfg.b {
                let front = bucket.entries[0].node;
                bucket.push_cache(cfg.k, node);
                return Insert::Full(front);
            }

            // Split this leaf on the next bit and retry at the same depth.
            let bucket = std::mem::take(bucket);
            let (zero, one) = bucket.split(depth);
            *tree = RoutingTree::Split {
                zero: Box::new(RoutingTree::Bucket(zero)),
                one: Box::new(RoutingTree::Bucket(one)),
            };
            insert_at(tree, local_id, cfg, node, depth, home, forced)
        }
    }
}

fn bucket_mut<'a>(tree: &'a mut RoutingTree, id: &PeerId, depth: usize) -> &'a mut Bucket {
    match tree {
        RoutingTree::Bucket(bucket) => bucket,
        RoutingTree::Split { zero, one } => {
            if id.bit(depth) {
                bucket_mut(one, id, depth + 1)
            } else {
                bucket_mut(zero, id, depth + 1)
            }
        }
    }
}

fn collect_nodes(tree: &RoutingTree, out: &mut Vec<Node>) {
    match tree {
        RoutingTree::Bucket(bucket) => {
            out.extend(bucket.entries.iter().map(|e| e.node));
        }
        RoutingTree::Split { zero, one } => {
            collect_nodes(zero, out);
            collect_nodes(one, out);
        }
    }
}

fn collect_buckets(tree: &RoutingTree, out: &mut Vec<BucketView>) {
    match tree {
        RoutingTree::Bucket(bucket) => {
            out.push(BucketView {
                entries: bucket.entries.clone(),
                cache: bucket.cache.iter().copied().collect(),
            });
        }
        RoutingTree::Split { zero, one } => {
            collect_buckets(zero, out);
            collect_buckets(one, out);
        }
    }
}
