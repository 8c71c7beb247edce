//! Iterative peer lookup over parallel disjoint paths.
//!
//! A lookup runs `alpha` independent path walkers over a partition of the
//! seed set. The walkers share one `queried` map and claim nodes from it
//! atomically, so no two paths ever probe the same node and no node is
//! probed twice. Each path ends with its k best candidates; only nodes
//! confirmed by a strict majority of paths make it into the result, which
//! caps what a single adversarial subtree can inject.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Distance, Node, PeerId};
use crate::ports::Reply;
use crate::service::DiscoveryService;
use crate::wire::ResponsePayload;

enum PathEvent {
    /// A queried node answered with its closest nodes.
    Answered { node: Node, returned: Vec<Node> },
    /// A queried node timed out.
    Failed(Node),
}

impl DiscoveryService {
    /// Locate up to k live nodes close to `target`.
    ///
    /// Every node that answers along the way is inserted into the routing
    /// table, so a lookup doubles as table population during bootstrap.
    pub async fn lookup(&self, target: PeerId) -> Vec<Node> {
        let paths = self.config.alpha.max(1);
        let seeds = {
            self.table
                .lock()
                .unwrap()
                .find_closest(self.config.k, &target)
        };
        debug!(?target, seeds = seeds.len(), paths, "starting lookup");

        // Round-robin partition: nearest seeds spread across paths.
        let mut partitions: Vec<Vec<Node>> = vec![Vec::new(); paths];
        for (i, seed) in seeds.into_iter().enumerate() {
            partitions[i % paths].push(seed);
        }

        let queried: Mutex<BTreeMap<Distance, Node>> = Mutex::new(BTreeMap::new());
        let walkers = partitions
            .into_iter()
            .map(|seeds| PathWalker::new(self, target, &queried, seeds).run());
        let outcomes = join_all(walkers).await;

        // Strict-majority filter across path outcomes.
        let mut tally: HashMap<PeerId, (Node, usize)> = HashMap::new();
        for outcome in &outcomes {
            for node in outcome {
                tally.entry(node.id).or_insert((*node, 0)).1 += 1;
            }
        }
        let mut result: Vec<Node> = tally
            .into_values()
            .filter(|(_, votes)| *votes > paths / 2)
            .map(|(node, _)| node)
            .collect();
        result.sort_by_key(|node| node.id.distance(&target));
        result.truncate(self.config.k);
        debug!(?target, found = result.len(), "lookup finished");
        result
    }
}

/// One of the `alpha` disjoint lookup paths.
struct PathWalker<'a> {
    service: &'a DiscoveryService,
    target: PeerId,
    /// Shared across all paths; a node claimed here is never queried by
    /// any path again.
    queried: &'a Mutex<BTreeMap<Distance, Node>>,
    /// This path's view of the nodes nearest the target, keyed by
    /// distance. Trimmed to `(alpha + 1) * k` so the closing round can
    /// still replace late failures.
    candidates: BTreeMap<Distance, Node>,
    failed: HashSet<PeerId>,
    pending: usize,
    tx: mpsc::UnboundedSender<PathEvent>,
    rx: mpsc::UnboundedReceiver<PathEvent>,
}

impl<'a> PathWalker<'a> {
    fn new(
        service: &'a DiscoveryService,
        target: PeerId,
        queried: &'a Mutex<BTreeMap<Distance, Node>>,
        seeds: Vec<Node>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut candidates = BTreeMap::new();
        for seed in seeds {
            candidates.insert(seed.id.distance(&target), seed);
        }
        // Never query or return ourselves.
        let failed = HashSet::from([service.local_id]);
        Self {
            service,
            target,
            queried,
            candidates,
            failed,
            pending: 0,
            tx,
            rx,
        }
    }

    async fn run(mut self) -> Vec<Node> {
        loop {
            let chosen = self.claim_unqueried(self.service.config.alpha);
            if chosen.is_empty() {
                return self.best();
            }
            self.send_probes(chosen);
            self.process_responses().await;

            // Closing round: flush every still-unqueried candidate among
            // the current k closest before deciding we are done.
            let closing = self.claim_unqueried(usize::MAX);
            self.send_probes(closing);
            self.process_responses().await;
        }
    }

    /// Atomically claim up to `limit` unqueried nodes from this path's k
    /// closest candidates, marking them in the shared map.
    fn claim_unqueried(&mut self, limit: usize) -> Vec<Node> {
        let mut queried = self.queried.lock().unwrap();
        let mut chosen = Vec::new();
        for (distance, node) in self.candidates.iter().take(self.service.config.k) {
            if chosen.len() >= limit {
                break;
            }
            if !queried.contains_key(distance) {
                queried.insert(*distance, *node);
                chosen.push(*node);
            }
        }
        chosen
    }

    fn send_probes(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            self.pending += 1;
            let request = self.service.find_node_request(self.target);
            let messenger = std::sync::Arc::clone(&self.service.messenger);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let event = match messenger.request(node.peer, request).await {
                    Ok(Reply {
                        sender,
                        payload: ResponsePayload::ReturnNodes(nodes),
                    }) if sender == node.id => PathEvent::Answered {
                        node,
                        returned: nodes.into_iter().map(Node::from).collect(),
                    },
                    _ => PathEvent::Failed(node),
                };
                let _ = tx.send(event);
            });
        }
    }

    /// Drain replies until nothing is in flight. A reply that improves
    /// the nearest known distance immediately triggers another
    /// alpha-sized round.
    async fn process_responses(&mut self) {
        while self.pending > 0 {
            let Some(event) = self.rx.recv().await else {
                return;
            };
            self.pending -= 1;
            match event {
                PathEvent::Answered { node, returned } => {
                    {
                        let mut table = self.service.table.lock().unwrap();
                        table.insert_forced(&self.service.config, node);
                    }
                    let nearest_before = self.candidates.keys().next().copied();
                    for candidate in returned {
                        if self.failed.contains(&candidate.id) {
                            continue;
                        }
                        self.candidates
                            .insert(candidate.id.distance(&self.target), candidate);
                    }
                    let bound = (self.service.config.alpha + 1) * self.service.config.k;
                    while self.candidates.len() > bound {
                        self.candidates.pop_last();
                    }
                    if self.candidates.keys().next().copied() != nearest_before {
                        let fresh = self.claim_unqueried(self.service.config.alpha);
                        self.send_probes(fresh);
                    }
                }
                PathEvent::Failed(node) => {
                    self.failed.insert(node.id);
                    {
                        let mut table = self.service.table.lock().unwrap();
                        table.timeout(&node.id);
                    }
                    self.candidates.remove(&node.id.distance(&self.target));
                }
            }
        }
    }

    /// The k best candidates this path still believes in.
    fn best(&self) -> Vec<Node> {
        self.candidates
            .values()
            .take(self.service.config.k)
            .copied()
            .collect()
    }
}
