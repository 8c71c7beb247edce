//! Periodic liveness verification and cache-based eviction.
//!
//! Suspicious entries (timeout counter above zero) are probed with a
//! `FindNode` for a random target rather than a `Ping`: a node that
//! selectively ignores `FindNode` while answering `Ping` would otherwise
//! hold a slot it never serves. If every probe in a pass fails, nothing
//! is evicted; counters advance and the table survives a full outage
//! intact.

use std::collections::HashSet;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{BucketView, Node, PeerId};
use crate::ports::Reply;
use crate::service::DiscoveryService;
use crate::wire::ResponsePayload;

impl DiscoveryService {
    /// One maintenance pass. Invoke from a periodic timer task.
    pub async fn maintain(&self) {
        let views: Vec<BucketView> = {
            self.table
                .lock()
                .unwrap()
                .buckets()
                .into_iter()
                .filter(|view| view.entries.iter().any(|e| e.timeout_count > 0))
                .collect()
        };
        if views.is_empty() {
            return;
        }
        debug!(buckets = views.len(), "maintenance pass");
        join_all(views.into_iter().map(|view| self.sweep_bucket(view))).await;
    }

    /// Probe one bucket's suspicious entries and evict the ones that keep
    /// failing, using the bucket's replacement cache.
    async fn sweep_bucket(&self, view: BucketView) {
        let suspicious: Vec<Node> = view
            .entries
            .iter()
            .filter(|entry| entry.timeout_count > 0)
            .map(|entry| entry.node)
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = 0;
        for node in &suspicious {
            pending += 1;
            self.spawn_liveness_probe(*node, tx.clone());
        }
        drop(tx);

        // Cache probes are issued once, on the first eviction that needs
        // them, and their outcomes reused for the rest of the pass.
        let mut cache_probe: Option<Vec<(Node, bool)>> = None;
        let mut promoted: HashSet<PeerId> = HashSet::new();

        while pending > 0 {
            let Some((node, alive)) = rx.recv().await else {
                return;
            };
            pending -= 1;

            if alive {
                self.table.lock().unwrap().clear_timeout(&node.id);
                continue;
            }
            let new_count = self.table.lock().unwrap().timeout(&node.id);
            let Some(count) = new_count else {
                continue;
            };
            if count < self.config.max_timeouts {
                continue;
            }

            if cache_probe.is_none() {
                cache_probe = Some(self.probe_cache(&view.cache).await);
            }
            let Some(probes) = cache_probe.as_ref() else {
                continue;
            };
            let replacement = probes
                .iter()
                .find(|(candidate, alive)| *alive && !promoted.contains(&candidate.id))
                .map(|(candidate, _)| *candidate);
            match replacement {
                Some(fresh) => {
                    promoted.insert(fresh.id);
                    self.table.lock().unwrap().replace(&node.id, fresh);
                    info!(dead = ?node.id, promoted = ?fresh.id, "evicted dead node");
                }
                None => {
                    debug!(dead = ?node.id, "no live replacement cached, keeping entry");
                }
            }
        }
    }

    /// Probe every cached candidate once, preserving cache order.
    async fn probe_cache(&self, cache: &[Node]) -> Vec<(Node, bool)> {
        join_all(cache.iter().map(|candidate| async move {
            (*candidate, self.probe_once(*candidate).await)
        }))
        .await
    }

    fn spawn_liveness_probe(&self, node: Node, tx: mpsc::UnboundedSender<(Node, bool)>) {
        let request = self.find_node_request(PeerId::random(&mut rand::thread_rng()));
        let messenger = std::sync::Arc::clone(&self.messenger);
        tokio::spawn(async move {
            let alive = matches!(
                messenger.request(node.peer, request).await,
                Ok(Reply { sender, payload: ResponsePayload::ReturnNodes(_) }) if sender == node.id
            );
            let _ = tx.send((node, alive));
        });
    }

    async fn probe_once(&self, node: Node) -> bool {
        let request = self.find_node_request(PeerId::random(&mut rand::thread_rng()));
        matches!(
            self.messenger.request(node.peer, request).await,
            Ok(Reply { sender, payload: ResponsePayload::ReturnNodes(_) }) if sender == node.id
        )
    }
}
