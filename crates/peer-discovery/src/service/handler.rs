//! Serving inbound `FindNode` and `Ping` requests.
//!
//! Admission of the requester into the routing table is deliberately
//! narrow. Requests are unsigned, so a sender can claim any id; the rules
//! below bound what such a claim can do:
//!
//! - nothing is admitted before this node has bootstrapped,
//! - a claimed id from our own half of the id space (same bit 0) can at
//!   most reset an existing entry's timeout counter,
//! - a claimed id that collides with a stored entry, or lands in a full
//!   bucket, only takes effect after the stored/front node has failed a
//!   direct probe and the claimant has answered one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{DiscoveryConfig, Insert, Node, Peer, PeerId, RoutingTable};
use crate::ports::{InboundReply, Messenger, Reply, RequestHandler};
use crate::service::{BootstrapState, DiscoveryService};
use crate::wire::{Request, ResponsePayload, WireNode};

#[async_trait]
impl RequestHandler for DiscoveryService {
    async fn handle(&self, from: Peer, request: Request) -> InboundReply {
        match request {
            Request::Ping { return_port } => {
                let reply_to = match return_port {
                    Some(port) => from.with_port(port),
                    None => from,
                };
                InboundReply {
                    payload: ResponsePayload::Pong,
                    reply_to,
                }
            }
            Request::FindNode {
                peer_id,
                public_port,
                target_id,
            } => {
                self.admit(from, peer_id, public_port);
                let closest = {
                    self.table
                        .lock()
                        .unwrap()
                        .find_closest(self.config.k, &target_id)
                };
                InboundReply {
                    payload: ResponsePayload::ReturnNodes(
                        closest.into_iter().map(WireNode::from).collect(),
                    ),
                    reply_to: from,
                }
            }
        }
    }
}

impl DiscoveryService {
    /// Apply the admission rules to a `FindNode` sender. Without an
    /// announced port the sender has no insertable endpoint and the table
    /// is untouched.
    fn admit(&self, from: Peer, peer_id: PeerId, public_port: Option<u16>) {
        let Some(port) = public_port else {
            return;
        };
        if peer_id == self.local_id {
            return;
        }
        let node = Node::new(peer_id, from.with_port(port));

        let mut table = self.table.lock().unwrap();
        if self.bootstrap.state() != BootstrapState::Done {
            return;
        }
        if peer_id.bit(0) == self.local_id.bit(0) {
            // Our own half of the tree: inbound traffic may refresh an
            // entry we already trust, never add one.
            table.clear_timeout(&peer_id);
            return;
        }
        match table.insert(&self.config, node) {
            Insert::Added | Insert::Refreshed => {}
            Insert::Full(stored) => {
                drop(table);
                debug!(claimed = ?node.id, stored = ?stored.id, "bucket contention, probing stored node");
                spawn_displacement_check(
                    Arc::clone(&self.messenger),
                    Arc::clone(&self.table),
                    self.config.clone(),
                    stored,
                    node,
                );
            }
        }
    }
}

/// Resolve bucket contention off the request path: keep `stored` if its
/// address still answers; otherwise let `claimant` in only once it has
/// answered a probe itself. A claimant that merely forwarded the stored
/// node's traffic can pass neither gate.
fn spawn_displacement_check(
    messenger: Arc<dyn Messenger>,
    table: Arc<std::sync::Mutex<RoutingTable>>,
    config: DiscoveryConfig,
    stored: Node,
    claimant: Node,
) {
    tokio::spawn(async move {
        let ping = Request::Ping { return_port: None };
        if let Ok(Reply { sender, .. }) = messenger.request(stored.peer, ping.clone()).await {
            if sender == stored.id {
                return;
            }
        }
        {
            table.lock().unwrap().timeout(&stored.id);
        }
        match messenger.request(claimant.peer, ping).await {
            Ok(Reply { sender, .. }) if sender == claimant.id => {
                table.lock().unwrap().insert_forced(&config, claimant);
            }
            _ => {
                debug!(claimed = ?claimant.id, "claimant did not answer, dropping");
            }
        }
    });
}
