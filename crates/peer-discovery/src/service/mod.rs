//! The discovery service: bootstrap, lookup, request handling, and
//! routing-table maintenance over a shared routing table.

mod bootstrap;
mod handler;
mod lookup;
mod maintenance;
#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, RwLock};

use crate::domain::{DiscoveryConfig, Node, PeerId, RoutingTable};
use crate::ports::Messenger;
use crate::wire::Request;

pub use bootstrap::BootstrapState;
use bootstrap::BootstrapCell;

/// One node's discovery instance.
///
/// All operations share the routing table (guarded by a plain mutex with
/// brief critical sections, never held across an await), the bootstrap
/// state cell, and the announced public port.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    local_id: PeerId,
    table: Arc<Mutex<RoutingTable>>,
    bootstrap: Arc<BootstrapCell>,
    public_port: Arc<RwLock<Option<u16>>>,
    messenger: Arc<dyn Messenger>,
}

impl DiscoveryService {
    /// Create an instance with an empty routing table.
    ///
    /// `public_port` is the port this node wants to announce to the
    /// network; it is cleared if bootstrap finds the node unreachable
    /// there.
    pub fn new(
        config: DiscoveryConfig,
        local_id: PeerId,
        public_port: Option<u16>,
        messenger: Arc<dyn Messenger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            local_id,
            table: Arc::new(Mutex::new(RoutingTable::new(local_id))),
            bootstrap: Arc::new(BootstrapCell::new()),
            public_port: Arc::new(RwLock::new(public_port)),
            messenger,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// The currently announced public port, if any.
    pub fn public_port(&self) -> Option<u16> {
        *self.public_port.read().unwrap()
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }

    /// Up to `n` table entries closest to `target`, without any network
    /// traffic.
    pub fn closest_known(&self, n: usize, target: &PeerId) -> Vec<Node> {
        self.table.lock().unwrap().find_closest(n, target)
    }

    /// Number of nodes currently in the routing table.
    pub fn known_nodes(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Build a `FindNode` carrying our id and the current public port.
    fn find_node_request(&self, target: PeerId) -> Request {
        Request::FindNode {
            peer_id: self.local_id,
            public_port: self.public_port(),
            target_id: target,
        }
    }
}
