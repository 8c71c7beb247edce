//! Pure Kademlia state: identifiers, nodes, configuration, and the
//! routing table. No I/O happens in this module.

mod config;
mod entities;
mod peer_id;
mod routing_table;

pub use config::DiscoveryConfig;
pub use entities::{Node, NodeInfo, Peer};
pub use peer_id::{Distance, PeerId};
pub use routing_table::{BucketView, Insert, RoutingTable};
