//! # Kademlia Peer Discovery
//!
//! Peer discovery for an overlay network of authenticated nodes speaking
//! CBOR over UDP. A node derives its 224-bit PeerId from its Ed25519
//! public key, keeps the nodes it knows in a binary trie of k-buckets,
//! and offers three operations on top of it:
//!
//! - **bootstrap**: join the network from one known peer, including a
//!   self-reachability probe for the announced port,
//! - **lookup**: find the k live nodes closest to a target id via
//!   parallel disjoint lookup paths with a majority filter,
//! - **maintenance**: periodically verify suspicious entries and evict
//!   dead ones from each bucket's replacement cache.
//!
//! Inbound `FindNode`/`Ping` requests are served through the
//! [`ports::RequestHandler`] implementation on [`DiscoveryService`],
//! with admission rules that keep unsolicited traffic from poisoning the
//! routing table.
//!
//! ## Layout
//!
//! - [`domain`]: pure Kademlia state, no I/O
//! - [`wire`]: CBOR packet layer
//! - [`ports`]: trait seams toward the transport
//! - [`adapters`]: the UDP transport
//! - [`service`]: the concurrent discovery core
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use peer_discovery::{
//!     DiscoveryConfig, DiscoveryService, NodeIdentity, Peer, UdpMessenger,
//! };
//!
//! # async fn join() -> std::io::Result<()> {
//! let identity = Arc::new(NodeIdentity::generate());
//! let messenger = UdpMessenger::bind(
//!     "0.0.0.0:4000".parse().unwrap(),
//!     Arc::clone(&identity),
//!     DiscoveryConfig::default().response_timeout,
//! )
//! .await?;
//! let service = DiscoveryService::new(
//!     DiscoveryConfig::default(),
//!     identity.peer_id(),
//!     Some(4000),
//!     messenger.clone(),
//! );
//! messenger.start(service.clone());
//!
//! let seed = Peer::new("198.51.100.7".parse().unwrap(), 4000);
//! if service.bootstrap(seed).await {
//!     let found = service.lookup(identity.peer_id()).await;
//!     println!("neighbors: {found:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod domain;
pub mod identity;
pub mod ports;
pub mod service;
pub mod wire;

// Re-export the types most consumers touch.
pub use adapters::UdpMessenger;
pub use domain::{DiscoveryConfig, Distance, Node, NodeInfo, Peer, PeerId, RoutingTable};
pub use identity::NodeIdentity;
pub use ports::{CommError, Messenger, Reply, RequestHandler};
pub use service::{BootstrapState, DiscoveryService};
