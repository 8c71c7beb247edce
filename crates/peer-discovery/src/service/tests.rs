//! End-to-end service tests over a scripted in-memory messenger.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::domain::{DiscoveryConfig, Node, Peer, PeerId};
use crate::ports::{CommError, Messenger, Reply, RequestHandler};
use crate::wire::{Packet, Request, ResponsePayload, WireNode};

/// How a scripted peer behaves.
#[derive(Clone)]
enum Script {
    /// Drops every packet.
    Dead,
    /// Answers pings and serves its known nodes, closest first.
    Live {
        id: PeerId,
        knows: Vec<Node>,
        /// Whether a ping with a return port gets an answer; false
        /// simulates an unreachable announced port.
        reach_back: bool,
    },
}

fn live(id: PeerId) -> Script {
    Script::Live {
        id,
        knows: Vec::new(),
        reach_back: true,
    }
}

fn live_knowing(id: PeerId, knows: Vec<Node>) -> Script {
    Script::Live {
        id,
        knows,
        reach_back: true,
    }
}

/// In-memory network of scripted peers. Requests resolve immediately;
/// unscripted addresses time out.
struct TestNet {
    k: usize,
    peers: Mutex<HashMap<Peer, Script>>,
    log: Mutex<Vec<(Peer, Request)>>,
}

impl TestNet {
    fn new(k: usize) -> Arc<Self> {
        Arc::new(Self {
            k,
            peers: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, peer: Peer, script: Script) {
        self.peers.lock().unwrap().insert(peer, script);
    }

    fn sent(&self) -> Vec<(Peer, Request)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for TestNet {
    async fn request(&self, peer: Peer, request: Request) -> Result<Reply, CommError> {
        self.log.lock().unwrap().push((peer, request.clone()));
        let script = self.peers.lock().unwrap().get(&peer).cloned();
        match script {
            None | Some(Script::Dead) => Err(CommError::Timeout),
            Some(Script::Live {
                id,
                knows,
                reach_back,
            }) => match request {
                Request::Ping {
                    return_port: Some(_),
                } if !reach_back => Err(CommError::Timeout),
                Request::Ping { .. } => Ok(Reply {
                    sender: id,
                    payload: ResponsePayload::Pong,
                }),
                Request::FindNode { target_id, .. } => {
                    let mut known = knows;
                    known.sort_by_key(|n| n.id.distance(&target_id));
                    known.truncate(self.k);
                    Ok(Reply {
                        sender: id,
                        payload: ResponsePayload::ReturnNodes(
                            known.into_iter().map(WireNode::from).collect(),
                        ),
                    })
                }
            },
        }
    }

    async fn send(&self, _peer: Peer, _packet: Packet) -> Result<(), CommError> {
        Ok(())
    }
}

fn id_bytes(first: u8, tail: u8) -> PeerId {
    let mut bytes = [0u8; 28];
    bytes[0] = first;
    bytes[27] = tail;
    PeerId::new(bytes)
}

fn peer(tail: u8) -> Peer {
    Peer::new(Ipv4Addr::new(10, 0, 0, tail), 9000)
}

fn local_id() -> PeerId {
    PeerId::new([0u8; 28])
}

/// Route `debug!`/`info!`/`warn!` output through the test harness;
/// filter with `RUST_LOG` as usual. Safe to call from every test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn service_with(
    config: DiscoveryConfig,
    public_port: Option<u16>,
    net: &Arc<TestNet>,
) -> Arc<DiscoveryService> {
    init_tracing();
    DiscoveryService::new(config, local_id(), public_port, net.clone())
}

fn is_plain_ping(request: &Request) -> bool {
    matches!(request, Request::Ping { return_port: None })
}

// =========================================================================
// Bootstrap
// =========================================================================

#[tokio::test]
async fn test_bootstrap_against_single_live_peer() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let initial = Node::new(PeerId::new([0xFF; 28]), peer(1));
    net.script(initial.peer, live(initial.id));
    let service = service_with(config, None, &net);

    assert!(service.bootstrap(initial.peer).await);
    assert_eq!(service.bootstrap_state(), BootstrapState::Done);
    assert!(
        service.closest_known(10, &initial.id).contains(&initial),
        "initial peer must end up in the routing table"
    );
}

#[tokio::test]
async fn test_failed_bootstrap_rolls_back() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    net.script(peer(1), Script::Dead);
    let service = service_with(config, Some(4000), &net);

    assert!(!service.bootstrap(peer(1)).await);
    assert_eq!(service.bootstrap_state(), BootstrapState::Needed);
    assert_eq!(
        service.public_port(),
        Some(4000),
        "failed bootstrap must restore the requested port"
    );
    assert_eq!(service.known_nodes(), 0);
}

#[tokio::test]
async fn test_concurrent_bootstraps_share_one_probe_set() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let initial = Node::new(PeerId::new([0xFF; 28]), peer(1));
    net.script(initial.peer, live(initial.id));
    let service = service_with(config, None, &net);

    let (a, b, c) = tokio::join!(
        service.bootstrap(initial.peer),
        service.bootstrap(initial.peer),
        service.bootstrap(initial.peer),
    );
    assert!(a && b && c, "waiters share the owner's outcome");

    let plain_pings = net
        .sent()
        .iter()
        .filter(|(to, request)| *to == initial.peer && is_plain_ping(request))
        .count();
    assert_eq!(plain_pings, 1, "only the owner probes the initial peer");
}

#[tokio::test]
async fn test_unreachable_announced_port_is_cleared() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let initial = Node::new(PeerId::new([0xFF; 28]), peer(1));
    net.script(
        initial.peer,
        Script::Live {
            id: initial.id,
            knows: Vec::new(),
            reach_back: false,
        },
    );
    let service = service_with(config, Some(4000), &net);

    assert!(
        service.bootstrap(initial.peer).await,
        "an unreachable announced port does not fail the join"
    );
    // The probe is detached from bootstrap; give it a beat to finish.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(service.public_port(), None);

    // Later FindNode emissions must stop announcing the port.
    service.lookup(id_bytes(0xAB, 0)).await;
    let last_find_node = net
        .sent()
        .into_iter()
        .filter_map(|(_, request)| match request {
            Request::FindNode { public_port, .. } => Some(public_port),
            _ => None,
        })
        .last();
    assert_eq!(last_find_node, Some(None));
}

#[tokio::test]
async fn test_rebootstrap_probes_again() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let initial = Node::new(PeerId::new([0xFF; 28]), peer(1));
    net.script(initial.peer, live(initial.id));
    let service = service_with(config, None, &net);

    assert!(service.bootstrap(initial.peer).await);
    assert!(service.bootstrap(initial.peer).await);

    let plain_pings = net
        .sent()
        .iter()
        .filter(|(to, request)| *to == initial.peer && is_plain_ping(request))
        .count();
    assert_eq!(plain_pings, 2, "a repeat call re-runs the join protocol");
}

// =========================================================================
// Lookup
// =========================================================================

#[tokio::test]
async fn test_lookup_on_empty_table_finds_nothing() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);

    assert!(service.lookup(id_bytes(0x55, 0)).await.is_empty());
    assert!(net.sent().is_empty());
}

#[tokio::test]
async fn test_lookup_filters_sybil_path_by_majority() {
    let config = DiscoveryConfig {
        alpha: 3,
        k: 3,
        ..DiscoveryConfig::for_testing()
    };
    let net = TestNet::new(config.k);
    let target = id_bytes(0xF0, 0);

    // Five honest nodes; every one of them knows all five.
    let honest: Vec<Node> = (1..=5)
        .map(|i| Node::new(id_bytes(0xF0 ^ i, i), peer(i)))
        .collect();
    for node in &honest {
        net.script(node.peer, live_knowing(node.id, honest.clone()));
    }

    // One Sybil node serving fabricated ids very close to the target,
    // none of which actually answers.
    let sybil = Node::new(id_bytes(0xFE, 6), peer(6));
    let fabricated: Vec<Node> = (1..=3)
        .map(|i| Node::new(id_bytes(0xF0, 40 + i), peer(40 + i)))
        .collect();
    net.script(sybil.peer, live_knowing(sybil.id, fabricated.clone()));

    let service = service_with(config.clone(), None, &net);
    {
        let mut table = service.table.lock().unwrap();
        table.insert_forced(&config, honest[0]);
        table.insert_forced(&config, honest[1]);
        table.insert_forced(&config, sybil);
    }

    let found = service.lookup(target).await;

    assert_eq!(
        found,
        vec![honest[0], honest[1], honest[2]],
        "result is the real k-closest set, nearest first"
    );
    for fake in &fabricated {
        assert!(!found.contains(fake), "fabricated nodes are filtered out");
    }
    assert!(!found.contains(&sybil), "a single-path witness is not enough");

    // No node is ever queried twice within one lookup.
    let mut queried_peers = Vec::new();
    for (to, request) in net.sent() {
        if matches!(request, Request::FindNode { target_id, .. } if target_id == target) {
            assert!(
                !queried_peers.contains(&to),
                "peer {to} received two FindNode rpcs in one lookup"
            );
            queried_peers.push(to);
        }
    }
}

#[tokio::test]
async fn test_lookup_inserts_responding_peers() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let target = id_bytes(0xF0, 0);

    let known = Node::new(id_bytes(0xF1, 1), peer(1));
    let discovered = Node::new(id_bytes(0xF0, 2), peer(2));
    net.script(known.peer, live_knowing(known.id, vec![discovered]));
    net.script(discovered.peer, live(discovered.id));

    let service = service_with(config.clone(), None, &net);
    service
        .table
        .lock()
        .unwrap()
        .insert_forced(&config, known);

    service.lookup(target).await;

    assert!(
        service.closest_known(10, &target).contains(&discovered),
        "nodes that answered a lookup probe enter the routing table"
    );
}

#[tokio::test]
async fn test_lookup_counts_failures_against_the_table() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let silent = Node::new(id_bytes(0xF2, 1), peer(1));
    net.script(silent.peer, Script::Dead);

    let service = service_with(config.clone(), None, &net);
    service
        .table
        .lock()
        .unwrap()
        .insert_forced(&config, silent);

    service.lookup(id_bytes(0xF0, 0)).await;

    let table = service.table.lock().unwrap();
    assert_eq!(table.get(&silent.id).unwrap().timeout_count, 1);
}

// =========================================================================
// Request handling
// =========================================================================

#[tokio::test]
async fn test_ping_reply_goes_to_return_port() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);
    let from = peer(1);

    let redirected = service
        .handle(
            from,
            Request::Ping {
                return_port: Some(4444),
            },
        )
        .await;
    assert_eq!(redirected.payload, ResponsePayload::Pong);
    assert_eq!(redirected.reply_to, from.with_port(4444));

    let direct = service
        .handle(from, Request::Ping { return_port: None })
        .await;
    assert_eq!(direct.reply_to, from);
}

#[tokio::test]
async fn test_no_admission_before_bootstrap_completes() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);

    let reply = service
        .handle(
            peer(1),
            Request::FindNode {
                peer_id: id_bytes(0xF0, 1),
                public_port: Some(9000),
                target_id: id_bytes(0x01, 0),
            },
        )
        .await;

    assert!(matches!(reply.payload, ResponsePayload::ReturnNodes(ref nodes) if nodes.is_empty()));
    assert_eq!(service.known_nodes(), 0, "no admission before bootstrap");
}

#[tokio::test]
async fn test_same_half_sender_is_never_inserted() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);
    service.bootstrap.set(BootstrapState::Done);

    // Bit 0 of 0x01.. equals bit 0 of the local id (both zero).
    service
        .handle(
            peer(1),
            Request::FindNode {
                peer_id: id_bytes(0x01, 1),
                public_port: Some(9000),
                target_id: id_bytes(0xF0, 0),
            },
        )
        .await;

    assert_eq!(service.known_nodes(), 0);
}

#[tokio::test]
async fn test_same_half_sender_resets_timeout_of_known_entry() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);
    service.bootstrap.set(BootstrapState::Done);

    let known = Node::new(id_bytes(0x01, 1), peer(1).with_port(9000));
    {
        let mut table = service.table.lock().unwrap();
        table.insert_forced(&config, known);
        table.timeout(&known.id);
        table.timeout(&known.id);
    }

    service
        .handle(
            peer(1),
            Request::FindNode {
                peer_id: known.id,
                public_port: Some(9000),
                target_id: id_bytes(0xF0, 0),
            },
        )
        .await;

    let table = service.table.lock().unwrap();
    assert_eq!(table.get(&known.id).unwrap().timeout_count, 0);
    assert_eq!(table.len(), 1, "membership is unchanged");
}

#[tokio::test]
async fn test_far_half_sender_is_admitted() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);
    service.bootstrap.set(BootstrapState::Done);

    service
        .handle(
            peer(1),
            Request::FindNode {
                peer_id: id_bytes(0xF0, 1),
                public_port: Some(9001),
                target_id: id_bytes(0x01, 0),
            },
        )
        .await;

    let table = service.table.lock().unwrap();
    let entry = table.get(&id_bytes(0xF0, 1)).unwrap();
    assert_eq!(entry.node.peer, peer(1).with_port(9001));
}

#[tokio::test]
async fn test_sender_without_public_port_is_not_admitted() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config, None, &net);
    service.bootstrap.set(BootstrapState::Done);

    service
        .handle(
            peer(1),
            Request::FindNode {
                peer_id: id_bytes(0xF0, 1),
                public_port: None,
                target_id: id_bytes(0x01, 0),
            },
        )
        .await;

    assert_eq!(service.known_nodes(), 0);
}

#[tokio::test]
async fn test_find_node_returns_closest_known_nodes() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);

    let nodes: Vec<Node> = [(0xF1u8, 1u8), (0xF8, 2), (0x81, 3), (0xC0, 4)]
        .into_iter()
        .map(|(first, tail)| Node::new(id_bytes(first, tail), peer(tail)))
        .collect();
    {
        let mut table = service.table.lock().unwrap();
        for node in &nodes {
            table.insert_forced(&config, *node);
        }
    }

    let target = id_bytes(0xF0, 0);
    let reply = service
        .handle(
            peer(9),
            Request::FindNode {
                peer_id: id_bytes(0xAA, 9),
                public_port: None,
                target_id: target,
            },
        )
        .await;

    let ResponsePayload::ReturnNodes(returned) = reply.payload else {
        panic!("FindNode must be answered with ReturnNodes");
    };
    let returned: Vec<Node> = returned.into_iter().map(Node::from).collect();
    assert_eq!(returned.len(), 3);
    for pair in returned.windows(2) {
        assert!(pair[0].id.distance(&target) < pair[1].id.distance(&target));
    }
}

#[tokio::test]
async fn test_live_stored_node_survives_an_impersonation_claim() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);
    service.bootstrap.set(BootstrapState::Done);

    let stored = Node::new(id_bytes(0xF0, 1), peer(1).with_port(9000));
    net.script(stored.peer, live(stored.id));
    service
        .table
        .lock()
        .unwrap()
        .insert_forced(&config, stored);

    // Same id claimed from a different address.
    service
        .handle(
            peer(2),
            Request::FindNode {
                peer_id: stored.id,
                public_port: Some(9000),
                target_id: id_bytes(0x01, 0),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let table = service.table.lock().unwrap();
    assert_eq!(
        table.get(&stored.id).unwrap().node.peer,
        stored.peer,
        "a live stored address is never displaced"
    );
}

#[tokio::test]
async fn test_dead_stored_node_is_displaced_by_answering_claimant() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);
    service.bootstrap.set(BootstrapState::Done);

    let id = id_bytes(0xF0, 1);
    let old_addr = peer(1).with_port(9000);
    let new_addr = peer(2).with_port(9000);
    net.script(old_addr, Script::Dead);
    net.script(new_addr, live(id));
    service
        .table
        .lock()
        .unwrap()
        .insert_forced(&config, Node::new(id, old_addr));

    service
        .handle(
            peer(2),
            Request::FindNode {
                peer_id: id,
                public_port: Some(9000),
                target_id: id_bytes(0x01, 0),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let table = service.table.lock().unwrap();
    let entry = table.get(&id).unwrap();
    assert_eq!(entry.node.peer, new_addr, "the answering claimant takes over");
    assert_eq!(entry.timeout_count, 0);
}

// =========================================================================
// Maintenance
// =========================================================================

#[tokio::test]
async fn test_maintenance_clears_counter_of_answering_node() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);

    let node = Node::new(id_bytes(0xF0, 1), peer(1));
    net.script(node.peer, live(node.id));
    {
        let mut table = service.table.lock().unwrap();
        table.insert_forced(&config, node);
        table.timeout(&node.id);
    }

    service.maintain().await;

    let table = service.table.lock().unwrap();
    assert_eq!(table.get(&node.id).unwrap().timeout_count, 0);
}

#[tokio::test]
async fn test_maintenance_under_full_outage_only_advances_counters() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);

    let nodes: Vec<Node> = (1..=3)
        .map(|tail| Node::new(id_bytes(0xF0, tail), peer(tail)))
        .collect();
    {
        let mut table = service.table.lock().unwrap();
        for node in &nodes {
            table.insert_forced(&config, *node);
        }
        table.timeout(&nodes[0].id);
    }

    service.maintain().await;

    let table = service.table.lock().unwrap();
    assert_eq!(table.len(), 3, "full outage must not shrink the table");
    assert_eq!(table.get(&nodes[0].id).unwrap().timeout_count, 2);
    assert_eq!(table.get(&nodes[1].id).unwrap().timeout_count, 0);
}

#[tokio::test]
async fn test_maintenance_evicts_dead_node_via_cache() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);

    // Fill one far bucket to capacity, then push a candidate into its
    // replacement cache.
    let nodes: Vec<Node> = (1..=3)
        .map(|tail| Node::new(id_bytes(0x80, tail), peer(tail)))
        .collect();
    let cached = Node::new(id_bytes(0x80, 9), peer(9));
    {
        let mut table = service.table.lock().unwrap();
        for node in &nodes {
            table.insert(&config, *node);
        }
        table.insert(&config, cached);
        table.timeout(&nodes[0].id);
    }
    net.script(nodes[0].peer, Script::Dead);
    net.script(cached.peer, live(cached.id));

    // max_timeouts = 2: the failing probe pushes the counter to 2.
    service.maintain().await;

    let table = service.table.lock().unwrap();
    assert!(!table.contains(&nodes[0].id), "dead node is evicted");
    let entry = table.get(&cached.id).unwrap();
    assert_eq!(entry.timeout_count, 0, "promoted node starts fresh");
    let caches: Vec<Node> = table.buckets().into_iter().flat_map(|b| b.cache).collect();
    assert!(caches.is_empty(), "promoted node left the cache");
}

#[tokio::test]
async fn test_maintenance_keeps_entry_when_cache_is_dead_too() {
    let config = DiscoveryConfig::for_testing();
    let net = TestNet::new(config.k);
    let service = service_with(config.clone(), None, &net);

    let nodes: Vec<Node> = (1..=3)
        .map(|tail| Node::new(id_bytes(0x80, tail), peer(tail)))
        .collect();
    let cached = Node::new(id_bytes(0x80, 9), peer(9));
    {
        let mut table = service.table.lock().unwrap();
        for node in &nodes {
            table.insert(&config, *node);
        }
        table.insert(&config, cached);
        table.timeout(&nodes[0].id);
    }
    // Everyone is unreachable, including the cached candidate.

    service.maintain().await;

    let table = service.table.lock().unwrap();
    assert!(
        table.contains(&nodes[0].id),
        "no eviction without a live replacement"
    );
    assert_eq!(table.get(&nodes[0].id).unwrap().timeout_count, 2);
}
