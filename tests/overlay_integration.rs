//! Integration tests for overlay nodes running over the in-memory network.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test overlay_integration -- --nocapture

use std::sync::Once;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hyperspace::connection::sign_description;
use hyperspace::envelope::{self, EnvelopeLimits, encode_body, extend, originate};
use hyperspace::messages::{Body, DEFAULT_MESSAGE_TTL, MessageKind, WireEnvelope};
use hyperspace::{
    ConnectionId, IdentityRegistry, KadId, Keypair, MemoryNetwork, MemoryTransport, Node,
    NodeConfig, NodeEvent, PeerIdentity, SdpKind, Transport, TransportEvent, VerifiedEnvelope,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Node,
    transport: MemoryTransport,
}

async fn spawn(network: &MemoryNetwork, keypair: Keypair, config: NodeConfig) -> TestNode {
    let (transport, events) = network.endpoint().await;
    let node = Node::start(keypair, config, transport.clone(), events).expect("start failed");
    TestNode { node, transport }
}

/// Out-of-band bootstrap. Returns the connection id on `from`'s side once
/// both ends report the connection.
async fn link(from: &Node, to: &Node) -> ConnectionId {
    let mut from_events = from.events();
    let mut to_events = to.events();
    let (conn, offer) = from.create_offer().await.expect("offer failed");
    let answer = to.accept_offer(offer).await.expect("accept failed");
    from.apply_answer(conn, answer).await.expect("answer failed");
    wait_for(&mut from_events, NodeEvent::Connected(to.identity().clone())).await;
    wait_for(&mut to_events, NodeEvent::Connected(from.identity().clone())).await;
    conn
}

async fn next_event(events: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

async fn wait_for(events: &mut broadcast::Receiver<NodeEvent>, expected: NodeEvent) {
    while next_event(events).await != expected {}
}

async fn wait_for_disconnect(events: &mut broadcast::Receiver<NodeEvent>, peer: &PeerIdentity) {
    wait_for(events, NodeEvent::Disconnected(peer.clone())).await;
}

#[tokio::test]
async fn lookup_is_answered_by_the_other_side() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let b = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    link(&a.node, &b.node).await;

    let target = KadId::from_u64(12345);
    let found = a.node.lookup(target).await.expect("lookup failed");
    assert_eq!(found.closest, *b.node.identity());
    assert_eq!(found.hops, 1);
    assert!(found.siblings.contains(a.node.identity()));
}

#[tokio::test]
async fn lookup_and_data_cross_a_relay() {
    init_tracing();
    let network = MemoryNetwork::new();
    let seed = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let b = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let c = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    link(&seed.node, &b.node).await;
    link(&seed.node, &c.node).await;

    let found = c
        .node
        .lookup(b.node.identity().kad_id())
        .await
        .expect("lookup failed");
    assert_eq!(found.closest, *b.node.identity());

    let mut inbox = b.node.messages().await.expect("receiver taken");
    assert!(b.node.messages().await.is_err());

    c.node
        .send(b.node.identity(), b"across the overlay".to_vec())
        .await
        .expect("send failed");
    let received = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("no data in time")
        .expect("inbox closed");
    assert_eq!(received.from, *c.node.identity());
    assert_eq!(received.data, b"across the overlay");
}

#[tokio::test]
async fn severed_link_disconnects_both_sides() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let b = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let mut a_events = a.node.events();
    let mut b_events = b.node.events();

    let conn = link(&a.node, &b.node).await;
    assert_eq!(network.open_links().await, 1);

    a.transport.sever(conn).await;
    wait_for_disconnect(&mut a_events, b.node.identity()).await;
    wait_for_disconnect(&mut b_events, a.node.identity()).await;

    let snap = a.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.open_connections, 0);
    assert_eq!(snap.table_len, 0);
    assert!(a.node.ping(b.node.identity()).await.is_err());
}

#[tokio::test]
async fn shutdown_closes_connections() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let b = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let mut b_events = b.node.events();
    link(&a.node, &b.node).await;

    a.node.shutdown().await;
    wait_for_disconnect(&mut b_events, a.node.identity()).await;
    assert!(a.node.snapshot().await.is_err());
}

/// `local` has the lowest id of the lot, `nearest` the next one up. The two
/// `crowded` keys land in the same bucket relative to `local`.
struct CrowdedKeys {
    local: Keypair,
    nearest: Keypair,
    crowded: (Keypair, Keypair),
}

fn crowded_keys() -> CrowdedKeys {
    let mut keys: Vec<Keypair> = (0..64).map(|_| Keypair::generate()).collect();
    keys.sort_by_key(|k| k.identity().kad_id());
    let mut keys = keys.into_iter();
    let local = keys.next().unwrap();
    let nearest = keys.next().unwrap();
    let local_kad = local.identity().kad_id();

    let mut rest: Vec<Keypair> = keys.collect();
    let buckets: Vec<usize> = rest
        .iter()
        .map(|k| local_kad.bucket_index(&k.identity().kad_id()))
        .collect();
    let (i, j) = (0..buckets.len())
        .flat_map(|i| (i + 1..buckets.len()).map(move |j| (i, j)))
        .find(|&(i, j)| buckets[i] == buckets[j])
        .expect("no two keys share a bucket");
    let second = rest.remove(j);
    let first = rest.remove(i);
    CrowdedKeys {
        local,
        nearest,
        crowded: (first, second),
    }
}

#[tokio::test(start_paused = true)]
async fn unclaimed_connection_is_evicted_after_grace() {
    init_tracing();
    let keys = crowded_keys();
    let config = NodeConfig {
        k: 1,
        siblings: 1,
        ..NodeConfig::default()
    };
    let network = MemoryNetwork::new();
    let local = spawn(&network, keys.local, config.clone()).await;
    let nearest = spawn(&network, keys.nearest, config.clone()).await;
    let kept = spawn(&network, keys.crowded.0, config.clone()).await;
    let extra = spawn(&network, keys.crowded.1, config.clone()).await;
    let mut events = local.node.events();

    link(&local.node, &nearest.node).await;
    link(&local.node, &kept.node).await;
    link(&local.node, &extra.node).await;

    let snap = local.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.siblings, vec![nearest.node.identity().clone()]);
    assert_eq!(snap.table_len, 2);
    assert_eq!(snap.open_connections, 3);

    tokio::time::sleep(config.claim_grace + Duration::from_secs(1)).await;
    wait_for_disconnect(&mut events, extra.node.identity()).await;

    let snap = local.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.open_connections, 2);
    assert_eq!(snap.table_len, 2);
}

/// `(far, near, target)`: `near` is strictly closer to `target` by XOR than `far`.
fn xor_ordered() -> (Keypair, Keypair, Keypair) {
    let target = Keypair::generate();
    let (a, b) = (Keypair::generate(), Keypair::generate());
    let t = target.identity().kad_id();
    if a.identity().kad_id().xor(&t) < b.identity().kad_id().xor(&t) {
        (b, a, target)
    } else {
        (a, b, target)
    }
}

#[tokio::test]
async fn join_opens_a_connection_to_a_peer_met_through_the_seed() {
    init_tracing();
    let (seed_key, near_key, joiner_key) = xor_ordered();
    let network = MemoryNetwork::new();
    let seed = spawn(&network, seed_key, NodeConfig::default()).await;
    let near = spawn(&network, near_key, NodeConfig::default()).await;
    let joiner = spawn(&network, joiner_key, NodeConfig::default()).await;
    link(&seed.node, &near.node).await;
    assert_eq!(network.open_links().await, 1);

    let mut joiner_events = joiner.node.events();
    let mut near_events = near.node.events();
    link(&seed.node, &joiner.node).await;

    // The seed relays the join to `near`, which offers over the overlay.
    wait_for(&mut joiner_events, NodeEvent::Connected(near.node.identity().clone())).await;
    wait_for(&mut near_events, NodeEvent::Connected(joiner.node.identity().clone())).await;
    assert_eq!(network.open_links().await, 3);
    let snap = joiner.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.open_connections, 2);
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn encoded(kind: MessageKind) -> String {
    encode_body(&Body::new(kind, DEFAULT_MESSAGE_TTL, now())).expect("encode failed")
}

fn data_for(dest: &PeerIdentity, payload: &[u8]) -> String {
    encoded(MessageKind::Data {
        target: dest.kad_id(),
        to: dest.encoded().to_string(),
        data: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
    })
}

/// A peer that negotiates with a node like any other, then builds and reads
/// envelopes by hand.
struct ManualPeer {
    keypair: Keypair,
    transport: MemoryTransport,
    events: mpsc::Receiver<TransportEvent>,
    registry: IdentityRegistry,
    conn: ConnectionId,
}

impl ManualPeer {
    async fn connect(network: &MemoryNetwork, node: &Node) -> Self {
        let keypair = Keypair::generate();
        let (transport, events) = network.endpoint().await;
        let mut node_events = node.events();

        let conn = transport.open_session().await.expect("open_session failed");
        let offer = transport
            .local_description(conn, SdpKind::Offer)
            .await
            .expect("offer failed");
        let offer = sign_description(&keypair, &offer).expect("signing failed");
        let answer = node.accept_offer(offer).await.expect("accept failed");
        transport
            .set_remote_description(conn, &answer)
            .await
            .expect("answer failed");
        wait_for(&mut node_events, NodeEvent::Connected(keypair.identity().clone())).await;

        let registry = IdentityRegistry::new(keypair.identity().clone());
        Self {
            keypair,
            transport,
            events,
            registry,
            conn,
        }
    }

    fn identity(&self) -> &PeerIdentity {
        self.keypair.identity()
    }

    async fn send(&self, wire: &WireEnvelope) {
        let bytes = wire.to_bytes().expect("serialize failed");
        self.transport.send(self.conn, bytes).await.expect("send failed");
    }

    /// Next envelope whose body matches `wanted`; anything else is skipped.
    async fn recv(&mut self, wanted: impl Fn(&MessageKind) -> bool) -> VerifiedEnvelope {
        loop {
            let event = timeout(TEST_TIMEOUT, self.events.recv())
                .await
                .expect("no message in time")
                .expect("transport closed");
            let TransportEvent::Message(_, bytes) = event else {
                continue;
            };
            let verified = envelope::verify(
                &bytes,
                &self.keypair,
                &mut self.registry,
                &EnvelopeLimits::default(),
                now(),
            )
            .expect("node sent an invalid envelope");
            if wanted(&verified.body.kind) {
                return verified;
            }
        }
    }
}

#[tokio::test]
async fn source_route_without_open_hop_falls_back_to_distance_routing() {
    init_tracing();
    let (relay_key, near_key, dest_key) = xor_ordered();
    let network = MemoryNetwork::new();
    let relay = spawn(&network, relay_key, NodeConfig::default()).await;
    let near = spawn(&network, near_key, NodeConfig::default()).await;
    let dest = spawn(&network, dest_key, NodeConfig::default()).await;
    link(&relay.node, &near.node).await;
    link(&near.node, &dest.node).await;
    let mut inbox = dest.node.messages().await.expect("receiver taken");

    let sender = ManualPeer::connect(&network, &relay.node).await;
    let dest_id = dest.node.identity().clone();
    let relay_id = relay.node.identity().clone();
    // Neither `dest` nor `gone` is open at the relay; `near` makes XOR progress.
    let gone = Keypair::generate().identity().clone();
    let route = [dest_id.clone(), gone, relay_id.clone()];
    let mut wire = originate(&sender.keypair, data_for(&dest_id, b"around the gap"), Some(&route));
    extend(&sender.keypair, &mut wire, &relay_id);
    sender.send(&wire).await;

    let received = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("no data in time")
        .expect("inbox closed");
    assert_eq!(received.from, *sender.identity());
    assert_eq!(received.data, b"around the gap");
}

#[tokio::test]
async fn unroutable_source_route_is_reported_along_the_back_path() {
    init_tracing();
    let network = MemoryNetwork::new();
    let relay = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let mut sender = ManualPeer::connect(&network, &relay.node).await;

    let relay_id = relay.node.identity().clone();
    let nowhere = Keypair::generate().identity().clone();
    let route = [nowhere.clone(), relay_id.clone()];
    let mut wire = originate(&sender.keypair, data_for(&nowhere, b"lost"), Some(&route));
    extend(&sender.keypair, &mut wire, &relay_id);
    sender.send(&wire).await;

    let notice = sender
        .recv(|k| matches!(k, MessageKind::BrokenPath { .. }))
        .await;
    assert_eq!(notice.origin, relay_id);
    assert!(notice.forward_path.is_none());
    let MessageKind::BrokenPath { request } = &notice.body.kind else {
        unreachable!()
    };
    assert_eq!(*request, wire.body_sig);
}

#[tokio::test]
async fn broken_cached_path_is_dropped_and_data_resent_by_distance() {
    init_tracing();
    let network = MemoryNetwork::new();
    let node = spawn(&network, Keypair::generate(), NodeConfig::default()).await;
    let node_id = node.node.identity().clone();
    let mut inbox = node.node.messages().await.expect("receiver taken");
    let mut neighbor = ManualPeer::connect(&network, &node.node).await;

    // `behind` reaches the node through `neighbor`; the node caches that link.
    let behind = Keypair::generate();
    let mut hello = originate(&behind, data_for(&node_id, b"hello"), None);
    extend(&behind, &mut hello, neighbor.identity());
    extend(&neighbor.keypair, &mut hello, &node_id);
    neighbor.send(&hello).await;
    let received = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("no data in time")
        .expect("inbox closed");
    assert_eq!(received.from, *behind.identity());
    let snap = node.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.cached_paths, 1);

    node.node
        .send(behind.identity(), b"reply".to_vec())
        .await
        .expect("send failed");
    let routed = neighbor
        .recv(|k| matches!(k, MessageKind::Data { .. }))
        .await;
    assert_eq!(
        routed.forward_path,
        Some(vec![behind.identity().clone(), neighbor.identity().clone()])
    );

    let request = routed.request_id().to_string();
    let mut notice = originate(
        &neighbor.keypair,
        encoded(MessageKind::BrokenPath { request }),
        None,
    );
    extend(&neighbor.keypair, &mut notice, &node_id);
    neighbor.send(&notice).await;

    let resent = neighbor
        .recv(|k| matches!(k, MessageKind::Data { .. }))
        .await;
    assert!(resent.forward_path.is_none());
    assert_ne!(resent.request_id(), routed.request_id());
    let MessageKind::Data { to, .. } = &resent.body.kind else {
        unreachable!()
    };
    assert_eq!(to, behind.identity().encoded());
    let snap = node.node.snapshot().await.expect("snapshot failed");
    assert_eq!(snap.cached_paths, 0);
}
