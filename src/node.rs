//! # Overlay Node
//!
//! A [`Node`] is a cheap handle to a single actor task that owns every piece
//! of per-process state: the keypair, the identity registry, the routing
//! table, the connection registry, the path cache and the replay cache. All
//! mutation happens inside that task, one command or transport event at a
//! time, so a multi-step table change is never observed half-applied.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let (transport, events) = network.endpoint().await;
//! let node = Node::start(Keypair::generate(), NodeConfig::default(), transport, events)?;
//!
//! // Bootstrap collaborator: exchange one offer/answer out of band.
//! let (conn, offer) = seed.create_offer().await?;
//! let answer = node.accept_offer(offer).await?;
//! seed.apply_answer(conn, answer).await?;
//!
//! node.wait_for_connection(Duration::from_secs(5)).await?;
//! let found = node.lookup(target).await?;
//! ```
//!
//! ## Envelope Handling
//!
//! | Class | At a relay | At the destination |
//! |-------|-----------|--------------------|
//! | routable | next hop with strict XOR progress, skipping the back path | no such hop: handled here |
//! | forwardable | next open hop of the forward path, else distance routing, else `broken_path` | handled here |
//! | direct | never relayed | handled here |
//!
//! Replies travel source-routed along the request's back path.
//!
//! ## Timers
//!
//! Connect timeouts, claim grace periods and request timeouts are spawned
//! sleeps that send a command back carrying a generation or request id. A
//! timer whose generation went stale does nothing when it lands.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use lru::LruCache;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::connection::{
    Connection, ConnectionId, ConnectionRegistry, NegotiationAction, sign_description,
    verify_description,
};
use crate::crypto::BASE64;
use crate::envelope::{
    self, EnvelopeError, EnvelopeLimits, VerifiedEnvelope, encode_body, encode_sealed_body,
    next_hop_on_path, snip_loops,
};
use crate::identity::{IdentityRegistry, KadId, Keypair, PeerIdentity, now_secs};
use crate::messages::{Body, MessageKind, RouteClass, SdpKind, SessionDescription, WireEnvelope};
use crate::protocols::{Transport, TransportEvent};
use crate::routing::{ClaimChange, PathCache, RoutingTable, SiblingRange};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const DATA_CHANNEL_CAPACITY: usize = 1024;

/// Buckets refreshed per maintenance round.
const BUCKETS_PER_REFRESH: usize = 1;
/// Data sends along cached paths remembered for a `broken_path` retry.
const ROUTED_SENDS_CAPACITY: usize = 256;

/// Lifecycle events for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected(PeerIdentity),
    Disconnected(PeerIdentity),
}

/// Application payload delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub from: PeerIdentity,
    pub data: Vec<u8>,
}

/// Answer to a [`Node::lookup`].
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    /// The node that found itself responsible for the target.
    pub closest: PeerIdentity,
    /// Its siblings at the time of the answer.
    pub siblings: Vec<PeerIdentity>,
    /// Hops the answer travelled.
    pub hops: usize,
}

/// Diagnostics view of the routing state.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub identity: PeerIdentity,
    /// Siblings in id order.
    pub siblings: Vec<PeerIdentity>,
    pub range: SiblingRange,
    /// `(bucket index, entries)` for non-empty buckets.
    pub buckets: Vec<(usize, usize)>,
    pub table_len: usize,
    pub open_connections: usize,
    pub connections: usize,
    pub known_identities: usize,
    pub cached_paths: usize,
    pub pending_requests: usize,
}

enum Command {
    // Bootstrap insertion point
    CreateOffer(oneshot::Sender<Result<(ConnectionId, SessionDescription)>>),
    AcceptOffer(SessionDescription, oneshot::Sender<Result<SessionDescription>>),
    ApplyAnswer(ConnectionId, SessionDescription, oneshot::Sender<Result<()>>),

    // Application
    Lookup(KadId, oneshot::Sender<Result<LookupOutcome>>),
    Send(PeerIdentity, Vec<u8>, oneshot::Sender<Result<()>>),
    Ping(PeerIdentity, oneshot::Sender<Result<Duration>>),
    Snapshot(oneshot::Sender<RoutingSnapshot>),

    // Timers
    ConnectTimeout(ConnectionId, u64),
    ClaimGrace(ConnectionId, u64),
    RequestTimeout(String),
    PingTimeout(u64),

    // Maintenance
    RefreshBuckets,
    SweepIdentities,

    Quit,
}

pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    identity: PeerIdentity,
    events: broadcast::Sender<NodeEvent>,
    data_rx: TakeOnce<ReceivedData>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .finish()
    }
}

impl Node {
    /// Spawn the node actor on the current runtime.
    pub fn start<T: Transport>(
        keypair: Keypair,
        config: NodeConfig,
        transport: T,
        transport_rx: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self> {
        config.validate().context("invalid node configuration")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let identity = keypair.identity().clone();

        let seen_cap = NonZeroUsize::new(config.seen_cache_size).unwrap_or(NonZeroUsize::MIN);
        let actor = NodeActor {
            identities: IdentityRegistry::new(identity.clone()),
            routing: RoutingTable::new(identity.clone(), config.k, config.siblings),
            connections: ConnectionRegistry::new(),
            paths: PathCache::new(config.path_cache_size),
            seen: LruCache::new(seen_cap),
            routed_sends: LruCache::new(
                NonZeroUsize::new(ROUTED_SENDS_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            lookups: HashMap::new(),
            pings: HashMap::new(),
            limits: config.envelope_limits(),
            joined: false,
            keypair,
            config: config.clone(),
            transport: Arc::new(transport),
            transport_rx,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            events: events.clone(),
            data_tx,
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            identity,
            events,
            data_rx: Mutex::new(Some(data_rx)),
        };
        node.spawn_periodic(config.bucket_refresh_interval, || Command::RefreshBuckets);
        node.spawn_periodic(config.identity_sweep_interval, || Command::SweepIdentities);
        info!(identity = %node.identity.short(), "node started");
        Ok(node)
    }

    fn spawn_periodic(&self, every: Duration, make: fn() -> Command) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("node has stopped"))?;
        rx.await.map_err(|_| anyhow!("node dropped the request"))
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Payloads addressed to this node. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<ReceivedData>> {
        self.data_rx
            .lock()
            .await
            .take()
            .context("message receiver already taken")
    }

    /// Open a session and return its signed offer, for out-of-band delivery.
    pub async fn create_offer(&self) -> Result<(ConnectionId, SessionDescription)> {
        self.request(Command::CreateOffer).await?
    }

    /// Answer an offer received out of band.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.request(|tx| Command::AcceptOffer(offer, tx)).await?
    }

    /// Complete a session started with [`Node::create_offer`].
    pub async fn apply_answer(&self, conn: ConnectionId, answer: SessionDescription) -> Result<()> {
        self.request(|tx| Command::ApplyAnswer(conn, answer, tx)).await?
    }

    /// Route a lookup toward `target` and wait for the responsible node's answer.
    pub async fn lookup(&self, target: KadId) -> Result<LookupOutcome> {
        self.request(|tx| Command::Lookup(target, tx)).await?
    }

    /// Send `data` to `to`, sealed when `to` has a key-agreement key.
    pub async fn send(&self, to: &PeerIdentity, data: Vec<u8>) -> Result<()> {
        self.request(|tx| Command::Send(to.clone(), data, tx)).await?
    }

    /// Round trip to a directly connected peer.
    pub async fn ping(&self, peer: &PeerIdentity) -> Result<Duration> {
        self.request(|tx| Command::Ping(peer.clone(), tx)).await?
    }

    pub async fn snapshot(&self) -> Result<RoutingSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Wait until at least one connection is open.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut events = self.events.subscribe();
        if self.snapshot().await?.open_connections > 0 {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::Connected(_)) => return Ok(()),
                    Ok(NodeEvent::Disconnected(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => bail!("node has stopped"),
                }
            }
        })
        .await
        .map_err(|_| anyhow!("no connection within {timeout:?}"))?
    }

    /// Stop the actor. Open connections are closed.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor<T: Transport> {
    keypair: Keypair,
    config: NodeConfig,
    limits: EnvelopeLimits,
    identities: IdentityRegistry,
    routing: RoutingTable,
    connections: ConnectionRegistry,
    paths: PathCache,
    /// BLAKE3 of every processed `body_sig`.
    seen: LruCache<[u8; 32], ()>,
    /// Request id of data sent along a cached path, to its destination and payload.
    routed_sends: LruCache<String, (PeerIdentity, Vec<u8>)>,
    lookups: HashMap<String, oneshot::Sender<Result<LookupOutcome>>>,
    pings: HashMap<u64, (Instant, oneshot::Sender<Result<Duration>>)>,
    joined: bool,
    transport: Arc<T>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
    data_tx: mpsc::Sender<ReceivedData>,
}

fn data_kind(to: &PeerIdentity, data: &[u8]) -> MessageKind {
    MessageKind::Data {
        target: to.kad_id(),
        to: to.encoded().to_string(),
        data: Some(BASE64.encode(data)),
    }
}

/// Bound a transport call.
async fn bounded<R>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<R>>,
) -> Result<R> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("{what} timed out after {limit:?}"))?
}

impl<T: Transport> NodeActor<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = self.transport_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!("transport event stream ended");
                        break;
                    }
                },
            }
        }
        for conn in self.connections.ids() {
            self.teardown(conn, true, "shutdown").await;
        }
        info!(identity = %self.local().short(), "node stopped");
    }

    fn local(&self) -> &PeerIdentity {
        self.keypair.identity()
    }

    fn schedule(&self, delay: Duration, cmd: Command) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(cmd).await;
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer().await);
            }
            Command::AcceptOffer(offer, reply) => {
                let _ = reply.send(self.accept_offer(offer).await);
            }
            Command::ApplyAnswer(conn, answer, reply) => {
                let _ = reply.send(self.apply_answer(conn, answer).await);
            }
            Command::Lookup(target, reply) => {
                match self.originate_routable(MessageKind::Lookup { target }, None).await {
                    Ok(request) => {
                        self.schedule(
                            self.config.request_timeout,
                            Command::RequestTimeout(request.clone()),
                        );
                        self.lookups.insert(request, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(anyhow!("lookup failed: {e}")));
                    }
                }
            }
            Command::Send(to, data, reply) => {
                let _ = reply.send(self.send_data(to, data).await);
            }
            Command::Ping(peer, reply) => self.send_ping(peer, reply).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ConnectTimeout(conn, generation) => {
                if self
                    .connections
                    .get(conn)
                    .is_some_and(|c| c.connect_timer_expired(generation))
                {
                    self.teardown(conn, false, "connect timeout").await;
                }
            }
            Command::ClaimGrace(conn, generation) => {
                if self
                    .connections
                    .get(conn)
                    .is_some_and(|c| c.grace_expired(generation))
                {
                    self.teardown(conn, true, "unclaimed").await;
                }
            }
            Command::RequestTimeout(request) => {
                if let Some(reply) = self.lookups.remove(&request) {
                    let _ = reply.send(Err(anyhow!("lookup timed out")));
                }
            }
            Command::PingTimeout(nonce) => {
                if let Some((_, reply)) = self.pings.remove(&nonce) {
                    let _ = reply.send(Err(anyhow!("ping timed out")));
                }
            }
            Command::RefreshBuckets => self.refresh_buckets().await,
            Command::SweepIdentities => {
                let dropped = self.identities.sweep();
                if dropped > 0 {
                    trace!(dropped, remaining = self.identities.len(), "swept identity registry");
                }
            }
            Command::Quit => {}
        }
    }

    fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            identity: self.local().clone(),
            siblings: self.routing.siblings().cloned().collect(),
            range: self.routing.sibling_range(),
            buckets: self.routing.bucket_occupancy(),
            table_len: self.routing.len(),
            open_connections: self.connections.open_count(),
            connections: self.connections.len(),
            known_identities: self.identities.len(),
            cached_paths: self.paths.len(),
            pending_requests: self.lookups.len() + self.pings.len(),
        }
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    async fn new_connection(&mut self, remote: Option<PeerIdentity>) -> Result<ConnectionId> {
        let limit = self.config.negotiation_timeout;
        let id = bounded(limit, "open_session", self.transport.open_session()).await?;
        let mut conn = Connection::new(id, remote);
        let generation = conn.arm_connect_timer();
        if let Err(e) = self.connections.insert(conn) {
            self.close_session(id).await;
            return Err(e.into());
        }
        self.schedule(
            self.config.connect_timeout,
            Command::ConnectTimeout(id, generation),
        );
        Ok(id)
    }

    async fn produce_offer(&mut self, conn: ConnectionId) -> Result<SessionDescription> {
        self.connections
            .get_mut(conn)
            .ok_or_else(|| anyhow!("unknown connection {conn}"))?
            .begin_offer()?;
        let limit = self.config.negotiation_timeout;
        let offer = bounded(
            limit,
            "local_description",
            self.transport.local_description(conn, SdpKind::Offer),
        )
        .await;
        let Some(c) = self.connections.get_mut(conn) else {
            bail!("connection {conn} vanished");
        };
        match offer {
            Ok(offer) => {
                c.local_description_set(SdpKind::Offer);
                Ok(sign_description(&self.keypair, &offer)?)
            }
            Err(e) => {
                c.offer_failed();
                Err(e)
            }
        }
    }

    async fn produce_answer(
        &mut self,
        conn: ConnectionId,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        let limit = self.config.negotiation_timeout;
        bounded(
            limit,
            "set_remote_description",
            self.transport.set_remote_description(conn, offer),
        )
        .await?;
        let answer = bounded(
            limit,
            "local_description",
            self.transport.local_description(conn, SdpKind::Answer),
        )
        .await?;
        if let Some(c) = self.connections.get_mut(conn) {
            c.local_description_set(SdpKind::Answer);
        }
        Ok(sign_description(&self.keypair, &answer)?)
    }

    /// Run perfect negotiation for a description proven to come from `remote`.
    /// Returns our answer when the description was an offer we applied.
    async fn apply_remote_description(
        &mut self,
        conn: ConnectionId,
        remote: &PeerIdentity,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let local = self.local().clone();
        let action = self
            .connections
            .get_mut(conn)
            .ok_or_else(|| anyhow!("unknown connection {conn}"))?
            .on_remote_description(&local, remote, desc.kind);
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                self.teardown(conn, false, "negotiation refused").await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.connections.bind(conn, remote) {
            self.teardown(conn, false, "duplicate identity").await;
            return Err(e.into());
        }

        match action {
            NegotiationAction::IgnoreCollision | NegotiationAction::IgnoreStaleAnswer => {
                trace!(conn = %conn, peer = %remote.short(), ?action, "description ignored");
                Ok(None)
            }
            NegotiationAction::ApplyAnswer => {
                let limit = self.config.negotiation_timeout;
                let applied = bounded(
                    limit,
                    "set_remote_description",
                    self.transport.set_remote_description(conn, &desc),
                )
                .await;
                if let Err(e) = applied {
                    self.teardown(conn, false, "answer rejected").await;
                    return Err(e);
                }
                Ok(None)
            }
            NegotiationAction::ApplyOffer => match self.produce_answer(conn, &desc).await {
                Ok(answer) => Ok(Some(answer)),
                Err(e) => {
                    self.teardown(conn, false, "offer rejected").await;
                    Err(e)
                }
            },
        }
    }

    async fn create_offer(&mut self) -> Result<(ConnectionId, SessionDescription)> {
        let conn = self.new_connection(None).await?;
        match self.produce_offer(conn).await {
            Ok(offer) => Ok((conn, offer)),
            Err(e) => {
                self.teardown(conn, false, "offer failed").await;
                Err(e)
            }
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            bail!("expected an offer");
        }
        let remote = verify_description(&mut self.identities, &offer)?;
        if self.connections.id_for(&remote).is_some() {
            bail!("already connected to {}", remote.short());
        }
        let conn = self.new_connection(Some(remote.clone())).await?;
        self.apply_remote_description(conn, &remote, offer)
            .await?
            .ok_or_else(|| anyhow!("offer was not applied"))
    }

    async fn apply_answer(&mut self, conn: ConnectionId, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            bail!("expected an answer");
        }
        let remote = verify_description(&mut self.identities, &answer)?;
        self.apply_remote_description(conn, &remote, answer).await?;
        Ok(())
    }

    fn apply_claims(&mut self, changes: Vec<ClaimChange>) {
        for change in &changes {
            if let Some(timer) = self.connections.apply(change) {
                self.schedule(
                    self.config.claim_grace,
                    Command::ClaimGrace(timer.conn, timer.generation),
                );
            }
        }
    }

    async fn on_open(&mut self, conn: ConnectionId) {
        let Some(c) = self.connections.get_mut(conn) else {
            trace!(conn = %conn, "open for unknown connection");
            return;
        };
        if !c.mark_open() {
            return;
        }
        let Some(remote) = c.remote().cloned() else {
            warn!(conn = %conn, "connection opened without a proven identity");
            self.teardown(conn, false, "no identity").await;
            return;
        };

        let outcome = self.routing.insert(remote.clone());
        let retained = outcome.retained();
        self.apply_claims(outcome.changes);
        if let Some(generation) = self.connections.get_mut(conn).and_then(Connection::arm_grace) {
            self.schedule(
                self.config.claim_grace,
                Command::ClaimGrace(conn, generation),
            );
        }
        self.paths.forget(&remote);
        info!(
            peer = %remote.short(),
            conn = %conn,
            placement = ?outcome.placement,
            "connection open"
        );
        if !retained {
            debug!(peer = %remote.short(), "routing table has no room, not retaining");
        }
        let _ = self.events.send(NodeEvent::Connected(remote));

        if !self.joined {
            self.joined = true;
            self.join().await;
        }
    }

    async fn close_session(&self, conn: ConnectionId) {
        let limit = self.config.negotiation_timeout;
        if tokio::time::timeout(limit, self.transport.close(conn)).await.is_err() {
            warn!(conn = %conn, "close timed out after {limit:?}");
        }
    }

    /// Close or abandon `conn`. Safe to call any number of times.
    async fn teardown(&mut self, conn: ConnectionId, orderly: bool, reason: &'static str) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        let was_open = c.is_open();
        let changed = if orderly { c.mark_closed() } else { c.abandon() };
        if !changed {
            return;
        }
        let remote = c.remote().cloned();
        self.connections.remove(conn);
        self.close_session(conn).await;

        let Some(remote) = remote else {
            debug!(conn = %conn, reason, "connection dropped");
            return;
        };
        // Only open connections ever entered the routing table.
        if was_open {
            let changes = self.routing.remove(&remote);
            self.apply_claims(changes);
            info!(peer = %remote.short(), conn = %conn, reason, "connection closed");
            let _ = self.events.send(NodeEvent::Disconnected(remote));
        } else {
            debug!(peer = %remote.short(), conn = %conn, reason, "connection abandoned");
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(conn) => self.on_open(conn).await,
            TransportEvent::Closed(conn) => self.teardown(conn, true, "closed by peer").await,
            TransportEvent::Failed(conn, error) => {
                if self.connections.get(conn).is_some() {
                    warn!(conn = %conn, error = %error, "transport failure");
                }
                self.teardown(conn, false, "transport failure").await;
            }
            TransportEvent::Message(conn, bytes) => self.on_message(conn, bytes).await,
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn is_open(&self, peer: &PeerIdentity) -> bool {
        self.connections.is_open(peer)
    }

    /// An open neighbor whose kad id is exactly `target`, retained or not.
    fn open_neighbor_at(&self, target: &KadId) -> Option<PeerIdentity> {
        self.connections
            .open_peers()
            .find(|p| p.kad_id() == *target)
            .cloned()
    }

    /// Extend the back path for `next_hop` and hand the envelope to the transport.
    async fn send_wire(
        &mut self,
        mut wire: WireEnvelope,
        next_hop: &PeerIdentity,
    ) -> Result<(), EnvelopeError> {
        let conn = self
            .connections
            .id_for(next_hop)
            .filter(|_| self.is_open(next_hop))
            .ok_or(EnvelopeError::Unreachable)?;
        envelope::extend(&self.keypair, &mut wire, next_hop);
        let bytes = wire
            .to_bytes()
            .map_err(|_| EnvelopeError::Malformed("unserializable envelope"))?;
        let limit = self.config.negotiation_timeout;
        if let Err(e) = bounded(limit, "send", self.transport.send(conn, bytes)).await {
            warn!(peer = %next_hop.short(), conn = %conn, error = %e, "send failed");
            return Err(EnvelopeError::Unreachable);
        }
        Ok(())
    }

    fn body(&self, kind: MessageKind) -> Body {
        Body::new(kind, self.config.message_ttl, now_secs())
    }

    /// Originate a routable message. Returns its request id.
    async fn originate_routable(
        &mut self,
        kind: MessageKind,
        sealed_for: Option<&PeerIdentity>,
    ) -> Result<String, EnvelopeError> {
        let target = kind.target().ok_or(EnvelopeError::Malformed("not routable"))?;
        let body = self.body(kind);
        let encoded = match sealed_for {
            Some(recipient) => encode_sealed_body(&body, recipient, &["data"])?,
            None => encode_body(&body)?,
        };
        let wire = envelope::originate(&self.keypair, encoded, None);
        let request = wire.body_sig.clone();
        let next = self
            .open_neighbor_at(&target)
            .or_else(|| self.routing.closest_known(&target, &[]))
            .ok_or(EnvelopeError::Unreachable)?;
        trace!(
            kind = body.kind.type_name(),
            target = %target.short(),
            next = %next.short(),
            "originating"
        );
        self.send_wire(wire, &next).await?;
        Ok(request)
    }

    /// Originate a forwardable body along a destination-first route.
    async fn send_source_routed(
        &mut self,
        route: &[PeerIdentity],
        kind: MessageKind,
    ) -> Result<(), EnvelopeError> {
        let route = snip_loops(route);
        let encoded = encode_body(&self.body(kind))?;
        let wire = envelope::originate(&self.keypair, encoded, Some(&route));
        let local = self.local().clone();
        let next = next_hop_on_path(&route, &local, |p| self.is_open(p))
            .ok_or(EnvelopeError::Unreachable)?;
        self.send_wire(wire, &next).await
    }

    async fn reply(&mut self, request: &VerifiedEnvelope, kind: MessageKind) {
        let type_name = kind.type_name();
        if let Err(e) = self.send_source_routed(&request.reply_path(), kind).await {
            debug!(
                kind = type_name,
                origin = %request.origin.short(),
                error = %e,
                "reply failed"
            );
        }
    }

    async fn send_direct(&mut self, peer: &PeerIdentity, kind: MessageKind) -> Result<(), EnvelopeError> {
        let encoded = encode_body(&self.body(kind))?;
        let wire = envelope::originate(&self.keypair, encoded, None);
        self.send_wire(wire, peer).await
    }

    async fn send_data(&mut self, to: PeerIdentity, data: Vec<u8>) -> Result<()> {
        if to == *self.local() {
            bail!("cannot send to ourselves");
        }
        let kind = data_kind(&to, &data);
        let sealed_for = to.has_key_agreement().then_some(&to);

        // A sniffed route beats distance routing when we are not adjacent.
        let local = self.local().clone();
        if !self.is_open(&to)
            && let Some(route) = self.paths.route_to(&to, &local, |p| self.connections.is_open(p))
        {
            let body = self.body(kind.clone());
            let encoded = match sealed_for {
                Some(recipient) => encode_sealed_body(&body, recipient, &["data"])?,
                None => encode_body(&body)?,
            };
            let wire = envelope::originate(&self.keypair, encoded, Some(&route));
            let request = wire.body_sig.clone();
            if let Some(next) = next_hop_on_path(&route, &local, |p| self.is_open(p))
                && self.send_wire(wire, &next).await.is_ok()
            {
                trace!(to = %to.short(), hops = route.len(), "data sent along cached path");
                self.routed_sends.put(request, (to.clone(), data));
                return Ok(());
            }
        }

        self.originate_routable(kind, sealed_for)
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("send to {} failed: {e}", to.short()))
    }

    async fn send_ping(&mut self, peer: PeerIdentity, reply: oneshot::Sender<Result<Duration>>) {
        let nonce = OsRng.next_u64();
        match self.send_direct(&peer, MessageKind::Ping { nonce }).await {
            Ok(()) => {
                self.pings.insert(nonce, (Instant::now(), reply));
                self.schedule(self.config.request_timeout, Command::PingTimeout(nonce));
            }
            Err(e) => {
                let _ = reply.send(Err(anyhow!("ping {} failed: {e}", peer.short())));
            }
        }
    }

    async fn join(&mut self) {
        let target = self.local().kad_id();
        let kind = MessageKind::RequestConnect {
            target,
            bucket: None,
        };
        match self.originate_routable(kind, None).await {
            Ok(_) => debug!(identity = %self.local().short(), "join requested"),
            Err(e) => debug!(error = %e, "join request failed"),
        }
    }

    async fn refresh_buckets(&mut self) {
        if self.routing.is_empty() {
            return;
        }
        let stale = self
            .routing
            .buckets_to_refresh(self.config.bucket_refresh_interval, BUCKETS_PER_REFRESH);
        for idx in stale {
            let target = self.local().kad_id().random_in_bucket(idx);
            let kind = MessageKind::RequestConnect {
                target,
                bucket: u16::try_from(idx).ok(),
            };
            if let Err(e) = self.originate_routable(kind, None).await {
                debug!(bucket = idx, error = %e, "bucket refresh failed");
            }
            self.routing.mark_bucket_refreshed(idx);
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    async fn on_message(&mut self, conn: ConnectionId, bytes: Vec<u8>) {
        let Some(sender) = self
            .connections
            .get(conn)
            .filter(|c| c.is_open())
            .and_then(Connection::remote)
            .cloned()
        else {
            trace!(conn = %conn, "message on a connection that is not open");
            return;
        };

        let verified = match envelope::verify(
            &bytes,
            &self.keypair,
            &mut self.identities,
            &self.limits,
            now_secs(),
        ) {
            Ok(v) => v,
            Err(e) => {
                debug!(
                    peer = %sender.short(),
                    class = ?e.class(),
                    error = %e,
                    "dropping envelope"
                );
                return;
            }
        };
        if *verified.sender() != sender {
            debug!(
                peer = %sender.short(),
                claimed = %verified.sender().short(),
                "back path does not end at the sending connection"
            );
            return;
        }
        let key: [u8; 32] = blake3::hash(verified.request_id().as_bytes()).into();
        if self.seen.put(key, ()).is_some() {
            trace!(origin = %verified.origin.short(), "replayed envelope dropped");
            return;
        }
        self.paths.learn_from(&verified);

        let local = self.local().clone();
        if verified.is_in_transit(&local) {
            self.forward(verified).await;
            return;
        }
        match verified.body.class() {
            RouteClass::Routable => self.route(verified).await,
            RouteClass::Forwardable | RouteClass::Direct => self.deliver(verified).await,
        }
    }

    /// Continue a source route, falling back to distance routing.
    async fn forward(&mut self, verified: VerifiedEnvelope) {
        let local = self.local().clone();
        let path = verified.forward_path.as_deref().unwrap_or_default();
        let Some(destination) = path.first().cloned() else {
            return;
        };
        let next = next_hop_on_path(path, &local, |p| {
            self.is_open(p) && !verified.back_path.contains(p)
        })
        .or_else(|| {
            self.routing
                .next_hop(&destination.kad_id(), &verified.back_path)
        });

        let Some(next) = next else {
            debug!(
                destination = %destination.short(),
                kind = verified.body.kind.type_name(),
                "source route broken"
            );
            self.report_broken_path(&verified).await;
            return;
        };
        let kind = verified.body.kind.type_name();
        if let Err(e) = self.send_wire(verified.wire.clone(), &next).await {
            debug!(kind, next = %next.short(), error = %e, "forward failed");
            self.report_broken_path(&verified).await;
        }
    }

    async fn report_broken_path(&mut self, verified: &VerifiedEnvelope) {
        if matches!(verified.body.kind, MessageKind::BrokenPath { .. }) {
            return;
        }
        let request = verified.request_id().to_string();
        self.reply(verified, MessageKind::BrokenPath { request }).await;
    }

    /// Relay a routable message one step closer, or handle it here.
    async fn route(&mut self, verified: VerifiedEnvelope) {
        let Some(target) = verified.body.kind.target() else {
            return;
        };
        let next = self
            .open_neighbor_at(&target)
            .filter(|p| !verified.back_path.contains(p))
            .or_else(|| self.routing.next_hop(&target, &verified.back_path));
        if let Some(next) = next {
            let kind = verified.body.kind.type_name();
            match self.send_wire(verified.wire.clone(), &next).await {
                Ok(()) => {
                    trace!(kind, target = %target.short(), next = %next.short(), "relayed");
                    return;
                }
                Err(e) => debug!(kind, next = %next.short(), error = %e, "relay failed"),
            }
        }
        self.deliver(verified).await;
    }

    async fn deliver(&mut self, verified: VerifiedEnvelope) {
        match verified.body.kind.clone() {
            MessageKind::Lookup { target } => {
                if !self.routing.is_responsible(&target) {
                    debug!(target = %target.short(), "answering lookup outside sibling range");
                }
                let kind = MessageKind::LookupResult {
                    target,
                    request: verified.request_id().to_string(),
                    closest: self.local().encoded().to_string(),
                    siblings: self
                        .routing
                        .siblings()
                        .map(|p| p.encoded().to_string())
                        .collect(),
                };
                self.reply(&verified, kind).await;
            }
            MessageKind::RequestConnect { target, bucket } => {
                trace!(
                    origin = %verified.origin.short(),
                    target = %target.short(),
                    ?bucket,
                    "connect requested"
                );
                self.offer_connection(&verified).await;
            }
            MessageKind::Data { to, data, .. } => self.on_data(&verified, &to, data).await,
            MessageKind::LookupResult {
                request,
                closest,
                siblings,
                ..
            } => self.on_lookup_result(&verified, &request, &closest, &siblings),
            MessageKind::Connect { sdp } => self.on_connect(&verified, sdp).await,
            MessageKind::BrokenPath { request } => self.on_broken_path(&verified, &request).await,
            MessageKind::Ping { nonce } => {
                let sender = verified.sender().clone();
                if let Err(e) = self.send_direct(&sender, MessageKind::Pong { nonce }).await {
                    debug!(peer = %sender.short(), error = %e, "pong failed");
                }
            }
            MessageKind::Pong { nonce } => {
                if let Some((sent, reply)) = self.pings.remove(&nonce) {
                    let _ = reply.send(Ok(sent.elapsed()));
                }
            }
        }
    }

    async fn on_data(&mut self, verified: &VerifiedEnvelope, to: &str, data: Option<String>) {
        if to != self.local().encoded() {
            debug!(origin = %verified.origin.short(), "data for an identity we cannot reach");
            self.report_broken_path(verified).await;
            return;
        }
        let Some(payload) = data.and_then(|d| BASE64.decode(d).ok()) else {
            debug!(origin = %verified.origin.short(), "data without a readable payload");
            return;
        };
        let received = ReceivedData {
            from: verified.origin.clone(),
            data: payload,
        };
        if self.data_tx.try_send(received).is_err() {
            warn!(origin = %verified.origin.short(), "application not keeping up, dropping data");
        }
    }

    /// Drop the cached path that failed and resend by distance routing.
    async fn on_broken_path(&mut self, verified: &VerifiedEnvelope, request: &str) {
        let Some((to, data)) = self.routed_sends.pop(request) else {
            trace!(origin = %verified.origin.short(), "broken path for nothing we sent");
            return;
        };
        debug!(
            origin = %verified.origin.short(),
            to = %to.short(),
            "cached path broke, resending by distance"
        );
        self.paths.forget(&to);
        let sealed_for = to.has_key_agreement().then_some(&to);
        if let Err(e) = self.originate_routable(data_kind(&to, &data), sealed_for).await {
            debug!(to = %to.short(), error = %e, "resend failed");
        }
    }

    fn on_lookup_result(
        &mut self,
        verified: &VerifiedEnvelope,
        request: &str,
        closest: &str,
        siblings: &[String],
    ) {
        let Some(reply) = self.lookups.remove(request) else {
            trace!(origin = %verified.origin.short(), "unsolicited lookup result");
            return;
        };
        let outcome = self.identities.resolve(closest).map(|closest| {
            let siblings: Vec<PeerIdentity> = siblings
                .iter()
                .filter_map(|s| self.identities.resolve(s).ok())
                .collect();
            // Peer exchange: the responder's siblings are one hop past it.
            for sibling in &siblings {
                if sibling != self.keypair.identity() {
                    self.paths.learn(sibling, &closest);
                }
            }
            LookupOutcome {
                closest,
                siblings,
                hops: verified.back_path.len(),
            }
        });
        let _ = reply.send(outcome.map_err(|e| anyhow!("bad lookup result: {e}")));
    }

    /// Answer a `request_connect` with an offer if the origin would fit.
    async fn offer_connection(&mut self, request: &VerifiedEnvelope) {
        let origin = request.origin.clone();
        if self.connections.id_for(&origin).is_some() {
            trace!(origin = %origin.short(), "already connected or connecting");
            return;
        }
        if !self.routing.could_insert(&origin.kad_id()) {
            trace!(origin = %origin.short(), "origin would not be retained");
            return;
        }
        let conn = match self.new_connection(Some(origin.clone())).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "open_session failed");
                return;
            }
        };
        let offer = match self.produce_offer(conn).await {
            Ok(offer) => offer,
            Err(e) => {
                debug!(origin = %origin.short(), error = %e, "offer failed");
                self.teardown(conn, false, "offer failed").await;
                return;
            }
        };
        if let Err(e) = self
            .send_source_routed(&request.reply_path(), MessageKind::Connect { sdp: offer })
            .await
        {
            debug!(origin = %origin.short(), error = %e, "could not deliver offer");
            self.teardown(conn, false, "offer undeliverable").await;
        }
    }

    async fn on_connect(&mut self, verified: &VerifiedEnvelope, desc: SessionDescription) {
        let origin = verified.origin.clone();
        match verify_description(&mut self.identities, &desc) {
            Ok(proven) if proven == origin => {}
            Ok(proven) => {
                debug!(
                    origin = %origin.short(),
                    proven = %proven.short(),
                    "description proof does not match envelope origin"
                );
                return;
            }
            Err(e) => {
                debug!(origin = %origin.short(), error = %e, "bad description proof");
                return;
            }
        }

        let conn = match self.connections.id_for(&origin) {
            Some(conn) => {
                if self.is_open(&origin) {
                    trace!(origin = %origin.short(), "already connected, ignoring description");
                    return;
                }
                conn
            }
            None if desc.kind == SdpKind::Answer => {
                debug!(origin = %origin.short(), "answer for no pending connection");
                return;
            }
            None => {
                if !self.routing.could_insert(&origin.kad_id()) {
                    trace!(origin = %origin.short(), "offer from a peer we would not retain");
                    return;
                }
                match self.new_connection(Some(origin.clone())).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "open_session failed");
                        return;
                    }
                }
            }
        };

        match self.apply_remote_description(conn, &origin, desc).await {
            Ok(Some(answer)) => {
                let kind = MessageKind::Connect { sdp: answer };
                if let Err(e) = self.send_source_routed(&verified.reply_path(), kind).await {
                    debug!(origin = %origin.short(), error = %e, "could not deliver answer");
                    self.teardown(conn, false, "answer undeliverable").await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(origin = %origin.short(), error = %e, "negotiation failed"),
        }
    }
}
