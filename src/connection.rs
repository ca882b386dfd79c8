//! # Connection Lifecycle
//!
//! One [`Connection`] per transport session, plus the [`ConnectionRegistry`]
//! that maps identities to their single live connection.
//!
//! ## States
//!
//! ```text
//! new ──► connecting ──► open ──► closed
//!  │           │           │
//!  └───────────┴───────────┴────► abandoned   (teardown, timeout, failure)
//! ```
//!
//! ## Perfect Negotiation
//!
//! Both sides may send an offer at the same time. An incoming offer collides
//! when we are making an offer ourselves or our signaling state is not
//! stable. On a collision only the polite side (smaller kad id) applies the
//! remote offer; the impolite side ignores it and waits for the answer to its
//! own. An answer that arrives while stable answers nothing and is ignored.
//!
//! ## Identity Binding
//!
//! Every description carries a proof of identity in its `s=` line:
//! `s=<encoded identity>.<signature over the DTLS fingerprint bytes>`.
//! Once verified, the connection is bound to that identity for good: a later
//! description for a different identity, or for ourselves, is refused, and
//! the registry refuses a second live connection for an identity.
//!
//! ## Claims
//!
//! [`ClaimCounter`] is the reference count by which routing structures keep
//! a connection. Reaching zero arms a grace timer identified by a generation
//! number; a claim, or a newer arming, makes older generations moot so a late
//! timer can never tear down a connection that was re-claimed.

use std::collections::HashMap;
use std::fmt;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::crypto::SignatureError;
use crate::identity::{IdentityError, IdentityRegistry, Keypair, PeerIdentity, polite};
use crate::messages::{SdpKind, SessionDescription};
use crate::routing::ClaimChange;

/// A connection that has not opened after this long is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An unclaimed connection survives this long before it is closed.
pub const CLAIM_GRACE: Duration = Duration::from_secs(5);

const FINGERPRINT_PREFIX: &str = "a=fingerprint:";
const SESSION_NAME_PREFIX: &str = "s=";

/// Transport-assigned handle for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Open,
    Closed,
    Abandoned,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Abandoned)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Decision for a received description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Apply the remote offer, then produce and send an answer.
    ApplyOffer,
    /// Apply the remote answer. Negotiation is complete.
    ApplyAnswer,
    /// Impolite side of a collision: our own offer wins.
    IgnoreCollision,
    /// An answer while stable: nothing to answer.
    IgnoreStaleAnswer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The connection is closed or abandoned.
    Closed,
    /// The description claims our own identity.
    SelfConnection,
    /// The description claims a different identity than the one bound.
    IdentityChanged,
    /// Another live connection is already bound to this identity.
    DuplicateIdentity(ConnectionId),
    /// No `a=fingerprint:` line to sign or verify.
    MissingFingerprint,
    /// No `s=<identity>.<signature>` proof.
    MissingProof,
    BadIdentity(IdentityError),
    BadProof(SignatureError),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::Closed => write!(f, "connection is closed"),
            NegotiationError::SelfConnection => write!(f, "refusing to connect to ourselves"),
            NegotiationError::IdentityChanged => {
                write!(f, "description is for a different identity than the bound one")
            }
            NegotiationError::DuplicateIdentity(existing) => {
                write!(f, "identity already bound to {existing}")
            }
            NegotiationError::MissingFingerprint => write!(f, "description has no fingerprint"),
            NegotiationError::MissingProof => write!(f, "description has no identity proof"),
            NegotiationError::BadIdentity(e) => write!(f, "identity proof: {e}"),
            NegotiationError::BadProof(e) => write!(f, "identity proof: {e}"),
        }
    }
}

impl std::error::Error for NegotiationError {}

// ============================================================================
// Claim Counter
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ClaimCounter {
    count: u32,
    generation: u64,
    armed: bool,
}

impl ClaimCounter {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn claim(&mut self) {
        self.count = self.count.saturating_add(1);
        self.disarm();
    }

    /// Decrement. Returns the timer generation to schedule when the count
    /// reaches zero. A release at zero is ignored and reported as `None`.
    pub fn release(&mut self) -> Option<u64> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        self.arm()
    }

    /// Arm the grace timer if unclaimed and not already armed.
    pub fn arm(&mut self) -> Option<u64> {
        if self.count > 0 || self.armed {
            return None;
        }
        self.generation += 1;
        self.armed = true;
        Some(self.generation)
    }

    pub fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            self.generation += 1;
        }
    }

    /// True only for the current, still-armed generation of an unclaimed counter.
    pub fn should_evict(&self, generation: u64) -> bool {
        self.armed && self.count == 0 && generation == self.generation
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote: Option<PeerIdentity>,
    state: ConnectionState,
    signaling: SignalingState,
    making_offer: bool,
    claims: ClaimCounter,
    connect_generation: u64,
    created_at: Instant,
    opened_at: Option<Instant>,
}

impl Connection {
    pub fn new(id: ConnectionId, remote: Option<PeerIdentity>) -> Self {
        Self {
            id,
            remote,
            state: ConnectionState::New,
            signaling: SignalingState::Stable,
            making_offer: false,
            claims: ClaimCounter::default(),
            connect_generation: 0,
            created_at: Instant::now(),
            opened_at: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> Option<&PeerIdentity> {
        self.remote.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn signaling(&self) -> SignalingState {
        self.signaling
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn claims(&self) -> &ClaimCounter {
        &self.claims
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn open_for(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }

    /// Start producing a local offer.
    pub fn begin_offer(&mut self) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        self.making_offer = true;
        if self.state == ConnectionState::New {
            self.state = ConnectionState::Connecting;
        }
        Ok(())
    }

    /// The transport produced our local description of `kind`.
    pub fn local_description_set(&mut self, kind: SdpKind) {
        self.making_offer = false;
        self.signaling = match kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
    }

    /// Producing the local offer failed or timed out.
    pub fn offer_failed(&mut self) {
        self.making_offer = false;
    }

    /// Decide what to do with a description proven to come from `remote`.
    pub fn on_remote_description(
        &mut self,
        local: &PeerIdentity,
        remote: &PeerIdentity,
        kind: SdpKind,
    ) -> Result<NegotiationAction, NegotiationError> {
        if self.state.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        if remote == local {
            return Err(NegotiationError::SelfConnection);
        }
        match &self.remote {
            Some(bound) if bound != remote => return Err(NegotiationError::IdentityChanged),
            Some(_) => {}
            None => self.remote = Some(remote.clone()),
        }

        let offer_collision = kind == SdpKind::Offer
            && (self.making_offer || self.signaling != SignalingState::Stable);
        if offer_collision && !polite(local, remote) {
            trace!(conn = %self.id, peer = %remote.short(), "ignoring colliding offer");
            return Ok(NegotiationAction::IgnoreCollision);
        }

        match kind {
            SdpKind::Answer if self.signaling != SignalingState::HaveLocalOffer => {
                Ok(NegotiationAction::IgnoreStaleAnswer)
            }
            SdpKind::Answer => {
                self.signaling = SignalingState::Stable;
                Ok(NegotiationAction::ApplyAnswer)
            }
            SdpKind::Offer => {
                if offer_collision {
                    debug!(conn = %self.id, peer = %remote.short(), "rolling back local offer");
                    self.making_offer = false;
                }
                self.signaling = SignalingState::HaveRemoteOffer;
                if self.state == ConnectionState::New {
                    self.state = ConnectionState::Connecting;
                }
                Ok(NegotiationAction::ApplyOffer)
            }
        }
    }

    /// Transport reports the session open. Cancels the connect timer.
    pub fn mark_open(&mut self) -> bool {
        match self.state {
            ConnectionState::New | ConnectionState::Connecting => {
                self.state = ConnectionState::Open;
                self.opened_at = Some(Instant::now());
                self.connect_generation += 1;
                true
            }
            _ => false,
        }
    }

    /// Orderly close. Returns false if already terminal.
    pub fn mark_closed(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Closed;
        self.claims.disarm();
        true
    }

    /// Teardown from any state. Returns true only on the first call, so the
    /// disconnect event fires exactly once.
    pub fn abandon(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Abandoned;
        self.making_offer = false;
        self.claims.disarm();
        self.connect_generation += 1;
        true
    }

    pub fn arm_connect_timer(&mut self) -> u64 {
        self.connect_generation += 1;
        self.connect_generation
    }

    pub fn connect_timer_expired(&self, generation: u64) -> bool {
        generation == self.connect_generation
            && matches!(self.state, ConnectionState::New | ConnectionState::Connecting)
    }

    pub fn claim(&mut self) {
        self.claims.claim();
    }

    pub fn release(&mut self) -> Option<u64> {
        if self.state.is_terminal() {
            return None;
        }
        self.claims.release()
    }

    /// Arm the grace timer for a freshly opened, still unclaimed connection.
    pub fn arm_grace(&mut self) -> Option<u64> {
        if self.state.is_terminal() {
            return None;
        }
        self.claims.arm()
    }

    pub fn grace_expired(&self, generation: u64) -> bool {
        !self.state.is_terminal() && self.claims.should_evict(generation)
    }
}

// ============================================================================
// Identity Proof in Session Descriptions
// ============================================================================

/// Concatenated bytes of every `a=fingerprint:<algo> AA:BB:...` line.
fn fingerprint_bytes(sdp: &str) -> Result<Vec<u8>, NegotiationError> {
    let mut bytes = Vec::new();
    for line in sdp.lines() {
        let Some(rest) = line.strip_prefix(FINGERPRINT_PREFIX) else {
            continue;
        };
        let Some((_, hex_pairs)) = rest.split_once(' ') else {
            continue;
        };
        for pair in hex_pairs.trim().split(':') {
            let byte = hex::decode(pair).map_err(|_| NegotiationError::MissingFingerprint)?;
            if byte.len() != 1 {
                return Err(NegotiationError::MissingFingerprint);
            }
            bytes.extend(byte);
        }
    }
    if bytes.is_empty() {
        return Err(NegotiationError::MissingFingerprint);
    }
    Ok(bytes)
}

/// Bytes covered by the `s=` proof: the full encoded identity, then the
/// fingerprint bytes. Binding the encoded form keeps the key-agreement half
/// from being rewritten in transit.
fn proof_payload(encoded: &str, fingerprint: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(encoded.len() + fingerprint.len());
    payload.extend_from_slice(encoded.as_bytes());
    payload.extend_from_slice(fingerprint);
    payload
}

/// Replace the `s=` line with `s=<identity>.<signature over identity || fingerprint>`.
pub fn sign_description(
    keypair: &Keypair,
    desc: &SessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let fingerprint = fingerprint_bytes(&desc.sdp)?;
    let encoded = keypair.identity().encoded();
    let proof = format!(
        "{SESSION_NAME_PREFIX}{encoded}.{}",
        keypair.sign_encoded(&proof_payload(encoded, &fingerprint))
    );

    let mut lines: Vec<&str> = desc.sdp.lines().collect();
    match lines.iter().position(|l| l.starts_with(SESSION_NAME_PREFIX)) {
        Some(pos) => lines[pos] = &proof,
        None => {
            let after_origin = lines
                .iter()
                .position(|l| l.starts_with("o="))
                .map_or(lines.len().min(1), |p| p + 1);
            lines.insert(after_origin, &proof);
        }
    }
    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    Ok(SessionDescription {
        kind: desc.kind,
        sdp,
    })
}

/// Verify the identity proof and return the proven identity.
pub fn verify_description(
    registry: &mut IdentityRegistry,
    desc: &SessionDescription,
) -> Result<PeerIdentity, NegotiationError> {
    let proof = desc
        .sdp
        .lines()
        .find_map(|l| l.strip_prefix(SESSION_NAME_PREFIX))
        .ok_or(NegotiationError::MissingProof)?;
    let (encoded, signature) = proof
        .split_once('.')
        .ok_or(NegotiationError::MissingProof)?;
    let identity = registry
        .resolve(encoded)
        .map_err(NegotiationError::BadIdentity)?;
    let fingerprint = fingerprint_bytes(&desc.sdp)?;
    identity
        .verify_encoded(signature, &proof_payload(encoded, &fingerprint))
        .map_err(NegotiationError::BadProof)?;
    Ok(identity)
}

// ============================================================================
// Connection Registry
// ============================================================================

/// All connections, and the identity → connection binding.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<PeerIdentity, ConnectionId>,
}

/// A grace timer the caller must schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceTimer {
    pub conn: ConnectionId,
    pub generation: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `conn`. Refused, and not tracked, when its identity is already
    /// held by another live connection.
    pub fn insert(&mut self, conn: Connection) -> Result<(), NegotiationError> {
        let id = conn.id();
        if let Some(remote) = conn.remote() {
            let remote = remote.clone();
            self.bind(id, &remote)?;
        }
        self.connections.insert(id, conn);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn id_for(&self, peer: &PeerIdentity) -> Option<ConnectionId> {
        self.by_identity.get(peer).copied()
    }

    pub fn for_identity_mut(&mut self, peer: &PeerIdentity) -> Option<&mut Connection> {
        let id = self.by_identity.get(peer)?;
        self.connections.get_mut(id)
    }

    pub fn is_open(&self, peer: &PeerIdentity) -> bool {
        self.id_for(peer)
            .and_then(|id| self.connections.get(&id))
            .is_some_and(Connection::is_open)
    }

    /// Bind `id` to `peer`. Refused while another live connection holds `peer`.
    pub fn bind(&mut self, id: ConnectionId, peer: &PeerIdentity) -> Result<(), NegotiationError> {
        if let Some(existing) = self.by_identity.get(peer).copied()
            && existing != id
        {
            let live = self
                .connections
                .get(&existing)
                .is_some_and(|c| !c.state().is_terminal());
            if live {
                return Err(NegotiationError::DuplicateIdentity(existing));
            }
        }
        self.by_identity.insert(peer.clone(), id);
        Ok(())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Some(remote) = conn.remote()
            && self.by_identity.get(remote) == Some(&id)
        {
            self.by_identity.remove(remote);
        }
        Some(conn)
    }

    /// Apply one routing-table claim delta. Returns a grace timer to schedule
    /// when a release brought the count to zero.
    pub fn apply(&mut self, change: &ClaimChange) -> Option<GraceTimer> {
        match change {
            ClaimChange::Claim(peer) => {
                if let Some(conn) = self.for_identity_mut(peer) {
                    conn.claim();
                }
                None
            }
            ClaimChange::Release(peer) => {
                let conn = self.for_identity_mut(peer)?;
                let generation = conn.release()?;
                Some(GraceTimer {
                    conn: conn.id(),
                    generation,
                })
            }
        }
    }

    pub fn open_peers(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.connections
            .values()
            .filter(|c| c.is_open())
            .filter_map(Connection::remote)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_open()).count()
    }
}
