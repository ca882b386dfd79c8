//! # Envelope Protocol
//!
//! Builds, extends and verifies signed envelopes.
//!
//! ## Back Path
//!
//! Every hop that sends an envelope prepends one entry before handing it to
//! the transport:
//!
//! ```text
//! entry = "<hop identity>.<b64 sign_by_hop(next_hop_encoded || body_sig)>"
//! ```
//!
//! so the wire list is most-recent-first and the last entry belongs to the
//! origin. Each signature names the hop it was handed to, which chains the
//! entries: a receiver checks entry `i` against entry `i - 1` (or against
//! itself for the newest entry).
//!
//! No later hop signs the origin's own entry, so `body_sig` covers the
//! origin's full encoded identity as well as the body:
//!
//! ```text
//! body_sig = b64 sign_by_origin(origin_encoded || body)
//! ```
//!
//! Without it a relay could swap the key-agreement half of the origin entry
//! and still present a valid chain.
//!
//! ## Verification Order
//!
//! 1. Size limit, JSON shape, back-path length
//! 2. Back path: identities resolved, cycles rejected, signatures checked from
//!    the origin's entry toward the newest one
//! 3. `body_sig` by the origin over its encoded identity and the literal body bytes
//! 4. `forward_sig` by the origin over the literal forward path, loop check
//! 5. Body parsed (sealed fields opened first), class requirements and expiration
//!
//! Everything is local: a failure drops the envelope and nothing else.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};

use crate::crypto::{CryptoError, SignatureError};
use crate::identity::{IdentityError, IdentityRegistry, Keypair, PeerIdentity};
use crate::messages::{
    BACK_PATH_SEPARATOR, Body, ENCRYPTED_FIELD, FORWARD_PATH_SEPARATOR, MAX_BACK_PATH_LEN,
    MAX_ENVELOPE_SIZE, MAX_FORWARD_PATH_LEN, RouteClass, WireEnvelope,
};

/// Expirations further ahead than this are not believable.
pub const DEFAULT_MAX_EXPIRATION_AHEAD_SECS: u64 = 30 * 60;

// ============================================================================
// Errors
// ============================================================================

/// Where a signature check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSite {
    /// Back-path entry, wire index (0 = newest).
    BackPath(usize),
    Body,
    ForwardPath,
}

/// Coarse rejection classes, one per failure kind an operator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectClass {
    Malformed,
    Signature,
    Expired,
    Cycle,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Missing or ill-typed field, or a limit exceeded.
    Malformed(&'static str),
    /// An identity string in the envelope did not parse.
    Identity(IdentityError),
    /// A sealed field could not be opened.
    Sealed(CryptoError),
    Signature {
        site: SignatureSite,
        source: SignatureError,
    },
    Expired {
        expiration: u64,
        now: u64,
    },
    /// An identity repeats in a path, or the local node appears where it must not.
    Cycle(String),
    /// No next hop toward the destination.
    Unreachable,
}

impl EnvelopeError {
    pub fn class(&self) -> RejectClass {
        match self {
            EnvelopeError::Malformed(_) | EnvelopeError::Identity(_) | EnvelopeError::Sealed(_) => {
                RejectClass::Malformed
            }
            EnvelopeError::Signature { .. } => RejectClass::Signature,
            EnvelopeError::Expired { .. } => RejectClass::Expired,
            EnvelopeError::Cycle(_) => RejectClass::Cycle,
            EnvelopeError::Unreachable => RejectClass::Unreachable,
        }
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(what) => write!(f, "malformed envelope: {what}"),
            EnvelopeError::Identity(e) => write!(f, "malformed envelope: {e}"),
            EnvelopeError::Sealed(e) => write!(f, "sealed field: {e}"),
            EnvelopeError::Signature { site, source } => {
                write!(f, "signature failure at {site:?}: {source}")
            }
            EnvelopeError::Expired { expiration, now } => {
                write!(f, "expired at {expiration}, now {now}")
            }
            EnvelopeError::Cycle(who) => write!(f, "routing cycle through {who}"),
            EnvelopeError::Unreachable => write!(f, "destination unreachable"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<IdentityError> for EnvelopeError {
    fn from(e: IdentityError) -> Self {
        EnvelopeError::Identity(e)
    }
}

// ============================================================================
// Limits
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EnvelopeLimits {
    pub max_envelope_size: usize,
    pub max_back_path: usize,
    pub max_forward_path: usize,
    pub max_expiration_ahead_secs: u64,
}

impl Default for EnvelopeLimits {
    fn default() -> Self {
        Self {
            max_envelope_size: MAX_ENVELOPE_SIZE,
            max_back_path: MAX_BACK_PATH_LEN,
            max_forward_path: MAX_FORWARD_PATH_LEN,
            max_expiration_ahead_secs: DEFAULT_MAX_EXPIRATION_AHEAD_SECS,
        }
    }
}

// ============================================================================
// Building
// ============================================================================

/// Bytes covered by a back-path signature.
fn link_payload(next_hop: &str, body_sig: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(next_hop.len() + body_sig.len());
    payload.extend_from_slice(next_hop.as_bytes());
    payload.extend_from_slice(body_sig.as_bytes());
    payload
}

/// Bytes covered by the origin's `body_sig`.
fn body_payload(origin: &str, body: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(origin.len() + body.len());
    payload.extend_from_slice(origin.as_bytes());
    payload.extend_from_slice(body.as_bytes());
    payload
}

pub fn encode_body(body: &Body) -> Result<String, EnvelopeError> {
    serde_json::to_string(body).map_err(|_| EnvelopeError::Malformed("unserializable body"))
}

/// Serialize `body`, moving `fields` into a token sealed to `recipient`.
pub fn encode_sealed_body(
    body: &Body,
    recipient: &PeerIdentity,
    fields: &[&str],
) -> Result<String, EnvelopeError> {
    let mut value =
        serde_json::to_value(body).map_err(|_| EnvelopeError::Malformed("unserializable body"))?;
    let Value::Object(map) = &mut value else {
        return Err(EnvelopeError::Malformed("body is not an object"));
    };
    let mut hidden = Map::new();
    for field in fields {
        if let Some(v) = map.remove(*field) {
            hidden.insert((*field).to_string(), v);
        }
    }
    let plaintext = serde_json::to_vec(&Value::Object(hidden))
        .map_err(|_| EnvelopeError::Malformed("unserializable sealed fields"))?;
    let token = recipient.encrypt(&plaintext).map_err(EnvelopeError::Sealed)?;
    map.insert(ENCRYPTED_FIELD.to_string(), Value::String(token));
    serde_json::to_string(&value).map_err(|_| EnvelopeError::Malformed("unserializable body"))
}

/// Sign `body` as origin. `forward_path` is destination-first.
pub fn originate(
    keypair: &Keypair,
    body: String,
    forward_path: Option<&[PeerIdentity]>,
) -> WireEnvelope {
    let body_sig = keypair.sign_encoded(&body_payload(keypair.identity().encoded(), &body));
    let (forward_path, forward_sig) = match forward_path {
        Some(path) if !path.is_empty() => {
            let joined = join_path(path);
            let sig = keypair.sign_encoded(joined.as_bytes());
            (Some(joined), Some(sig))
        }
        _ => (None, None),
    };
    WireEnvelope {
        body,
        body_sig,
        back_path: Vec::new(),
        forward_path,
        forward_sig,
    }
}

fn join_path(path: &[PeerIdentity]) -> String {
    let mut joined = String::new();
    for (i, id) in path.iter().enumerate() {
        if i > 0 {
            joined.push(FORWARD_PATH_SEPARATOR);
        }
        joined.push_str(id.encoded());
    }
    joined
}

/// Prepend this hop's entry for a send to `next_hop`.
///
/// Once the next hop is the forward path's destination, the forward fields
/// are dropped: the back path alone carries the rest.
pub fn extend(keypair: &Keypair, wire: &mut WireEnvelope, next_hop: &PeerIdentity) {
    let sig = keypair.sign_encoded(&link_payload(next_hop.encoded(), &wire.body_sig));
    let entry = format!(
        "{}{}{}",
        keypair.identity().encoded(),
        BACK_PATH_SEPARATOR,
        sig
    );
    wire.back_path.insert(0, entry);
    if wire.forward_destination() == Some(next_hop.encoded()) {
        wire.strip_forward_path();
    }
}

// ============================================================================
// Verification
// ============================================================================

/// An envelope that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    pub origin: PeerIdentity,
    /// Origin first, newest hop last.
    pub back_path: Vec<PeerIdentity>,
    /// Destination first.
    pub forward_path: Option<Vec<PeerIdentity>>,
    pub body: Body,
    /// Sealed fields addressed to someone else, left unopened.
    pub sealed: Option<String>,
    pub wire: WireEnvelope,
}

impl VerifiedEnvelope {
    /// The neighbor that handed us this envelope.
    pub fn sender(&self) -> &PeerIdentity {
        // back_path is never empty after verification
        &self.back_path[self.back_path.len() - 1]
    }

    /// Back path in wire order: newest hop first, origin last.
    pub fn hops_nearest_first(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.back_path.iter().rev()
    }

    /// Source route for a reply: destination (our origin) first.
    pub fn reply_path(&self) -> Vec<PeerIdentity> {
        self.back_path.clone()
    }

    /// Identifier of the signed body, used to match replies to requests.
    pub fn request_id(&self) -> &str {
        &self.wire.body_sig
    }

    /// Topology facts: `(peer, via)` meaning `peer` was reached through `via`,
    /// where `via` is one hop closer to us.
    pub fn links(&self) -> impl Iterator<Item = (&PeerIdentity, &PeerIdentity)> {
        self.back_path.windows(2).map(|w| (&w[0], &w[1]))
    }

    /// True when a forward path names a destination other than `local`.
    pub fn is_in_transit(&self, local: &PeerIdentity) -> bool {
        self.forward_path
            .as_ref()
            .and_then(|p| p.first())
            .is_some_and(|dest| dest != local)
    }
}

/// Verify a back path against `terminal`, the identity the newest entry was
/// handed to. Returns the hops origin-first.
///
/// The local identity may only appear as the newest entry, and only when
/// `terminal` is someone else (an envelope we just extended ourselves).
pub fn verify_back_path(
    registry: &mut IdentityRegistry,
    terminal: &PeerIdentity,
    back_path: &[String],
    body_sig: &str,
) -> Result<Vec<PeerIdentity>, EnvelopeError> {
    if back_path.is_empty() {
        return Err(EnvelopeError::Malformed("empty back_path"));
    }
    let local = registry.local().clone();

    let mut seen: HashSet<&str> = HashSet::with_capacity(back_path.len());
    let mut hops = Vec::with_capacity(back_path.len());
    let mut sigs = Vec::with_capacity(back_path.len());
    for (i, entry) in back_path.iter().enumerate() {
        let (encoded, sig) = entry
            .split_once(BACK_PATH_SEPARATOR)
            .ok_or(EnvelopeError::Malformed("back_path entry without signature"))?;
        if !seen.insert(encoded) {
            return Err(EnvelopeError::Cycle(short_of(registry, encoded)));
        }
        let hop = registry.resolve(encoded)?;
        if hop == local && (i > 0 || *terminal == local) {
            return Err(EnvelopeError::Cycle(hop.short()));
        }
        hops.push(hop);
        sigs.push(sig);
    }

    // Chain order, starting from the origin's entry.
    for i in (0..hops.len()).rev() {
        let handed_to = if i == 0 { terminal } else { &hops[i - 1] };
        hops[i]
            .verify_encoded(sigs[i], &link_payload(handed_to.encoded(), body_sig))
            .map_err(|source| EnvelopeError::Signature {
                site: SignatureSite::BackPath(i),
                source,
            })?;
    }

    hops.reverse();
    Ok(hops)
}

fn short_of(registry: &mut IdentityRegistry, encoded: &str) -> String {
    registry
        .resolve(encoded)
        .map(|id| id.short())
        .unwrap_or_else(|_| "?".to_string())
}

/// Parse a destination-first forward path. A repeated identity is a loop.
fn parse_forward_path(
    registry: &mut IdentityRegistry,
    joined: &str,
    limits: &EnvelopeLimits,
) -> Result<Vec<PeerIdentity>, EnvelopeError> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    for encoded in joined.split(FORWARD_PATH_SEPARATOR) {
        if path.len() == limits.max_forward_path {
            return Err(EnvelopeError::Malformed("forward_path too long"));
        }
        if !seen.insert(encoded) {
            return Err(EnvelopeError::Cycle(short_of(registry, encoded)));
        }
        path.push(registry.resolve(encoded)?);
    }
    Ok(path)
}

/// Merge a sealed `encrypted` field, if present, into the body object.
///
/// A token sealed to someone else is handed back unopened: relays verify and
/// route such envelopes without reading them.
fn open_sealed_fields(keypair: &Keypair, value: &mut Value) -> Result<Option<String>, EnvelopeError> {
    let Value::Object(map) = value else {
        return Err(EnvelopeError::Malformed("body is not an object"));
    };
    let Some(sealed) = map.remove(ENCRYPTED_FIELD) else {
        return Ok(None);
    };
    let Value::String(token) = sealed else {
        return Err(EnvelopeError::Malformed("encrypted is not a string"));
    };
    let plaintext = match keypair.decrypt(&token) {
        Ok(plaintext) => plaintext,
        Err(CryptoError::Decryption) => return Ok(Some(token)),
        Err(e) => return Err(EnvelopeError::Sealed(e)),
    };
    let Value::Object(hidden) = serde_json::from_slice::<Value>(&plaintext)
        .map_err(|_| EnvelopeError::Malformed("sealed fields are not JSON"))?
    else {
        return Err(EnvelopeError::Malformed("sealed fields are not an object"));
    };
    for (k, v) in hidden {
        // Sealed fields never override signed cleartext ones.
        map.entry(k).or_insert(v);
    }
    Ok(None)
}

/// Verify a received envelope addressed to the local node.
pub fn verify(
    bytes: &[u8],
    keypair: &Keypair,
    registry: &mut IdentityRegistry,
    limits: &EnvelopeLimits,
    now_secs: u64,
) -> Result<VerifiedEnvelope, EnvelopeError> {
    let wire = WireEnvelope::from_bytes(bytes, limits.max_envelope_size)
        .map_err(|_| EnvelopeError::Malformed("unparseable envelope"))?;
    verify_wire(wire, keypair, registry, limits, now_secs)
}

pub fn verify_wire(
    wire: WireEnvelope,
    keypair: &Keypair,
    registry: &mut IdentityRegistry,
    limits: &EnvelopeLimits,
    now_secs: u64,
) -> Result<VerifiedEnvelope, EnvelopeError> {
    if wire.back_path.len() > limits.max_back_path {
        return Err(EnvelopeError::Malformed("back_path too long"));
    }
    let local = keypair.identity().clone();

    let back_path = verify_back_path(registry, &local, &wire.back_path, &wire.body_sig)?;
    let origin = back_path[0].clone();

    origin
        .verify_encoded(&wire.body_sig, &body_payload(origin.encoded(), &wire.body))
        .map_err(|source| EnvelopeError::Signature {
            site: SignatureSite::Body,
            source,
        })?;

    let forward_path = match (&wire.forward_path, &wire.forward_sig) {
        (None, None) => None,
        (Some(joined), Some(sig)) => {
            origin
                .verify_encoded(sig, joined.as_bytes())
                .map_err(|source| EnvelopeError::Signature {
                    site: SignatureSite::ForwardPath,
                    source,
                })?;
            Some(parse_forward_path(registry, joined, limits)?)
        }
        _ => return Err(EnvelopeError::Malformed("forward_path without forward_sig")),
    };

    let mut value: Value = serde_json::from_str(&wire.body)
        .map_err(|_| EnvelopeError::Malformed("body is not JSON"))?;
    let sealed = open_sealed_fields(keypair, &mut value)?;
    let body: Body = serde_json::from_value(value)
        .map_err(|_| EnvelopeError::Malformed("unknown or ill-typed body"))?;

    match body.class() {
        RouteClass::Direct => {
            if back_path.len() != 1 || forward_path.is_some() {
                return Err(EnvelopeError::Malformed("direct message was relayed"));
            }
        }
        RouteClass::Routable | RouteClass::Forwardable => {
            let expiration = body
                .expiration
                .ok_or(EnvelopeError::Malformed("missing expiration"))?;
            if !expiration.is_live_at(now_secs) {
                return Err(EnvelopeError::Expired {
                    expiration: expiration.as_secs(),
                    now: now_secs,
                });
            }
            if expiration.as_secs() > now_secs.saturating_add(limits.max_expiration_ahead_secs) {
                return Err(EnvelopeError::Malformed("expiration too far ahead"));
            }
        }
    }

    Ok(VerifiedEnvelope {
        origin,
        back_path,
        forward_path,
        body,
        sealed,
        wire,
    })
}

// ============================================================================
// Source Routes
// ============================================================================

/// Next hop along a destination-first path: the first identity, scanning from
/// the destination, for which `is_open` holds. Entries at or behind `local`
/// are never chosen.
pub fn next_hop_on_path(
    path: &[PeerIdentity],
    local: &PeerIdentity,
    is_open: impl Fn(&PeerIdentity) -> bool,
) -> Option<PeerIdentity> {
    for hop in path {
        if hop == local {
            break;
        }
        if is_open(hop) {
            return Some(hop.clone());
        }
    }
    None
}

/// Remove loops from a proposed route: when an identity repeats, the segment
/// between its occurrences is dropped.
pub fn snip_loops(path: &[PeerIdentity]) -> Vec<PeerIdentity> {
    let mut out: Vec<PeerIdentity> = Vec::with_capacity(path.len());
    for hop in path {
        if let Some(pos) = out.iter().position(|h| h == hop) {
            out.truncate(pos + 1);
        } else {
            out.push(hop.clone());
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::{KadId, now_secs};
    use crate::messages::{DEFAULT_MESSAGE_TTL, Expiration, MessageKind};

    pub(crate) struct Hop {
        pub keypair: Keypair,
        pub registry: IdentityRegistry,
    }

    impl Hop {
        pub(crate) fn new() -> Self {
            Self::from_keypair(Keypair::generate())
        }

        pub(crate) fn from_keypair(keypair: Keypair) -> Self {
            let registry = IdentityRegistry::new(keypair.identity().clone());
            Self { keypair, registry }
        }

        pub(crate) fn id(&self) -> PeerIdentity {
            self.keypair.identity().clone()
        }

        pub(crate) fn verify(&mut self, wire: &WireEnvelope) -> Result<VerifiedEnvelope, EnvelopeError> {
            verify_wire(
                wire.clone(),
                &self.keypair,
                &mut self.registry,
                &EnvelopeLimits::default(),
                now_secs(),
            )
        }
    }

    fn lookup_body() -> String {
        encode_body(&Body::new(
            MessageKind::Lookup {
                target: KadId::from_u64(200),
            },
            DEFAULT_MESSAGE_TTL,
            now_secs(),
        ))
        .unwrap()
    }

    /// Relay `wire` from hops[0] through every hop to `dest`.
    fn relay(hops: &[Hop], dest: &PeerIdentity, mut wire: WireEnvelope) -> WireEnvelope {
        for (i, hop) in hops.iter().enumerate() {
            let next = hops.get(i + 1).map(|h| h.id()).unwrap_or_else(|| dest.clone());
            extend(&hop.keypair, &mut wire, &next);
        }
        wire
    }

    #[test]
    fn chain_roundtrip_recovers_hops_in_order() {
        for n in 1..=5 {
            let hops: Vec<Hop> = (0..n).map(|_| Hop::new()).collect();
            let mut dest = Hop::new();
            let wire = relay(&hops, &dest.id(), originate(&hops[0].keypair, lookup_body(), None));

            let verified = dest.verify(&wire).unwrap();
            let expected: Vec<PeerIdentity> = hops.iter().map(Hop::id).collect();
            assert_eq!(verified.back_path, expected);
            assert_eq!(verified.origin, hops[0].id());
            assert_eq!(verified.sender(), &hops[n - 1].id());
            assert_eq!(verified.links().count(), n - 1);
        }
    }

    #[test]
    fn any_single_byte_mutation_breaks_the_chain() {
        let hops: Vec<Hop> = (0..3).map(|_| Hop::new()).collect();
        let dest_kp = Keypair::generate();
        let wire = relay(&hops, dest_kp.identity(), originate(&hops[0].keypair, lookup_body(), None));

        for entry_idx in 0..wire.back_path.len() {
            let entry = &wire.back_path[entry_idx];
            for pos in 0..entry.len() {
                let mut bytes = entry.clone().into_bytes();
                // Flip to a different base64 character so the mutation stays
                // inside the alphabet most of the time.
                bytes[pos] = if bytes[pos] == b'A' { b'B' } else { b'A' };
                let Ok(mutated) = String::from_utf8(bytes) else { continue };
                if mutated == *entry {
                    continue;
                }
                let mut tampered = wire.clone();
                tampered.back_path[entry_idx] = mutated;
                let mut dest = Hop::from_keypair(dest_kp.clone());
                assert!(
                    dest.verify(&tampered).is_err(),
                    "mutation at entry {entry_idx} byte {pos} accepted"
                );
            }
        }
    }

    #[test]
    fn tampered_body_or_body_sig_is_rejected() {
        let origin = Hop::new();
        let mut dest = Hop::new();
        let mut wire = originate(&origin.keypair, lookup_body(), None);
        extend(&origin.keypair, &mut wire, &dest.id());

        let mut body_tampered = wire.clone();
        body_tampered.body = body_tampered.body.replace("lookup", "lookuq");
        assert!(matches!(
            dest.verify(&body_tampered),
            Err(EnvelopeError::Signature {
                site: SignatureSite::Body,
                ..
            })
        ));

        // A new body_sig invalidates the back-path link that covers it.
        let mut sig_swapped = wire.clone();
        sig_swapped.body_sig = origin.keypair.sign_encoded(b"other");
        assert!(matches!(
            dest.verify(&sig_swapped),
            Err(EnvelopeError::Signature {
                site: SignatureSite::BackPath(0),
                ..
            })
        ));
    }

    #[test]
    fn origin_key_agreement_half_cannot_be_swapped() {
        use crate::identity::KEY_SEPARATOR;

        let origin = Hop::new();
        let relay = Hop::new();
        let mut dest = Hop::new();
        let mut wire = originate(&origin.keypair, lookup_body(), None);
        extend(&origin.keypair, &mut wire, &relay.id());

        // The relay keeps the origin's signing half and link signature but
        // substitutes its own key-agreement key, then forwards as usual.
        let origin_entry = wire.back_path[0].clone();
        let (encoded, link_sig) = origin_entry.split_once('.').unwrap();
        let (signing_half, _) = encoded.split_once(KEY_SEPARATOR).unwrap();
        let relay_id = relay.id();
        let (_, relay_kex) = relay_id.encoded().split_once(KEY_SEPARATOR).unwrap();
        let forged_identity = format!("{signing_half}{KEY_SEPARATOR}{relay_kex}");

        for forged in [format!("{forged_identity}.{link_sig}"), format!("{signing_half}.{link_sig}")] {
            let mut tampered = wire.clone();
            tampered.back_path[0] = forged;
            extend(&relay.keypair, &mut tampered, &dest.id());
            assert!(matches!(
                dest.verify(&tampered),
                Err(EnvelopeError::Signature {
                    site: SignatureSite::Body,
                    ..
                })
            ));
        }

        let mut honest = wire.clone();
        extend(&relay.keypair, &mut honest, &dest.id());
        assert_eq!(dest.verify(&honest).unwrap().origin, origin.id());
    }

    #[test]
    fn link_signed_for_someone_else_is_rejected() {
        let origin = Hop::new();
        let intended = Hop::new();
        let mut thief = Hop::new();
        let mut wire = originate(&origin.keypair, lookup_body(), None);
        extend(&origin.keypair, &mut wire, &intended.id());
        assert!(matches!(
            thief.verify(&wire),
            Err(EnvelopeError::Signature { .. })
        ));
    }

    #[test]
    fn local_identity_in_back_path_is_a_cycle() {
        let mut local = Hop::new();
        let a = Hop::new();
        let b = Hop::new();

        // local -> a -> b -> local
        let mut wire = originate(&local.keypair, lookup_body(), None);
        extend(&local.keypair, &mut wire, &a.id());
        extend(&a.keypair, &mut wire, &b.id());
        extend(&b.keypair, &mut wire, &local.id());
        assert!(matches!(local.verify(&wire), Err(EnvelopeError::Cycle(_))));

        // Newest entry is local, addressed to local.
        let mut wire = originate(&a.keypair, lookup_body(), None);
        extend(&a.keypair, &mut wire, &local.id());
        extend(&local.keypair, &mut wire, &local.id());
        assert!(matches!(local.verify(&wire), Err(EnvelopeError::Cycle(_))));

        // Just-appended by us toward a neighbor: accepted as our own outbound.
        let mut wire = originate(&a.keypair, lookup_body(), None);
        extend(&a.keypair, &mut wire, &local.id());
        extend(&local.keypair, &mut wire, &b.id());
        let hops = verify_back_path(&mut local.registry, &b.id(), &wire.back_path, &wire.body_sig)
            .unwrap();
        assert_eq!(hops, vec![a.id(), local.id()]);
    }

    #[test]
    fn repeated_identity_is_a_cycle() {
        let a = Hop::new();
        let b = Hop::new();
        let mut dest = Hop::new();
        let mut wire = originate(&a.keypair, lookup_body(), None);
        extend(&a.keypair, &mut wire, &b.id());
        extend(&b.keypair, &mut wire, &a.id());
        extend(&a.keypair, &mut wire, &dest.id());
        assert!(matches!(dest.verify(&wire), Err(EnvelopeError::Cycle(_))));
    }

    #[test]
    fn expiration_boundary_in_seconds() {
        let origin = Hop::new();
        let mut dest = Hop::new();
        let now = now_secs();
        for (offset, accepted) in [(-1i64, false), (0, false), (1, true)] {
            let mut body = Body::new(
                MessageKind::Lookup {
                    target: KadId::from_u64(1),
                },
                DEFAULT_MESSAGE_TTL,
                now,
            );
            body.expiration = Some(Expiration::from_secs((now as i64 + offset) as u64));
            let mut wire = originate(&origin.keypair, encode_body(&body).unwrap(), None);
            extend(&origin.keypair, &mut wire, &dest.id());
            let result = verify_wire(
                wire,
                &dest.keypair,
                &mut dest.registry,
                &EnvelopeLimits::default(),
                now,
            );
            assert_eq!(result.is_ok(), accepted, "offset {offset}");
            if !accepted {
                assert_eq!(result.unwrap_err().class(), RejectClass::Expired);
            }
        }
    }

    #[test]
    fn missing_expiration_and_far_future_are_malformed() {
        let origin = Hop::new();
        let mut dest = Hop::new();
        let now = now_secs();

        let mut body = Body::new(
            MessageKind::Lookup {
                target: KadId::from_u64(1),
            },
            DEFAULT_MESSAGE_TTL,
            now,
        );
        body.expiration = None;
        let mut wire = originate(&origin.keypair, encode_body(&body).unwrap(), None);
        extend(&origin.keypair, &mut wire, &dest.id());
        assert_eq!(dest.verify(&wire).unwrap_err().class(), RejectClass::Malformed);

        body.expiration = Some(Expiration::from_secs(now + 365 * 24 * 3600));
        let mut wire = originate(&origin.keypair, encode_body(&body).unwrap(), None);
        extend(&origin.keypair, &mut wire, &dest.id());
        assert_eq!(dest.verify(&wire).unwrap_err().class(), RejectClass::Malformed);
    }

    #[test]
    fn direct_messages_must_be_single_hop() {
        let a = Hop::new();
        let b = Hop::new();
        let mut dest = Hop::new();
        let ping = encode_body(&Body::new(MessageKind::Ping { nonce: 7 }, DEFAULT_MESSAGE_TTL, 0))
            .unwrap();

        let mut direct = originate(&a.keypair, ping.clone(), None);
        extend(&a.keypair, &mut direct, &dest.id());
        assert!(dest.verify(&direct).is_ok());

        let mut relayed = originate(&a.keypair, ping, None);
        extend(&a.keypair, &mut relayed, &b.id());
        extend(&b.keypair, &mut relayed, &dest.id());
        assert_eq!(dest.verify(&relayed).unwrap_err().class(), RejectClass::Malformed);
    }

    #[test]
    fn forward_path_is_signed_and_stripped_at_destination() {
        let origin = Hop::new();
        let mut mid = Hop::new();
        let mut dest = Hop::new();
        let path = vec![dest.id(), mid.id()];

        let mut wire = originate(&origin.keypair, lookup_body(), Some(&path));
        extend(&origin.keypair, &mut wire, &mid.id());
        assert!(wire.forward_path.is_some());

        let at_mid = mid.verify(&wire).unwrap();
        assert_eq!(at_mid.forward_path.as_deref(), Some(path.as_slice()));
        assert!(at_mid.is_in_transit(&mid.id()));

        let mut onward = at_mid.wire.clone();
        extend(&mid.keypair, &mut onward, &dest.id());
        assert!(onward.forward_path.is_none() && onward.forward_sig.is_none());
        let at_dest = dest.verify(&onward).unwrap();
        assert!(!at_dest.is_in_transit(&dest.id()));
        assert_eq!(at_dest.back_path, vec![origin.id(), mid.id()]);

        let mut forged = wire.clone();
        forged.forward_path = Some(join_path(&[mid.id(), dest.id()]));
        assert!(matches!(
            mid.verify(&forged),
            Err(EnvelopeError::Signature {
                site: SignatureSite::ForwardPath,
                ..
            })
        ));

        let mut half = wire;
        half.forward_sig = None;
        assert_eq!(mid.verify(&half).unwrap_err().class(), RejectClass::Malformed);
    }

    #[test]
    fn forward_path_loop_is_a_cycle() {
        let origin = Hop::new();
        let mut mid = Hop::new();
        let dest = Hop::new();
        let path = vec![dest.id(), mid.id(), dest.id()];
        let mut wire = originate(&origin.keypair, lookup_body(), Some(&path));
        extend(&origin.keypair, &mut wire, &mid.id());
        assert_eq!(mid.verify(&wire).unwrap_err().class(), RejectClass::Cycle);
    }

    #[test]
    fn sealed_fields_are_merged_for_the_recipient_only() {
        let origin = Hop::new();
        let mut dest = Hop::new();
        let body = Body::new(
            MessageKind::Data {
                target: dest.id().kad_id(),
                to: dest.id().encoded().to_string(),
                data: Some("hello".into()),
            },
            DEFAULT_MESSAGE_TTL,
            now_secs(),
        );
        let sealed = encode_sealed_body(&body, &dest.id(), &["data"]).unwrap();
        assert!(!sealed.contains("hello"));
        assert!(sealed.contains(ENCRYPTED_FIELD));

        let mut wire = originate(&origin.keypair, sealed.clone(), None);
        extend(&origin.keypair, &mut wire, &dest.id());
        let verified = dest.verify(&wire).unwrap();
        assert_eq!(verified.body, body);
        assert!(verified.sealed.is_none());

        // A relay verifies the envelope but cannot read the payload.
        let mut relay = Hop::new();
        let mut wire = originate(&origin.keypair, sealed, None);
        extend(&origin.keypair, &mut wire, &relay.id());
        let relayed = relay.verify(&wire).unwrap();
        assert!(relayed.sealed.is_some());
        assert!(matches!(
            relayed.body.kind,
            MessageKind::Data { data: None, .. }
        ));

        let mut wire = wire.clone();
        wire.body = wire.body.replace(ENCRYPTED_FIELD, "encrypteX");
        assert!(relay.verify(&wire).is_err());
    }

    #[test]
    fn malformed_inputs() {
        let mut dest = Hop::new();
        let limits = EnvelopeLimits::default();
        let now = now_secs();
        for raw in [
            &b"not json"[..],
            br#"{"body":"{}","body_sig":"x","back_path":[]}"#,
            br#"{"body":"{}","body_sig":"x","back_path":["no-separator"]}"#,
            br#"{"body":"{}","body_sig":"x","back_path":["!!!.sig"]}"#,
        ] {
            let err = verify(raw, &dest.keypair, &mut dest.registry, &limits, now).unwrap_err();
            assert_eq!(err.class(), RejectClass::Malformed, "{err}");
        }

        let tiny = EnvelopeLimits {
            max_envelope_size: 8,
            ..limits
        };
        let err = verify(b"{\"body\": 1234}", &dest.keypair, &mut dest.registry, &tiny, now)
            .unwrap_err();
        assert_eq!(err.class(), RejectClass::Malformed);
    }

    #[test]
    fn next_hop_scans_from_destination() {
        let [dest, far, near, local, behind] = std::array::from_fn(|_| Hop::new().id());
        let path = vec![dest.clone(), far.clone(), near.clone(), local.clone(), behind.clone()];

        let open = |ids: Vec<PeerIdentity>| move |p: &PeerIdentity| ids.contains(p);
        assert_eq!(
            next_hop_on_path(&path, &local, open(vec![near.clone(), far.clone()])),
            Some(far.clone())
        );
        assert_eq!(
            next_hop_on_path(&path, &local, open(vec![dest.clone(), near.clone()])),
            Some(dest)
        );
        assert_eq!(next_hop_on_path(&path, &local, open(vec![behind])), None);
    }

    #[test]
    fn snip_loops_drops_the_loop_segment() {
        let [a, b, c, d] = std::array::from_fn(|_| Hop::new().id());
        let path = vec![a.clone(), b.clone(), c.clone(), b.clone(), d.clone()];
        assert_eq!(snip_loops(&path), vec![a.clone(), b.clone(), d.clone()]);
        let clean = vec![a, b, c];
        assert_eq!(snip_loops(&clean), clean);
    }
}
