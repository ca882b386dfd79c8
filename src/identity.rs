//! # Identity and the 256-bit Id Space
//!
//! This module defines the identity types used throughout Hyperspace:
//!
//! - [`KadId`]: 256-bit big-endian identifier, the coordinate in both distance metrics
//! - [`Keypair`]: the local node's signing key (Ed25519) and key-agreement key (X25519)
//! - [`PeerIdentity`]: immutable, cheaply clonable public identity of any peer
//! - [`IdentityRegistry`]: interning cache keyed by encoded form, swept explicitly
//!
//! ## Identity Model
//!
//! A peer is named by its public key material, never by its network address:
//!
//! ```text
//! kad_id  = SHA-256(ed25519_public(32) || x25519_public(32))   read big-endian
//! encoded = base64(ed25519_public) "&" base64(x25519_public)
//! ```
//!
//! The key-agreement half is optional; without it only the signing key is hashed
//! and the encoded form has a single segment. Two identities are equal iff their
//! encoded forms are equal.
//!
//! ## Distance Metrics
//!
//! | Metric | Used for |
//! |--------|----------|
//! | XOR (`a ^ b`) | k-bucket placement, next-hop selection |
//! | Linear (`|a - b|`) | sibling list membership, responsibility |
//!
//! ## Security Invariants
//!
//! - Only canonical encodings are accepted, so one key has exactly one identity
//! - Only the local [`Keypair`] can produce signatures; [`PeerIdentity`] only verifies
//! - Registry correctness never depends on sweep timing: equality is by encoded form

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as KexPublicKey, StaticSecret};

use crate::crypto::{self, BASE64, CryptoError, SignatureError};

/// Separator between the signing-key and key-agreement-key segments of an encoded identity.
pub const KEY_SEPARATOR: char = '&';

/// Upper bound on an encoded identity. Two padded base64 segments of 32 bytes plus separator.
pub const MAX_ENCODED_IDENTITY_LEN: usize = 89;

/// Number of k-buckets: one per common-prefix length plus the exact-match slot.
pub const BUCKET_COUNT: usize = 257;

/// Bucket index returned for an exact id match.
pub const SELF_BUCKET: usize = 256;

/// Current wall-clock time in whole seconds since the Unix epoch.
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// A segment is not valid base64.
    InvalidEncoding,
    /// A key segment does not decode to exactly 32 bytes.
    InvalidLength,
    /// The signing key is not a valid Ed25519 point.
    InvalidSigningKey,
    /// The encoded form decodes but does not re-encode to the same string.
    NonCanonical,
    /// A kad id is not 1 to 64 hex digits.
    InvalidHex,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::InvalidEncoding => write!(f, "identity is not valid base64"),
            IdentityError::InvalidLength => write!(f, "identity key has invalid length"),
            IdentityError::InvalidSigningKey => write!(f, "identity signing key is not a valid point"),
            IdentityError::NonCanonical => write!(f, "identity encoding is not canonical"),
            IdentityError::InvalidHex => write!(f, "kad id is not valid hex"),
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// KadId
// ============================================================================

/// 256-bit identifier, compared as a big-endian unsigned integer.
///
/// The derived `Ord` is lexicographic over the big-endian bytes, which is the
/// numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KadId([u8; 32]);

impl KadId {
    pub const ZERO: KadId = KadId([0u8; 32]);
    pub const MAX: KadId = KadId([0xFF; 32]);

    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Id whose low 64 bits are `value` and whose high bits are zero.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    #[inline]
    pub fn xor(&self, other: &KadId) -> KadId {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        KadId(out)
    }

    /// Absolute numeric difference `|self - other|`.
    pub fn linear_distance(&self, other: &KadId) -> KadId {
        let (hi, lo) = match self.cmp(other) {
            Ordering::Less => (other, self),
            _ => (self, other),
        };
        let mut out = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let mut diff = hi.0[i] as i16 - lo.0[i] as i16 - borrow;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = diff as u8;
        }
        KadId(out)
    }

    /// Position of the most significant set bit, where bit 255 is the top bit
    /// of the first byte. `None` for zero.
    pub fn highest_set_bit(&self) -> Option<u32> {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_from_top = byte_idx as u32 * 8 + byte.leading_zeros();
                return Some(255 - bit_from_top);
            }
        }
        None
    }

    /// `255 - highest_set_bit(self ^ other)`, or [`SELF_BUCKET`] when equal.
    #[inline]
    pub fn bucket_index(&self, other: &KadId) -> usize {
        match self.xor(other).highest_set_bit() {
            Some(bit) => 255 - bit as usize,
            None => SELF_BUCKET,
        }
    }

    /// Random id that falls into `bucket` relative to `self`.
    ///
    /// The first `bucket` bits match `self`, bit `bucket` differs and the
    /// remaining bits are random. Bucket [`SELF_BUCKET`] (or above) yields `self`.
    pub fn random_in_bucket(&self, bucket: usize) -> KadId {
        if bucket >= SELF_BUCKET {
            return *self;
        }

        let mut distance = [0u8; 32];
        OsRng.fill_bytes(&mut distance);

        let byte_idx = bucket / 8;
        let bit_pos = bucket % 8;

        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }

        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

        self.xor(&KadId(distance))
    }

    /// Fixed-width lowercase hex (64 digits).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 1 to 64 hex digits. Shorter inputs are left-padded with zeros, so
    /// minimal-width renderings from other implementations parse to the same id.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() || s.len() > 64 {
            return Err(IdentityError::InvalidHex);
        }
        let padded = format!("{s:0>64}");
        let bytes = hex::decode(padded).map_err(|_| IdentityError::InvalidHex)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadId({})", self.short())
    }
}

impl fmt::Display for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for KadId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for KadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KadId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// PeerIdentity
// ============================================================================

struct IdentityInner {
    signing: VerifyingKey,
    kex: Option<KexPublicKey>,
    kad_id: KadId,
    encoded: String,
}

/// Public identity of a peer. Clones share one allocation.
#[derive(Clone)]
pub struct PeerIdentity(Arc<IdentityInner>);

impl PeerIdentity {
    /// Derive an identity from raw public key bytes.
    pub fn derive(signing: &[u8; 32], kex: Option<&[u8; 32]>) -> Result<Self, IdentityError> {
        let verifying =
            VerifyingKey::from_bytes(signing).map_err(|_| IdentityError::InvalidSigningKey)?;
        let kex = kex.map(|bytes| KexPublicKey::from(*bytes));
        Ok(Self::from_keys(verifying, kex))
    }

    fn from_keys(signing: VerifyingKey, kex: Option<KexPublicKey>) -> Self {
        let signing_bytes = signing.to_bytes();
        let mut hasher = Sha256::new();
        hasher.update(signing_bytes);
        if let Some(kex) = &kex {
            hasher.update(kex.as_bytes());
        }
        let kad_id = KadId(hasher.finalize().into());

        let mut encoded = BASE64.encode(signing_bytes);
        if let Some(kex) = &kex {
            encoded.push(KEY_SEPARATOR);
            encoded.push_str(&BASE64.encode(kex.as_bytes()));
        }

        Self(Arc::new(IdentityInner {
            signing,
            kex,
            kad_id,
            encoded,
        }))
    }

    /// Parse the canonical encoded form.
    pub fn from_encoded(encoded: &str) -> Result<Self, IdentityError> {
        if encoded.is_empty() || encoded.len() > MAX_ENCODED_IDENTITY_LEN {
            return Err(IdentityError::InvalidLength);
        }
        let (signing_part, kex_part) = match encoded.split_once(KEY_SEPARATOR) {
            Some((s, k)) => (s, Some(k)),
            None => (encoded, None),
        };
        let signing = decode_key(signing_part)?;
        let kex = kex_part.map(decode_key).transpose()?;
        let identity = Self::derive(&signing, kex.as_ref())?;

        // SECURITY: base64 tolerates non-zero trailing bits in some decoders;
        // insisting on a byte-exact round trip keeps one identity per key.
        if identity.encoded() != encoded {
            return Err(IdentityError::NonCanonical);
        }
        Ok(identity)
    }

    #[inline]
    pub fn kad_id(&self) -> KadId {
        self.0.kad_id
    }

    #[inline]
    pub fn encoded(&self) -> &str {
        &self.0.encoded
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.0.signing.to_bytes()
    }

    pub fn has_key_agreement(&self) -> bool {
        self.0.kex.is_some()
    }

    /// Verify a raw 64-byte signature over `data`.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> Result<(), SignatureError> {
        crypto::verify_raw(&self.0.signing, signature, data)
    }

    /// Verify a base64 signature (the wire form) over `data`.
    pub fn verify_encoded(&self, signature: &str, data: &[u8]) -> Result<(), SignatureError> {
        crypto::verify_encoded(&self.0.signing, signature, data)
    }

    /// Seal `plaintext` to this identity. The token is only meaningful inside
    /// a signed body: it carries no sender authentication of its own.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let kex = self.0.kex.as_ref().ok_or(CryptoError::MissingKeyAgreementKey)?;
        crypto::seal(kex, plaintext)
    }

    /// Short hex of the kad id, for log fields.
    pub fn short(&self) -> String {
        self.0.kad_id.short()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &PeerIdentity) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Same keys, different kad id. Lets tests place identities at chosen
    /// coordinates while keeping real signatures.
    #[cfg(test)]
    pub(crate) fn with_kad_id(&self, kad_id: KadId) -> Self {
        Self(Arc::new(IdentityInner {
            signing: self.0.signing,
            kex: self.0.kex,
            kad_id,
            encoded: self.0.encoded.clone(),
        }))
    }
}

fn decode_key(segment: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = BASE64
        .decode(segment)
        .map_err(|_| IdentityError::InvalidEncoding)?;
    bytes.try_into().map_err(|_| IdentityError::InvalidLength)
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.encoded == other.0.encoded
    }
}

impl Eq for PeerIdentity {}

impl std::hash::Hash for PeerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.encoded.hash(state);
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.short())
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoded())
    }
}

/// Returns true when `local` is the polite side towards `remote`: the one with
/// the numerically smaller kad id. Equal ids are impolite on both sides.
#[inline]
pub fn polite(local: &PeerIdentity, remote: &PeerIdentity) -> bool {
    local.kad_id() < remote.kad_id()
}

// ============================================================================
// Keypair
// ============================================================================

/// The privileged local identity: the only one able to sign and decrypt.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    kex_secret: StaticSecret,
    identity: PeerIdentity,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let kex_secret = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing_key, kex_secret)
    }

    pub fn from_secret_bytes(signing: &[u8; 32], kex: &[u8; 32]) -> Self {
        Self::from_parts(SigningKey::from_bytes(signing), StaticSecret::from(*kex))
    }

    fn from_parts(signing_key: SigningKey, kex_secret: StaticSecret) -> Self {
        let kex_public = KexPublicKey::from(&kex_secret);
        let identity = PeerIdentity::from_keys(signing_key.verifying_key(), Some(kex_public));
        Self {
            signing_key,
            kex_secret,
            identity,
        }
    }

    #[inline]
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Sign and return the base64 wire form.
    pub fn sign_encoded(&self, data: &[u8]) -> String {
        crypto::encode_signature(&self.sign(data))
    }

    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CryptoError> {
        crypto::open(&self.kex_secret, token)
    }

    #[cfg(test)]
    pub(crate) fn with_kad_id(mut self, kad_id: KadId) -> Self {
        self.identity = self.identity.with_kad_id(kad_id);
        self
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity.short())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Identity Registry
// ============================================================================

/// Interning cache from encoded form to identity.
///
/// Entries are held weakly; [`IdentityRegistry::sweep`] drops the ones no
/// longer referenced anywhere else. The local identity is pinned.
pub struct IdentityRegistry {
    local: PeerIdentity,
    entries: HashMap<String, Weak<IdentityInner>>,
}

impl IdentityRegistry {
    pub fn new(local: PeerIdentity) -> Self {
        let mut entries = HashMap::new();
        entries.insert(local.encoded().to_string(), Arc::downgrade(&local.0));
        Self { local, entries }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Return the live identity for `encoded`, deriving and caching it if needed.
    pub fn resolve(&mut self, encoded: &str) -> Result<PeerIdentity, IdentityError> {
        if let Some(weak) = self.entries.get(encoded)
            && let Some(inner) = weak.upgrade()
        {
            return Ok(PeerIdentity(inner));
        }
        let identity = PeerIdentity::from_encoded(encoded)?;
        self.entries
            .insert(identity.encoded().to_string(), Arc::downgrade(&identity.0));
        Ok(identity)
    }

    /// Register an identity obtained elsewhere. Returns the canonical instance:
    /// the already-cached one if alive, otherwise `identity` itself.
    pub fn intern(&mut self, identity: &PeerIdentity) -> PeerIdentity {
        if let Some(weak) = self.entries.get(identity.encoded())
            && let Some(inner) = weak.upgrade()
        {
            return PeerIdentity(inner);
        }
        self.entries
            .insert(identity.encoded().to_string(), Arc::downgrade(&identity.0));
        identity.clone()
    }

    /// Drop entries whose identity is no longer referenced. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
