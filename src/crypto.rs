//! # Signatures and Sealed Boxes
//!
//! Raw cryptographic helpers shared by identities, envelopes and session
//! descriptions.
//!
//! ## Signatures
//!
//! Ed25519 over raw bytes, verified strictly. On the wire a signature is the
//! standard base64 of its 64 bytes. Envelope signatures carry no domain prefix:
//! what they cover is fixed by the envelope format itself (`origin_encoded ||
//! body`, the comma-joined forward path, or `next_hop_encoded || body_sig`).
//!
//! ## Sealed Boxes
//!
//! `seal` encrypts to a recipient's X25519 key with a fresh ephemeral key:
//!
//! ```text
//! shared = X25519(ephemeral_secret, recipient_public)
//! key    = HKDF-SHA256(salt = SEAL_SALT, ikm = shared, info = ephemeral_public || recipient_public)
//! token  = b64(ephemeral_public) "." b64(nonce) "." b64(ChaCha20-Poly1305(key, nonce, plaintext))
//! ```
//!
//! SECURITY: a sealed token authenticates nothing about its sender. It must only
//! ever travel inside a field already covered by a signature.

use base64::Engine;
use base64::engine::GeneralPurpose;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as KexPublicKey, StaticSecret};

/// Base64 engine for every binary field on the wire.
pub(crate) const BASE64: GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// HKDF salt for sealed boxes.
const SEAL_SALT: &[u8] = b"hyperspace-seal-v1";

const NONCE_LEN: usize = 12;

// ============================================================================
// Errors
// ============================================================================

/// Signature verification errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature is not valid base64.
    InvalidEncoding,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidEncoding => write!(f, "signature is not valid base64"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Sealed box errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The recipient identity has no key-agreement key.
    MissingKeyAgreementKey,
    /// The token is not three base64 segments of the expected sizes.
    MalformedToken,
    /// The key exchange produced an all-zero secret (low-order point).
    NonContributory,
    /// Key derivation or encryption failed.
    Encryption,
    /// Authentication tag mismatch: wrong recipient or tampered token.
    Decryption,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::MissingKeyAgreementKey => {
                write!(f, "recipient has no key-agreement key")
            }
            CryptoError::MalformedToken => write!(f, "sealed token is malformed"),
            CryptoError::NonContributory => write!(f, "key exchange was not contributory"),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decryption => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Signatures
// ============================================================================

pub fn encode_signature(signature: &Signature) -> String {
    BASE64.encode(signature.to_bytes())
}

pub fn verify_raw(
    key: &VerifyingKey,
    signature: &[u8],
    data: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify_strict(data, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

pub fn verify_encoded(
    key: &VerifyingKey,
    signature: &str,
    data: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let raw = BASE64
        .decode(signature)
        .map_err(|_| SignatureError::InvalidEncoding)?;
    verify_raw(key, &raw, data)
}

// ============================================================================
// Sealed Boxes
// ============================================================================

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &KexPublicKey,
    recipient: &KexPublicKey,
) -> Result<[u8; 32], CryptoError> {
    let mut info = [0u8; 64];
    info[..32].copy_from_slice(ephemeral.as_bytes());
    info[32..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(SEAL_SALT), shared);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(okm)
}

pub fn seal(recipient: &KexPublicKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = KexPublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(format!(
        "{}.{}.{}",
        BASE64.encode(ephemeral_public.as_bytes()),
        BASE64.encode(nonce),
        BASE64.encode(ciphertext)
    ))
}

pub fn open(secret: &StaticSecret, token: &str) -> Result<Vec<u8>, CryptoError> {
    let mut parts = token.split('.');
    let (Some(eph), Some(nonce), Some(ct), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::MalformedToken);
    };

    let eph: [u8; 32] = BASE64
        .decode(eph)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::MalformedToken)?;
    let nonce: [u8; NONCE_LEN] = BASE64
        .decode(nonce)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::MalformedToken)?;
    let ciphertext = BASE64.decode(ct).map_err(|_| CryptoError::MalformedToken)?;

    let ephemeral_public = KexPublicKey::from(eph);
    let recipient_public = KexPublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient_public)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption)
}
