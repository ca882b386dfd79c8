//! # Hyperspace - Overlay Routing and Identity Core
//!
//! Hyperspace is the routing core of a peer-to-peer overlay in which every
//! node is addressed by a 256-bit id derived from its public keys:
//!
//! - **Identity**: Ed25519 signing key plus optional X25519 key-agreement key;
//!   the kad id is SHA-256 over both
//! - **Envelopes**: every hop signs the link it is about to traverse, so the
//!   back path is a verifiable chain from the origin to the current receiver
//! - **Routing**: sibling lists (linear distance) for responsibility, k-buckets
//!   (XOR distance) for greedy next-hop selection
//! - **Connections**: perfect negotiation over the overlay itself, with a claim
//!   count deciding when an unused connection is evicted
//!
//! ## Architecture
//!
//! The node follows the **Actor Pattern**:
//! - [`Node`] is a handle that talks to a private actor over async channels
//! - The actor owns the routing table, the connection registry and the caches
//!   and processes commands and transport events one at a time
//! - The transport is a collaborator behind the [`Transport`] trait;
//!   [`MemoryNetwork`] provides an in-process implementation
//!
//! ## Security Model
//!
//! - Identity = public keys; the kad id cannot be chosen independently of them
//! - Every back-path entry signs `(next hop, body signature)`: a relay cannot
//!   splice itself into a path it was not handed
//! - The origin signs its full encoded identity together with the body, so
//!   neither key half can be swapped in transit
//! - Session descriptions carry a signature over the identity and the DTLS
//!   fingerprints, so a connection is bound to the identity that owns the keys
//! - Bounded caches and size limits on every received envelope
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, identities, kad ids, the identity registry |
//! | `crypto` | Signature encoding and sealed tokens |
//! | `messages` | Wire envelope and message bodies |
//! | `envelope` | Building, extending and verifying envelopes |
//! | `routing` | Routing table and the sniffed path cache |
//! | `connection` | Connection state machine and registry |
//! | `protocols` | The transport collaborator contract |
//! | `transport` | In-memory transport |
//! | `config` | Node tunables |
//! | `node` | High-level API tying everything together |

mod config;
mod crypto;
pub mod connection;
pub mod envelope;
pub mod identity;
pub mod messages;
mod node;
mod protocols;
pub mod routing;
mod transport;

pub use config::{ConfigError, NodeConfig};
pub use connection::{ConnectionId, NegotiationError};
pub use crypto::{CryptoError, SignatureError};
pub use envelope::{EnvelopeError, VerifiedEnvelope};
pub use identity::{IdentityError, IdentityRegistry, KadId, Keypair, PeerIdentity};
pub use messages::{SdpKind, SessionDescription};
pub use node::{LookupOutcome, Node, NodeEvent, ReceivedData, RoutingSnapshot};
pub use protocols::{Transport, TransportEvent};
pub use routing::{RoutingTable, SiblingRange};
pub use transport::{MemoryNetwork, MemoryTransport};
