//! Protocol trait definitions for the transport collaborator.
//!
//! The overlay core never touches sockets, ICE or DTLS itself. It drives
//! sessions through [`Transport`] and consumes [`TransportEvent`]s from the
//! channel handed over when the transport was created.
//!
//! ## Contract
//!
//! | Call | Meaning |
//! |------|---------|
//! | [`Transport::open_session`] | allocate a session, no remote yet |
//! | [`Transport::local_description`] | produce our offer or answer |
//! | [`Transport::set_remote_description`] | apply the remote offer or answer |
//! | [`Transport::add_ice_candidate`] | trickle a candidate |
//! | [`Transport::send`] | FIFO send on the session's one authoritative data channel |
//! | [`Transport::close`] | tear down, idempotent |
//!
//! Every call may suspend; callers bound each one with a timeout.

use anyhow::Result;
use async_trait::async_trait;

use crate::connection::ConnectionId;
use crate::messages::{SdpKind, SessionDescription};

/// Lifecycle and data events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The data channel is open and authoritative for envelope traffic.
    Opened(ConnectionId),
    /// Orderly close initiated by the remote side.
    Closed(ConnectionId),
    /// The session failed or was disconnected.
    Failed(ConnectionId, String),
    Message(ConnectionId, Vec<u8>),
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::Opened(c)
            | TransportEvent::Closed(c)
            | TransportEvent::Failed(c, _)
            | TransportEvent::Message(c, _) => *c,
        }
    }
}

/// Session setup and data transfer for one local endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open_session(&self) -> Result<ConnectionId>;

    async fn local_description(
        &self,
        conn: ConnectionId,
        kind: SdpKind,
    ) -> Result<SessionDescription>;

    async fn set_remote_description(
        &self,
        conn: ConnectionId,
        desc: &SessionDescription,
    ) -> Result<()>;

    async fn add_ice_candidate(&self, conn: ConnectionId, candidate: &str) -> Result<()>;

    async fn send(&self, conn: ConnectionId, bytes: Vec<u8>) -> Result<()>;

    async fn close(&self, conn: ConnectionId);
}
