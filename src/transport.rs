//! # In-Memory Transport
//!
//! A [`Transport`] whose sessions live in one process. It stands in for
//! WebRTC data channels in tests and in the simulator, and keeps the parts of
//! the real thing the overlay depends on:
//!
//! - an offer/answer exchange with SDP text carrying a per-session DTLS-style
//!   `a=fingerprint` line, checked against the real session on apply
//! - sessions open only when the answer is applied, on both sides at once
//! - one FIFO channel per session, lossy only when the receiver is gone
//!
//! ```text
//!  endpoint A                     MemoryNetwork                    endpoint B
//!  open_session ─► #1 idle
//!  local_description(offer) ─► #1 local-offer ── sdp ──► set_remote(offer)  #2 remote-offer(#1)
//!                                                          local_description(answer) #2 answered(#1)
//!  set_remote(answer) ◄────────────── sdp ───────────────
//!  #1 linked(#2) ◄──── Opened(#1) / Opened(#2) ────► #2 linked(#1)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::messages::{SdpKind, SessionDescription};
use crate::protocols::{Transport, TransportEvent};

/// Per-endpoint event queue depth.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

const SESSION_ATTRIBUTE: &str = "a=x-memory-session:";
const FINGERPRINT_ATTRIBUTE: &str = "a=fingerprint:sha-256 ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    LocalOffer,
    RemoteOffer(ConnectionId),
    Answered(ConnectionId),
    Linked(ConnectionId),
}

#[derive(Debug)]
struct Session {
    endpoint: u64,
    fingerprint: [u8; 32],
    phase: Phase,
}

#[derive(Default)]
struct NetworkState {
    next_endpoint: u64,
    next_session: u64,
    endpoints: HashMap<u64, mpsc::Sender<TransportEvent>>,
    sessions: HashMap<ConnectionId, Session>,
}

impl NetworkState {
    fn emit(&self, endpoint: u64, event: TransportEvent) {
        let Some(tx) = self.endpoints.get(&endpoint) else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    endpoint,
                    conn = %event.connection(),
                    "transport event queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(endpoint, "endpoint gone, dropping event");
            }
        }
    }

    fn owned(&mut self, endpoint: u64, conn: ConnectionId) -> Result<&mut Session> {
        match self.sessions.get_mut(&conn) {
            Some(s) if s.endpoint == endpoint => Ok(s),
            _ => Err(anyhow!("unknown session {conn}")),
        }
    }

    /// Drop `conn`, notify its linked peer with `notify`.
    fn teardown(&mut self, conn: ConnectionId, notify: impl Fn(ConnectionId) -> TransportEvent) {
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        if let Phase::Linked(peer) = session.phase
            && let Some(remote) = self.sessions.remove(&peer)
        {
            self.emit(remote.endpoint, notify(peer));
        }
    }
}

/// A shared in-process network. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint. The receiver carries that endpoint's events.
    pub async fn endpoint(&self) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = self.state.lock().await;
        state.next_endpoint += 1;
        let endpoint = state.next_endpoint;
        state.endpoints.insert(endpoint, tx);
        (
            MemoryTransport {
                endpoint,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Number of linked session pairs.
    pub async fn open_links(&self) -> usize {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .filter(|s| matches!(s.phase, Phase::Linked(_)))
            .count()
            / 2
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: u64,
    network: MemoryNetwork,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl MemoryTransport {
    /// Simulate a network failure: both ends see [`TransportEvent::Failed`].
    pub async fn sever(&self, conn: ConnectionId) {
        let mut state = self.network.state.lock().await;
        let Some(session) = state.sessions.get(&conn) else {
            return;
        };
        let endpoint = session.endpoint;
        state.teardown(conn, |peer| TransportEvent::Failed(peer, "severed".into()));
        state.emit(endpoint, TransportEvent::Failed(conn, "severed".into()));
        debug!(conn = %conn, "session severed");
    }
}

fn render_sdp(conn: ConnectionId, fingerprint: &[u8; 32]) -> String {
    let fp = fingerprint
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         {FINGERPRINT_ATTRIBUTE}{fp}\r\n{SESSION_ATTRIBUTE}{id}\r\n",
        id = conn.0
    )
}

/// Remote session id and fingerprint announced by an SDP.
fn parse_sdp(sdp: &str) -> Result<(ConnectionId, Vec<u8>)> {
    let mut session = None;
    let mut fingerprint = None;
    for line in sdp.lines() {
        if let Some(id) = line.strip_prefix(SESSION_ATTRIBUTE) {
            session = Some(ConnectionId(id.trim().parse()?));
        } else if let Some(fp) = line.strip_prefix(FINGERPRINT_ATTRIBUTE) {
            fingerprint = Some(
                fp.trim()
                    .split(':')
                    .map(|pair| u8::from_str_radix(pair, 16))
                    .collect::<Result<Vec<u8>, _>>()?,
            );
        }
    }
    match (session, fingerprint) {
        (Some(s), Some(f)) => Ok((s, f)),
        _ => bail!("description names no session or fingerprint"),
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_session(&self) -> Result<ConnectionId> {
        let mut state = self.network.state.lock().await;
        state.next_session += 1;
        let conn = ConnectionId(state.next_session);
        let mut fingerprint = [0u8; 32];
        OsRng.fill_bytes(&mut fingerprint);
        state.sessions.insert(
            conn,
            Session {
                endpoint: self.endpoint,
                fingerprint,
                phase: Phase::Idle,
            },
        );
        trace!(endpoint = self.endpoint, conn = %conn, "session opened");
        Ok(conn)
    }

    async fn local_description(
        &self,
        conn: ConnectionId,
        kind: SdpKind,
    ) -> Result<SessionDescription> {
        let mut state = self.network.state.lock().await;
        let session = state.owned(self.endpoint, conn)?;
        let sdp = render_sdp(conn, &session.fingerprint);
        match (kind, session.phase) {
            (SdpKind::Offer, Phase::Idle | Phase::LocalOffer) => {
                session.phase = Phase::LocalOffer;
                Ok(SessionDescription::offer(sdp))
            }
            (SdpKind::Answer, Phase::RemoteOffer(remote)) => {
                session.phase = Phase::Answered(remote);
                Ok(SessionDescription::answer(sdp))
            }
            (kind, phase) => bail!("cannot create {kind:?} in {phase:?}"),
        }
    }

    async fn set_remote_description(
        &self,
        conn: ConnectionId,
        desc: &SessionDescription,
    ) -> Result<()> {
        let (remote, fingerprint) = parse_sdp(&desc.sdp)?;
        let mut state = self.network.state.lock().await;

        let (remote_endpoint, remote_phase) = match state.sessions.get(&remote) {
            Some(r) if r.fingerprint.as_slice() == fingerprint.as_slice() => (r.endpoint, r.phase),
            Some(_) => bail!("fingerprint mismatch for session {remote}"),
            None => bail!("remote session {remote} is gone"),
        };
        if remote_endpoint == self.endpoint {
            bail!("refusing loopback session");
        }

        let local_endpoint = self.endpoint;
        let session = state.owned(local_endpoint, conn)?;
        match (desc.kind, session.phase) {
            // Applying an offer over our own offer is the polite rollback.
            (SdpKind::Offer, Phase::Idle | Phase::LocalOffer) => {
                session.phase = Phase::RemoteOffer(remote);
                Ok(())
            }
            (SdpKind::Answer, Phase::LocalOffer) => {
                if remote_phase != Phase::Answered(conn) {
                    bail!("answer from {remote} does not answer {conn}");
                }
                session.phase = Phase::Linked(remote);
                if let Some(r) = state.sessions.get_mut(&remote) {
                    r.phase = Phase::Linked(conn);
                }
                state.emit(local_endpoint, TransportEvent::Opened(conn));
                state.emit(remote_endpoint, TransportEvent::Opened(remote));
                debug!(local = %conn, remote = %remote, "sessions linked");
                Ok(())
            }
            (kind, phase) => bail!("cannot apply {kind:?} in {phase:?}"),
        }
    }

    async fn add_ice_candidate(&self, conn: ConnectionId, _candidate: &str) -> Result<()> {
        let mut state = self.network.state.lock().await;
        state.owned(self.endpoint, conn).map(|_| ())
    }

    async fn send(&self, conn: ConnectionId, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.network.state.lock().await;
        let Phase::Linked(peer) = state.owned(self.endpoint, conn)?.phase else {
            bail!("session {conn} is not open");
        };
        let endpoint = state
            .sessions
            .get(&peer)
            .map(|s| s.endpoint)
            .ok_or_else(|| anyhow!("peer session {peer} is gone"))?;
        state.emit(endpoint, TransportEvent::Message(peer, bytes));
        Ok(())
    }

    async fn close(&self, conn: ConnectionId) {
        let mut state = self.network.state.lock().await;
        if state.owned(self.endpoint, conn).is_err() {
            return;
        }
        state.teardown(conn, TransportEvent::Closed);
        trace!(conn = %conn, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake(
        a: &MemoryTransport,
        b: &MemoryTransport,
    ) -> (ConnectionId, ConnectionId) {
        let ca = a.open_session().await.unwrap();
        let cb = b.open_session().await.unwrap();
        let offer = a.local_description(ca, SdpKind::Offer).await.unwrap();
        b.set_remote_description(cb, &offer).await.unwrap();
        let answer = b.local_description(cb, SdpKind::Answer).await.unwrap();
        a.set_remote_description(ca, &answer).await.unwrap();
        (ca, cb)
    }

    #[tokio::test]
    async fn offer_answer_opens_both_sides() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.endpoint().await;
        let (b, mut b_rx) = net.endpoint().await;

        let (ca, cb) = handshake(&a, &b).await;
        assert_eq!(a_rx.recv().await, Some(TransportEvent::Opened(ca)));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Opened(cb)));
        assert_eq!(net.open_links().await, 1);

        a.send(ca, b"one".to_vec()).await.unwrap();
        a.send(ca, b"two".to_vec()).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Message(cb, b"one".to_vec())));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Message(cb, b"two".to_vec())));
    }

    #[tokio::test]
    async fn polite_rollback_applies_remote_offer() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.endpoint().await;
        let (b, _b_rx) = net.endpoint().await;

        let ca = a.open_session().await.unwrap();
        let cb = b.open_session().await.unwrap();
        let offer_a = a.local_description(ca, SdpKind::Offer).await.unwrap();
        let _offer_b = b.local_description(cb, SdpKind::Offer).await.unwrap();

        // b is polite: drops its own offer and answers a's.
        b.set_remote_description(cb, &offer_a).await.unwrap();
        let answer = b.local_description(cb, SdpKind::Answer).await.unwrap();
        a.set_remote_description(ca, &answer).await.unwrap();
        assert_eq!(net.open_links().await, 1);
    }

    #[tokio::test]
    async fn fingerprint_must_match_session() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.endpoint().await;
        let (b, _b_rx) = net.endpoint().await;

        let ca = a.open_session().await.unwrap();
        let cb = b.open_session().await.unwrap();
        let offer = a.local_description(ca, SdpKind::Offer).await.unwrap();
        let forged = SessionDescription::offer(offer.sdp.replacen("a=fingerprint:sha-256 ", "a=fingerprint:sha-256 00:", 1));
        assert!(b.set_remote_description(cb, &forged).await.is_err());
    }

    #[tokio::test]
    async fn answer_must_answer_our_offer() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.endpoint().await;
        let (b, _b_rx) = net.endpoint().await;

        let ca = a.open_session().await.unwrap();
        assert!(a.local_description(ca, SdpKind::Answer).await.is_err());
        let cb = b.open_session().await.unwrap();
        let stray = SessionDescription::answer(render_sdp(cb, &[0u8; 32]));
        a.local_description(ca, SdpKind::Offer).await.unwrap();
        assert!(a.set_remote_description(ca, &stray).await.is_err());
        assert!(a.send(ca, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn close_and_sever_notify_the_peer() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.endpoint().await;
        let (b, mut b_rx) = net.endpoint().await;

        let (ca, cb) = handshake(&a, &b).await;
        a_rx.recv().await;
        b_rx.recv().await;
        a.close(ca).await;
        a.close(ca).await;
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Closed(cb)));
        assert!(b.send(cb, vec![1]).await.is_err());

        let (ca, cb) = handshake(&a, &b).await;
        a_rx.recv().await;
        b_rx.recv().await;
        b.sever(cb).await;
        assert_eq!(a_rx.recv().await, Some(TransportEvent::Failed(ca, "severed".into())));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Failed(cb, "severed".into())));
        assert_eq!(net.open_links().await, 0);
    }
}
