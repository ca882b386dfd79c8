//! # Routing Table
//!
//! Tracks which live connections the node keeps and answers "who is closest
//! to X" with a single greedy next hop.
//!
//! ## Layout
//!
//! ```text
//!   below siblings (≤ s)   local   above siblings (≤ s)      linear distance
//!   ─────────────────────────┼────────────────────────
//!   bucket 0 | bucket 1 | ... | bucket 255 | bucket 256      XOR prefix length
//!   (≤ k each)
//! ```
//!
//! An entry lives in exactly one of the three structures. Sibling lists are
//! ordered by ascending linear distance to the local id; buckets are indexed
//! by `255 - highest_set_bit(local ^ remote)`.
//!
//! ## Transactions
//!
//! `insert` and `remove` resolve the whole displacement cascade before they
//! return and report the claim deltas as a list of [`ClaimChange`]s. A
//! displaced sibling that moves into a bucket is a transfer: no delta at all.
//! The caller applies the deltas to the connection registry afterwards, so a
//! half-applied table is never observable.
//!
//! ## Path Cache
//!
//! [`PathCache`] remembers sniffed "X was reachable via Y" facts from verified
//! back paths and turns them into source routes for peers we have no direct
//! connection to.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::envelope::{VerifiedEnvelope, snip_loops};
use crate::identity::{BUCKET_COUNT, KadId, PeerIdentity};

/// Default k-bucket capacity.
pub const DEFAULT_K: usize = 2;

/// Default sibling list capacity per side.
pub const DEFAULT_SIBLINGS: usize = 3;

/// Longest source route the path cache will assemble.
pub const MAX_CACHED_ROUTE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimChange {
    Claim(PeerIdentity),
    Release(PeerIdentity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    SiblingBelow,
    SiblingAbove,
    Bucket(usize),
}

#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Where the peer ended up, `None` if every structure turned it away.
    pub placement: Option<Placement>,
    pub changes: Vec<ClaimChange>,
}

impl InsertOutcome {
    pub fn retained(&self) -> bool {
        self.placement.is_some()
    }
}

/// Sibling responsibility bounds. `None` on a side that is not yet full:
/// the node is then responsible for everything on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingRange {
    pub lowest: Option<KadId>,
    pub highest: Option<KadId>,
    pub below: usize,
    pub above: usize,
}

// ============================================================================
// Sibling List
// ============================================================================

enum SiblingOffer {
    Accepted { displaced: Option<PeerIdentity> },
    Rejected(PeerIdentity),
}

#[derive(Debug)]
struct SiblingList {
    capacity: usize,
    /// Ascending linear distance to the local id.
    entries: Vec<PeerIdentity>,
}

impl SiblingList {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn farthest(&self) -> Option<&PeerIdentity> {
        self.entries.last()
    }

    fn contains(&self, peer: &PeerIdentity) -> bool {
        self.entries.contains(peer)
    }

    fn admits(&self, local: &KadId, kad_id: &KadId) -> bool {
        if self.capacity == 0 {
            return false;
        }
        match self.farthest() {
            Some(far) if self.is_full() => {
                local.linear_distance(kad_id) < local.linear_distance(&far.kad_id())
            }
            _ => true,
        }
    }

    fn offer(&mut self, local: &KadId, peer: PeerIdentity) -> SiblingOffer {
        if !self.admits(local, &peer.kad_id()) {
            return SiblingOffer::Rejected(peer);
        }
        let dist = local.linear_distance(&peer.kad_id());
        let pos = self
            .entries
            .partition_point(|e| local.linear_distance(&e.kad_id()) <= dist);
        self.entries.insert(pos, peer);
        let displaced = if self.entries.len() > self.capacity {
            self.entries.pop()
        } else {
            None
        };
        SiblingOffer::Accepted { displaced }
    }

    fn remove(&mut self, peer: &PeerIdentity) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e == peer) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// K-Bucket
// ============================================================================

#[derive(Debug)]
struct KBucket {
    entries: Vec<PeerIdentity>,
    last_refresh: Instant,
}

impl KBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() >= threshold
    }

    fn insert(&mut self, peer: PeerIdentity, k: usize) -> bool {
        if self.entries.len() >= k {
            return false;
        }
        self.entries.push(peer);
        self.mark_refreshed();
        true
    }

    fn remove(&mut self, peer: &PeerIdentity) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e == peer) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    local: PeerIdentity,
    k: usize,
    below: SiblingList,
    above: SiblingList,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: PeerIdentity, k: usize, siblings: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(KBucket::new());
        }
        Self {
            local,
            k,
            below: SiblingList::new(siblings),
            above: SiblingList::new(siblings),
            buckets,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    fn local_kad(&self) -> KadId {
        self.local.kad_id()
    }

    fn side(&self, kad_id: &KadId) -> (&SiblingList, Placement) {
        if *kad_id < self.local_kad() {
            (&self.below, Placement::SiblingBelow)
        } else {
            (&self.above, Placement::SiblingAbove)
        }
    }

    fn side_mut(&mut self, placement: Placement) -> &mut SiblingList {
        match placement {
            Placement::SiblingBelow => &mut self.below,
            _ => &mut self.above,
        }
    }

    pub fn bucket_index(&self, kad_id: &KadId) -> usize {
        self.local_kad().bucket_index(kad_id)
    }

    pub fn placement_of(&self, peer: &PeerIdentity) -> Option<Placement> {
        if self.below.contains(peer) {
            return Some(Placement::SiblingBelow);
        }
        if self.above.contains(peer) {
            return Some(Placement::SiblingAbove);
        }
        let idx = self.bucket_index(&peer.kad_id());
        self.buckets[idx]
            .entries
            .contains(peer)
            .then_some(Placement::Bucket(idx))
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.placement_of(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.below.entries.len()
            + self.above.entries.len()
            + self.buckets.iter().map(|b| b.entries.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_insert(&mut self, peer: PeerIdentity) -> Option<usize> {
        let idx = self.bucket_index(&peer.kad_id());
        self.buckets[idx].insert(peer, self.k).then_some(idx)
    }

    /// Offer a newly opened connection. Siblings first, then buckets.
    pub fn insert(&mut self, peer: PeerIdentity) -> InsertOutcome {
        if peer == self.local {
            return InsertOutcome::default();
        }
        if let Some(existing) = self.placement_of(&peer) {
            return InsertOutcome {
                placement: Some(existing),
                changes: Vec::new(),
            };
        }

        let local = self.local_kad();
        let (_, side) = self.side(&peer.kad_id());
        let claimed = peer.clone();
        let offer = self.side_mut(side).offer(&local, peer);

        let mut changes = Vec::new();
        let placement = match offer {
            SiblingOffer::Accepted { displaced } => {
                changes.push(ClaimChange::Claim(claimed));
                if let Some(displaced) = displaced {
                    // Claim moves with the entry; only a full bucket costs a release.
                    if self.bucket_insert(displaced.clone()).is_none() {
                        changes.push(ClaimChange::Release(displaced));
                    }
                }
                Some(side)
            }
            SiblingOffer::Rejected(peer) => {
                let idx = self.bucket_insert(peer);
                if idx.is_some() {
                    changes.push(ClaimChange::Claim(claimed));
                }
                idx.map(Placement::Bucket)
            }
        };
        InsertOutcome { placement, changes }
    }

    /// Strike `peer` from whichever structure holds it. A vacated sibling slot
    /// is backfilled from the buckets (a transfer, no claim delta).
    pub fn remove(&mut self, peer: &PeerIdentity) -> Vec<ClaimChange> {
        let Some(placement) = self.placement_of(peer) else {
            return Vec::new();
        };
        match placement {
            Placement::Bucket(idx) => {
                self.buckets[idx].remove(peer);
            }
            side => {
                self.side_mut(side).remove(peer);
                self.backfill(side);
            }
        }
        vec![ClaimChange::Release(peer.clone())]
    }

    fn backfill(&mut self, side: Placement) {
        let local = self.local_kad();
        let on_side = |kad: &KadId| match side {
            Placement::SiblingBelow => *kad < local,
            _ => *kad > local,
        };
        let mut best: Option<(KadId, usize)> = None;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            for entry in &bucket.entries {
                let kad = entry.kad_id();
                if !on_side(&kad) {
                    continue;
                }
                let dist = local.linear_distance(&kad);
                if best.as_ref().is_none_or(|(d, _)| dist < *d) {
                    best = Some((dist, idx));
                }
            }
        }
        let Some((dist, idx)) = best else {
            return;
        };
        let Some(pos) = self.buckets[idx]
            .entries
            .iter()
            .position(|e| local.linear_distance(&e.kad_id()) == dist && on_side(&e.kad_id()))
        else {
            return;
        };
        let promoted = self.buckets[idx].entries.remove(pos);
        // A vacancy exists, so the offer cannot displace anyone.
        let _ = self.side_mut(side).offer(&local, promoted);
    }

    /// Greedy next hop: the entry with minimum XOR distance to `target` that
    /// satisfies `constraint`.
    ///
    /// Siblings are scanned first, then buckets from the one that would hold
    /// `target` downward, then the deeper buckets.
    pub fn lookup(
        &self,
        target: &KadId,
        constraint: impl Fn(&PeerIdentity) -> bool,
    ) -> Option<PeerIdentity> {
        let start = self.bucket_index(target);
        let bucket_order = (0..=start.min(BUCKET_COUNT - 1))
            .rev()
            .chain(start + 1..BUCKET_COUNT);

        let candidates = self
            .below
            .entries
            .iter()
            .chain(self.above.entries.iter())
            .chain(bucket_order.flat_map(|i| self.buckets[i].entries.iter()));

        let mut best: Option<(KadId, &PeerIdentity)> = None;
        for peer in candidates {
            if !constraint(peer) {
                continue;
            }
            let dist = peer.kad_id().xor(target);
            if best.as_ref().is_none_or(|(d, _)| dist < *d) {
                best = Some((dist, peer));
            }
        }
        best.map(|(_, p)| p.clone())
    }

    /// Next hop making strict XOR progress over the local node, skipping `exclude`.
    pub fn next_hop(&self, target: &KadId, exclude: &[PeerIdentity]) -> Option<PeerIdentity> {
        let local_dist = self.local_kad().xor(target);
        self.lookup(target, |p| {
            p.kad_id().xor(target) < local_dist && !exclude.contains(p)
        })
    }

    /// Closest known peer to `target` regardless of progress. For the first hop
    /// of a message we originate.
    pub fn closest_known(&self, target: &KadId, exclude: &[PeerIdentity]) -> Option<PeerIdentity> {
        self.lookup(target, |p| !exclude.contains(p))
    }

    /// Would an entry at `kad_id` be retained if it connected now?
    pub fn could_insert(&self, kad_id: &KadId) -> bool {
        if *kad_id == self.local_kad() {
            return false;
        }
        let (list, _) = self.side(kad_id);
        if list.admits(&self.local_kad(), kad_id) {
            return true;
        }
        self.buckets[self.bucket_index(kad_id)].entries.len() < self.k
    }

    /// Inclusive sibling-range check by linear distance.
    pub fn is_responsible(&self, kad_id: &KadId) -> bool {
        let local = self.local_kad();
        let (list, _) = self.side(kad_id);
        match list.farthest() {
            Some(far) if list.is_full() => {
                local.linear_distance(kad_id) <= local.linear_distance(&far.kad_id())
            }
            _ => true,
        }
    }

    pub fn sibling_range(&self) -> SiblingRange {
        SiblingRange {
            lowest: self
                .below
                .is_full()
                .then(|| self.below.farthest().map(PeerIdentity::kad_id))
                .flatten(),
            highest: self
                .above
                .is_full()
                .then(|| self.above.farthest().map(PeerIdentity::kad_id))
                .flatten(),
            below: self.below.entries.len(),
            above: self.above.entries.len(),
        }
    }

    /// Siblings in id order: below (farthest first), then above (nearest first).
    pub fn siblings(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.below.entries.iter().rev().chain(self.above.entries.iter())
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.below
            .entries
            .iter()
            .chain(self.above.entries.iter())
            .chain(self.buckets.iter().flat_map(|b| b.entries.iter()))
    }

    /// Occupancy of non-empty buckets as `(index, len)`.
    pub fn bucket_occupancy(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, b)| (i, b.entries.len()))
            .collect()
    }

    /// Buckets worth refreshing: not full, stale, and no deeper than one past
    /// the deepest bucket any current entry would fall in.
    pub fn buckets_to_refresh(&self, threshold: Duration, limit: usize) -> Vec<usize> {
        let depth = self
            .peers()
            .map(|p| self.bucket_index(&p.kad_id()))
            .max()
            .map_or(0, |d| (d + 1).min(BUCKET_COUNT - 2));
        (0..=depth)
            .filter(|&i| self.buckets[i].entries.len() < self.k && self.buckets[i].is_stale(threshold))
            .take(limit)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.mark_refreshed();
        }
    }
}

// ============================================================================
// Path Cache
// ============================================================================

/// Bounded memory of sniffed `(peer, via)` links.
pub struct PathCache {
    vias: LruCache<PeerIdentity, PeerIdentity>,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            vias: LruCache::new(cap),
        }
    }

    pub fn learn(&mut self, peer: &PeerIdentity, via: &PeerIdentity) {
        if peer != via {
            self.vias.put(peer.clone(), via.clone());
        }
    }

    /// Record every link of a verified back path.
    pub fn learn_from(&mut self, envelope: &VerifiedEnvelope) {
        for (peer, via) in envelope.links() {
            self.learn(peer, via);
        }
    }

    pub fn forget(&mut self, peer: &PeerIdentity) {
        self.vias.pop(peer);
    }

    pub fn len(&self) -> usize {
        self.vias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vias.is_empty()
    }

    /// Destination-first source route to `target` ending at an open neighbor.
    /// `None` when the chain is unknown, too long, loops, or passes through `local`.
    pub fn route_to(
        &mut self,
        target: &PeerIdentity,
        local: &PeerIdentity,
        is_open: impl Fn(&PeerIdentity) -> bool,
    ) -> Option<Vec<PeerIdentity>> {
        let mut path = vec![target.clone()];
        let mut current = target.clone();
        while !is_open(&current) {
            if path.len() >= MAX_CACHED_ROUTE {
                return None;
            }
            let via = self.vias.get(&current)?.clone();
            if via == *local || path.contains(&via) {
                return None;
            }
            path.push(via.clone());
            current = via;
        }
        Some(snip_loops(&path))
    }
}
