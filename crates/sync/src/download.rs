//! Per-peer block download state and window-based next-block selection.

use std::collections::{HashMap, HashSet, VecDeque};

use emberd_chainstate::blockindex::{status, BlockIndex, BlockIndexId};
use emberd_chainstate::chain::ChainView;
use emberd_consensus::constants::BLOCK_DOWNLOAD_WINDOW;
use emberd_consensus::Hash256;

use crate::net::NodeId;

/// Upper bound on concurrently requested blocks per peer.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;
/// Seconds a peer may stall the download window before disconnection.
pub const BLOCK_STALLING_TIMEOUT: i64 = 2;
/// Ancestors fetched per walk step while scanning the download window.
const WALK_BATCH: i32 = 128;

#[derive(Clone, Debug)]
pub struct InFlightBlock {
    pub hash: Hash256,
    pub id: Option<BlockIndexId>,
    pub request_time_micros: i64,
    pub timeout_micros: i64,
    pub validated_header: bool,
}

#[derive(Default)]
pub struct PeerSyncState {
    /// The best header we know this peer has announced.
    pub best_known_block: Option<BlockIndexId>,
    /// Hash of the last announced block whose header we have not validated.
    pub last_unknown_block: Option<Hash256>,
    /// Our best guess at the deepest block we share with the peer.
    pub last_common_block: Option<BlockIndexId>,
    pub blocks_in_flight: VecDeque<InFlightBlock>,
    /// When this peer first blocked the download window; zero if it is not.
    pub stalling_since: i64,
    pub sync_started: bool,
    pub preferred_download: bool,
}

impl PeerSyncState {
    pub fn in_flight_count(&self) -> usize {
        self.blocks_in_flight.len()
    }
}

/// Global download bookkeeping across peers.
#[derive(Default)]
pub struct DownloadCoordinator {
    peers: HashMap<NodeId, PeerSyncState>,
    in_flight: HashMap<Hash256, Vec<NodeId>>,
    /// Delivery attribution for misbehavior scoring after async validation.
    block_sources: HashMap<Hash256, NodeId>,
    queued_validated_headers: usize,
    preferred_download_count: usize,
}

impl DownloadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_peer(&mut self, peer: NodeId) {
        self.peers.entry(peer).or_default();
    }

    pub fn finalize_peer(&mut self, peer: NodeId) {
        let Some(state) = self.peers.remove(&peer) else {
            return;
        };
        if state.preferred_download {
            self.preferred_download_count -= 1;
        }
        for entry in state.blocks_in_flight {
            if entry.validated_header {
                self.queued_validated_headers -= 1;
            }
            if let Some(holders) = self.in_flight.get_mut(&entry.hash) {
                holders.retain(|holder| *holder != peer);
                if holders.is_empty() {
                    self.in_flight.remove(&entry.hash);
                }
            }
        }
    }

    pub fn peer(&self, peer: NodeId) -> Option<&PeerSyncState> {
        self.peers.get(&peer)
    }

    pub fn peer_mut(&mut self, peer: NodeId) -> Option<&mut PeerSyncState> {
        self.peers.get_mut(&peer)
    }

    pub fn preferred_download_count(&self) -> usize {
        self.preferred_download_count
    }

    pub fn set_preferred_download(&mut self, peer: NodeId, preferred: bool) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        if state.preferred_download != preferred {
            state.preferred_download = preferred;
            if preferred {
                self.preferred_download_count += 1;
            } else {
                self.preferred_download_count -= 1;
            }
        }
    }

    pub fn is_in_flight(&self, hash: &Hash256) -> bool {
        self.in_flight.contains_key(hash)
    }

    pub fn nodes_with_queued(&self, hash: &Hash256) -> HashSet<NodeId> {
        self.in_flight
            .get(hash)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Peer that delivered a block, recorded when the request completes.
    pub fn block_source(&self, hash: &Hash256) -> Option<NodeId> {
        self.block_sources.get(hash).copied()
    }

    /// Update which block we believe a peer has, once its header is known.
    pub fn update_block_availability(
        &mut self,
        index: &BlockIndex,
        peer: NodeId,
        hash: &Hash256,
    ) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        match index.lookup(hash) {
            Some(id) if !index.entry(id).chain_work.is_zero() => {
                let better = state
                    .best_known_block
                    .map(|best| index.entry(id).chain_work >= index.entry(best).chain_work)
                    .unwrap_or(true);
                if better {
                    state.best_known_block = Some(id);
                }
                state.last_unknown_block = None;
            }
            _ => state.last_unknown_block = Some(*hash),
        }
    }

    /// Deadline for a block requested now: generous early in sync, tight
    /// once header-validated requests pile up.
    pub fn block_request_timeout(
        now_micros: i64,
        target_spacing: i64,
        queued_validated_headers: usize,
    ) -> i64 {
        now_micros + 500_000 * target_spacing * (4 + queued_validated_headers as i64)
    }

    pub fn mark_block_in_flight(
        &mut self,
        peer: NodeId,
        hash: Hash256,
        id: Option<BlockIndexId>,
        now_micros: i64,
        target_spacing: i64,
    ) {
        let timeout =
            Self::block_request_timeout(now_micros, target_spacing, self.queued_validated_headers);
        let validated_header = id.is_some();
        if validated_header {
            self.queued_validated_headers += 1;
        }
        let state = self.peers.entry(peer).or_default();
        state.blocks_in_flight.push_back(InFlightBlock {
            hash,
            id,
            request_time_micros: now_micros,
            timeout_micros: timeout,
            validated_header,
        });
        if state.blocks_in_flight.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            eprintln!(
                "warning: too many blocks in flight ({} of max {}) for peer={peer}",
                state.blocks_in_flight.len(),
                MAX_BLOCKS_IN_TRANSIT_PER_PEER,
            );
        }
        self.in_flight.entry(hash).or_default().push(peer);
    }

    /// A block arrived; release every request for it. Returns whether any
    /// peer had it in flight (i.e. the block was requested).
    pub fn mark_block_as_received(&mut self, hash: &Hash256, from: Option<NodeId>) -> bool {
        if let Some(peer) = from {
            self.block_sources.insert(*hash, peer);
        }
        let Some(holders) = self.in_flight.remove(hash) else {
            return false;
        };
        for holder in &holders {
            if let Some(state) = self.peers.get_mut(holder) {
                if let Some(pos) = state
                    .blocks_in_flight
                    .iter()
                    .position(|entry| entry.hash == *hash)
                {
                    let entry = state.blocks_in_flight.remove(pos).expect("position valid");
                    if entry.validated_header {
                        self.queued_validated_headers -= 1;
                    }
                }
                // The window is moving again for this peer.
                state.stalling_since = 0;
            }
        }
        !holders.is_empty()
    }

    /// Select up to `count` blocks to request from `peer`, walking forward
    /// from the last common block within the download window. When the peer
    /// contributes nothing but would unblock the window if it were one
    /// larger, the set of peers holding the blocking block is returned for
    /// stall accounting.
    pub fn find_next_blocks_to_download(
        &mut self,
        index: &BlockIndex,
        chain: &ChainView,
        peer: NodeId,
        count: usize,
    ) -> (Vec<BlockIndexId>, Option<HashSet<NodeId>>) {
        let mut blocks = Vec::new();
        if count == 0 {
            return (blocks, None);
        }

        // Refresh the peer's best known block from any pending announcement.
        if let Some(state) = self.peers.get_mut(&peer) {
            if let Some(unknown) = state.last_unknown_block {
                if let Some(id) = index.lookup(&unknown) {
                    if !index.entry(id).chain_work.is_zero() {
                        let better = state
                            .best_known_block
                            .map(|best| {
                                index.entry(id).chain_work >= index.entry(best).chain_work
                            })
                            .unwrap_or(true);
                        if better {
                            state.best_known_block = Some(id);
                        }
                        state.last_unknown_block = None;
                    }
                }
            }
        }
        let Some(state) = self.peers.get(&peer) else {
            return (blocks, None);
        };
        let Some(best_known) = state.best_known_block else {
            return (blocks, None);
        };
        let tip_work = chain
            .tip()
            .map(|tip| index.entry(tip).chain_work)
            .unwrap_or_default();
        if index.entry(best_known).chain_work < tip_work {
            // This peer has nothing interesting.
            return (blocks, None);
        }

        // Bootstrap the common-block guess near our tip; wrong guesses in
        // either direction correct themselves below.
        let mut last_common = match state.last_common_block {
            Some(id) => id,
            None => {
                let guess_height = index.entry(best_known).height.min(chain.height());
                match chain.at(guess_height.max(0)) {
                    Some(id) => id,
                    None => return (blocks, None),
                }
            }
        };
        last_common = match index.last_common_ancestor(last_common, best_known) {
            Some(id) => id,
            None => return (blocks, None),
        };
        if let Some(state) = self.peers.get_mut(&peer) {
            state.last_common_block = Some(last_common);
        }
        if last_common == best_known {
            return (blocks, None);
        }

        let window_end = index.entry(last_common).height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = index.entry(best_known).height.min(window_end + 1);
        let mut waiting_for: HashSet<NodeId> = HashSet::new();
        let mut walk = last_common;
        let mut staller = None;

        'walk: while index.entry(walk).height < max_height {
            // Fetch ancestors in batches; ancestor() costs as much as a
            // short linear scan anyway.
            let remaining = max_height - index.entry(walk).height;
            let step = remaining.min((count as i32 - blocks.len() as i32).max(WALK_BATCH));
            let target_height = index.entry(walk).height + step;
            let Some(batch_top) = index.ancestor(best_known, target_height) else {
                break;
            };
            let mut to_fetch = vec![batch_top];
            let mut back = index.entry(batch_top).prev;
            while let Some(id) = back {
                if id == walk {
                    break;
                }
                to_fetch.push(id);
                back = index.entry(id).prev;
            }
            walk = batch_top;

            for id in to_fetch.into_iter().rev() {
                let entry = index.entry(id);
                if !entry.is_valid(status::VALID_TREE) {
                    // The chain this peer is on is invalid.
                    return (Vec::new(), None);
                }
                if entry.have_data() || chain.contains(index, id) {
                    if entry.chain_tx != 0 {
                        if let Some(state) = self.peers.get_mut(&peer) {
                            state.last_common_block = Some(id);
                        }
                    }
                } else if !self.in_flight.contains_key(&entry.hash) {
                    if entry.height > window_end {
                        // The window is exhausted for this peer.
                        if blocks.is_empty() && !waiting_for.contains(&peer) {
                            // We would fetch this block if the window were
                            // one larger; whoever holds it is stalling us.
                            staller = Some(waiting_for.clone());
                        }
                        break 'walk;
                    }
                    blocks.push(id);
                    if blocks.len() == count {
                        break 'walk;
                    }
                } else if waiting_for.is_empty() {
                    // First already-in-flight block in the window.
                    waiting_for = self.nodes_with_queued(&entry.hash);
                }
            }
        }
        (blocks, staller)
    }

    /// Record that a peer is blocking the window; returns peers whose stall
    /// or request timeouts have expired and should be disconnected.
    pub fn note_stalling(&mut self, stallers: &HashSet<NodeId>, now_seconds: i64) {
        for peer in stallers {
            if let Some(state) = self.peers.get_mut(peer) {
                if state.stalling_since == 0 {
                    state.stalling_since = now_seconds;
                }
            }
        }
    }

    /// Peers to disconnect: stalled beyond the stall timeout, or sitting on
    /// an expired front-of-queue block request.
    pub fn check_timeouts(&mut self, now_seconds: i64, now_micros: i64) -> Vec<NodeId> {
        let mut disconnect = Vec::new();
        for (peer, state) in &self.peers {
            if state.stalling_since != 0
                && state.stalling_since < now_seconds - BLOCK_STALLING_TIMEOUT
            {
                eprintln!("peer={peer} is stalling block download, disconnecting");
                disconnect.push(*peer);
                continue;
            }
            if let Some(front) = state.blocks_in_flight.front() {
                if front.timeout_micros < now_micros {
                    eprintln!("block download timeout from peer={peer}, disconnecting");
                    disconnect.push(*peer);
                }
            }
        }
        disconnect
    }

    /// Re-tighten the front request's deadline as validated headers queue
    /// up; called every scheduling tick.
    pub fn retighten_front_timeouts(&mut self, target_spacing: i64) {
        let queued = self.queued_validated_headers;
        for state in self.peers.values_mut() {
            if let Some(front) = state.blocks_in_flight.front_mut() {
                let tightened = Self::block_request_timeout(
                    front.request_time_micros,
                    target_spacing,
                    queued,
                );
                front.timeout_micros = front.timeout_micros.min(tightened);
            }
        }
    }

    pub fn queued_validated_headers(&self) -> usize {
        self.queued_validated_headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_scales_with_queued_headers() {
        let base = DownloadCoordinator::block_request_timeout(0, 600, 0);
        assert_eq!(base, 500_000 * 600 * 4);
        let queued = DownloadCoordinator::block_request_timeout(0, 600, 3);
        assert_eq!(queued, 500_000 * 600 * 7);
    }

    #[test]
    fn in_flight_bookkeeping_is_symmetric() {
        let mut coordinator = DownloadCoordinator::new();
        coordinator.init_peer(7);
        coordinator.mark_block_in_flight(7, [1u8; 32], Some(0), 0, 600);
        assert!(coordinator.is_in_flight(&[1u8; 32]));
        assert_eq!(coordinator.queued_validated_headers(), 1);

        assert!(coordinator.mark_block_as_received(&[1u8; 32], Some(7)));
        assert!(!coordinator.is_in_flight(&[1u8; 32]));
        assert_eq!(coordinator.queued_validated_headers(), 0);
        assert_eq!(coordinator.block_source(&[1u8; 32]), Some(7));
        // Receiving again reports unrequested.
        assert!(!coordinator.mark_block_as_received(&[1u8; 32], None));
    }

    #[test]
    fn finalize_releases_peer_requests() {
        let mut coordinator = DownloadCoordinator::new();
        coordinator.init_peer(1);
        coordinator.set_preferred_download(1, true);
        coordinator.mark_block_in_flight(1, [2u8; 32], Some(0), 0, 600);
        coordinator.finalize_peer(1);
        assert!(!coordinator.is_in_flight(&[2u8; 32]));
        assert_eq!(coordinator.preferred_download_count(), 0);
        assert_eq!(coordinator.queued_validated_headers(), 0);
    }

    #[test]
    fn stalling_peers_time_out() {
        let mut coordinator = DownloadCoordinator::new();
        coordinator.init_peer(3);
        let stallers: HashSet<NodeId> = [3].into_iter().collect();
        coordinator.note_stalling(&stallers, 100);
        assert!(coordinator.check_timeouts(101, 0).is_empty());
        assert_eq!(coordinator.check_timeouts(103, 0), vec![3]);
    }
}
