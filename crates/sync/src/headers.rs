//! Header batches and full blocks arriving from peers.

use emberd_chainstate::{ConsensusEngine, ValidationError};
use emberd_consensus::Hash256;
use emberd_primitives::block::{Block, BlockHeader};
use emberd_storage::KeyValueStore;

use crate::download::DownloadCoordinator;
use crate::net::{NetMessage, NodeId, PeerNet};

/// Headers a peer may send in one `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Drives header messages and delivered blocks into the engine, charging
/// misbehavior back to the peers that earned it.
#[derive(Default)]
pub struct HeaderProcessor;

impl HeaderProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Process a batch of headers from a peer. If the batch does not
    /// connect, ask the peer for its ancestors instead of failing it; a
    /// batch that is invalid on its own merits costs the peer score.
    pub fn process_headers<S: KeyValueStore>(
        &self,
        engine: &mut ConsensusEngine<S>,
        coordinator: &mut DownloadCoordinator,
        net: &dyn PeerNet,
        peer: NodeId,
        headers: &[BlockHeader],
    ) -> Result<(), ValidationError> {
        if headers.is_empty() {
            return Ok(());
        }
        if headers.len() > MAX_HEADERS_RESULTS {
            net.misbehaving(peer, 20, "oversized headers message");
            return Err(ValidationError::system("too many headers"));
        }

        // A batch whose first parent is unknown cannot be judged; request
        // the gap instead.
        let first = &headers[0];
        let genesis = engine.params().consensus.hash_genesis_block;
        if first.hash() != genesis && engine.index().lookup(&first.prev_block).is_none() {
            let locator = engine.chain().locator(engine.index(), None);
            net.push_message(
                peer,
                NetMessage::GetHeaders {
                    locator,
                    stop: [0u8; 32],
                },
            );
            return Ok(());
        }

        // Headers within a batch must form a chain.
        let mut expected_prev: Option<Hash256> = None;
        for header in headers {
            if let Some(prev) = expected_prev {
                if header.prev_block != prev {
                    net.misbehaving(peer, 20, "non-continuous headers sequence");
                    return Err(ValidationError::system("non-continuous headers"));
                }
            }
            expected_prev = Some(header.hash());
        }

        let mut last_hash = None;
        for header in headers {
            match engine.accept_header(header) {
                Ok(_) => last_hash = Some(header.hash()),
                Err(err) => {
                    let dos = err.dos_score();
                    if dos > 0 && !err.corruption_possible() {
                        net.misbehaving(peer, dos, "invalid header");
                    }
                    return Err(err);
                }
            }
        }

        if let Some(hash) = last_hash {
            coordinator.update_block_availability(engine.index(), peer, &hash);
        }
        Ok(())
    }

    /// Process a full block delivered by a peer: release its in-flight
    /// claims, accept, activate, and attribute any rejection.
    pub fn process_block<S: KeyValueStore>(
        &self,
        engine: &mut ConsensusEngine<S>,
        coordinator: &mut DownloadCoordinator,
        net: &dyn PeerNet,
        peer: NodeId,
        block: &Block,
        force_processing: bool,
    ) -> Result<(), ValidationError> {
        let hash = block.block_hash();
        let requested = coordinator.mark_block_as_received(&hash, Some(peer));
        let requested = requested || force_processing;

        let accepted = engine.accept_block(block, requested, None);
        if let Err(err) = accepted {
            let dos = err.dos_score();
            if err.is_invalid() && !err.corruption_possible() && dos > 0 {
                net.misbehaving(peer, dos, "invalid block");
            }
            return Err(err);
        }

        let outcome = engine.activate_best_chain(Some(block))?;
        for (rejected_hash, reason) in outcome.invalid {
            if reason.corruption_possible || reason.dos == 0 {
                continue;
            }
            // The connect failure may concern an earlier block of the
            // branch; charge whoever delivered that block.
            if let Some(source) = coordinator.block_source(&rejected_hash) {
                net.misbehaving(source, reason.dos, reason.reason);
            }
        }
        Ok(())
    }
}
