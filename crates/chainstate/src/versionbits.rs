//! Unified per-deployment soft-fork state machine over signal windows.

use std::collections::HashMap;

use emberd_consensus::constants::{VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK};
use emberd_consensus::{ForkDeployment, Hash256};

use crate::blockindex::{BlockIndex, BlockIndexId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

#[derive(Clone, Copy, Debug)]
struct StateEntry {
    state: ThresholdState,
    /// Height of the window end where lock-in occurred.
    locked_in_height: i64,
    /// Median time past at the lock-in window end.
    locked_in_mtp: i64,
}

/// Memoized deployment states keyed by (deployment position, window-end
/// block hash). Cleared on unload and on reconsideration.
#[derive(Default)]
pub struct VersionBitsCache {
    entries: HashMap<(usize, Hash256), StateEntry>,
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Whether a header signals for `bit`.
pub fn block_signals(version: i32, bit: u32) -> bool {
    (version as u32 & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS as u32
        && (version >> bit) & 1 == 1
}

/// State of a deployment for a block whose parent is `prev`.
pub fn versionbits_state(
    index: &BlockIndex,
    cache: &mut VersionBitsCache,
    prev: Option<BlockIndexId>,
    pos: usize,
    deployment: &ForkDeployment,
) -> ThresholdState {
    let window = deployment.window_size.max(1);

    // Rewind to the last block of the fully completed window before us.
    let mut walk = prev.and_then(|prev_id| {
        let height = index.entry(prev_id).height as i64;
        let target = height - ((height + 1) % window);
        if target < 0 {
            None
        } else {
            index.ancestor(prev_id, target as i32)
        }
    });

    // Collect window ends until a cached state or the chain start.
    let mut to_compute: Vec<BlockIndexId> = Vec::new();
    let mut state = StateEntry {
        state: ThresholdState::Defined,
        locked_in_height: 0,
        locked_in_mtp: 0,
    };
    while let Some(id) = walk {
        let key = (pos, index.entry(id).hash);
        if let Some(cached) = cache.entries.get(&key) {
            state = *cached;
            break;
        }
        to_compute.push(id);
        let height = index.entry(id).height as i64;
        let target = height - window;
        walk = if target < 0 {
            None
        } else {
            index.ancestor(id, target as i32)
        };
    }

    // Replay forward one window at a time.
    while let Some(id) = to_compute.pop() {
        let window_end = index.entry(id);
        let mtp = index.median_time_past(id);
        let height = window_end.height as i64;
        state = match state.state {
            ThresholdState::Defined => {
                if mtp >= deployment.timeout {
                    StateEntry {
                        state: ThresholdState::Failed,
                        ..state
                    }
                } else if mtp >= deployment.start_time {
                    StateEntry {
                        state: ThresholdState::Started,
                        ..state
                    }
                } else {
                    state
                }
            }
            ThresholdState::Started => {
                let signals = count_signals(index, id, window, pos as u32);
                if signals >= deployment.threshold {
                    StateEntry {
                        state: ThresholdState::LockedIn,
                        locked_in_height: height,
                        locked_in_mtp: mtp,
                    }
                } else if mtp >= deployment.timeout {
                    StateEntry {
                        state: ThresholdState::Failed,
                        ..state
                    }
                } else {
                    state
                }
            }
            ThresholdState::LockedIn => {
                let required_windows =
                    (deployment.min_locked_blocks + window - 1) / window;
                let required_windows = required_windows.max(1);
                let windows_locked = (height - state.locked_in_height) / window;
                if windows_locked >= required_windows
                    && mtp >= state.locked_in_mtp + deployment.min_locked_time
                {
                    StateEntry {
                        state: ThresholdState::Active,
                        ..state
                    }
                } else {
                    state
                }
            }
            ThresholdState::Active | ThresholdState::Failed => state,
        };
        cache.entries.insert((pos, window_end.hash), state);
    }

    state.state
}

pub fn deployment_active(
    index: &BlockIndex,
    cache: &mut VersionBitsCache,
    prev: Option<BlockIndexId>,
    pos: usize,
    deployment: &ForkDeployment,
) -> bool {
    versionbits_state(index, cache, prev, pos, deployment) == ThresholdState::Active
}

fn count_signals(index: &BlockIndex, window_end: BlockIndexId, window: i64, bit: u32) -> i64 {
    let mut count = 0;
    let mut walk = Some(window_end);
    for _ in 0..window {
        let Some(id) = walk else { break };
        let entry = index.entry(id);
        if block_signals(entry.version, bit) {
            count += 1;
        }
        walk = entry.prev;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::block::BlockHeader;
    use primitive_types::U256;

    const WINDOW: i64 = 8;
    const THRESHOLD: i64 = 6;

    fn deployment() -> ForkDeployment {
        ForkDeployment {
            name: "testdummy",
            gbt_force: true,
            start_time: 1_000,
            timeout: 100_000,
            window_size: WINDOW,
            threshold: THRESHOLD,
            min_locked_blocks: 0,
            min_locked_time: 0,
        }
    }

    /// Append a block with the given version; times advance 600s per block.
    fn extend(
        index: &mut BlockIndex,
        prev: Option<BlockIndexId>,
        version: i32,
        salt: u32,
    ) -> BlockIndexId {
        let height = prev.map(|id| index.entry(id).height + 1).unwrap_or(0);
        let mut hash = [0u8; 32];
        hash[..4].copy_from_slice(&salt.to_le_bytes());
        hash[4..8].copy_from_slice(&(height as u32).to_le_bytes());
        let header = BlockHeader {
            version,
            prev_block: prev.map(|id| index.entry(id).hash).unwrap_or([0u8; 32]),
            merkle_root: [0u8; 32],
            time: 10_000 + height as u32 * 600,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        index.add_header(hash, &header, prev, U256::from(2u64))
    }

    fn build(index: &mut BlockIndex, versions: &[i32]) -> Option<BlockIndexId> {
        let mut prev = None;
        for (i, version) in versions.iter().enumerate() {
            prev = Some(extend(index, prev, *version, i as u32));
        }
        prev
    }

    const SIGNAL: i32 = 0x2000_0000 | (1 << 28);
    const QUIET: i32 = 0x2000_0000;

    #[test]
    fn signal_requires_top_bits_marker() {
        assert!(block_signals(SIGNAL, 28));
        assert!(!block_signals(QUIET, 28));
        // Old-style versions never signal even with the bit set.
        assert!(!block_signals(0x4000_0000_u32 as i32 | (1 << 28), 28));
    }

    #[test]
    fn threshold_locks_in_and_activates() {
        let mut index = BlockIndex::new();
        let mut cache = VersionBitsCache::new();
        let dep = deployment();

        // First window: started (start_time is in the past of every MTP),
        // no signals yet.
        let mut versions = vec![QUIET; WINDOW as usize];
        // Second window: six of eight signal.
        versions.extend([SIGNAL, SIGNAL, SIGNAL, SIGNAL, SIGNAL, SIGNAL, QUIET, QUIET]);
        let tip = build(&mut index, &versions);
        assert_eq!(
            versionbits_state(&index, &mut cache, tip, 28, &dep),
            ThresholdState::LockedIn
        );

        // One more full window flips locked-in to active.
        let mut prev = tip;
        let mut index2 = index;
        for i in 0..WINDOW {
            prev = Some(extend(&mut index2, prev, QUIET, 1_000 + i as u32));
        }
        assert_eq!(
            versionbits_state(&index2, &mut cache, prev, 28, &dep),
            ThresholdState::Active
        );
    }

    #[test]
    fn missing_threshold_fails_after_timeout() {
        let mut index = BlockIndex::new();
        let mut cache = VersionBitsCache::new();
        let mut dep = deployment();
        // Times out long before the chain ends.
        dep.timeout = 12_000;

        let versions = vec![QUIET; (WINDOW * 4) as usize];
        let tip = build(&mut index, &versions);
        assert_eq!(
            versionbits_state(&index, &mut cache, tip, 28, &dep),
            ThresholdState::Failed
        );
    }

    #[test]
    fn min_locked_blocks_delays_activation() {
        let mut index = BlockIndex::new();
        let mut cache = VersionBitsCache::new();
        let mut dep = deployment();
        dep.min_locked_blocks = WINDOW * 2;

        let mut versions = vec![QUIET; WINDOW as usize];
        versions.extend(vec![SIGNAL; WINDOW as usize]);
        // One window after lock-in: still locked.
        versions.extend(vec![QUIET; WINDOW as usize]);
        let tip = build(&mut index, &versions);
        assert_eq!(
            versionbits_state(&index, &mut cache, tip, 28, &dep),
            ThresholdState::LockedIn
        );
    }

    #[test]
    fn states_are_memoized_per_window_end() {
        let mut index = BlockIndex::new();
        let mut cache = VersionBitsCache::new();
        let dep = deployment();
        let versions = vec![QUIET; (WINDOW * 2) as usize];
        let tip = build(&mut index, &versions);
        let first = versionbits_state(&index, &mut cache, tip, 28, &dep);
        assert!(!cache.entries.is_empty());
        let again = versionbits_state(&index, &mut cache, tip, 28, &dep);
        assert_eq!(first, again);
    }
}
