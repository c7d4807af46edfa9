//! The active branch as an O(1)-indexed vector over the block index.

use emberd_consensus::constants::MAX_BLOCK_SIZE;
use emberd_consensus::Hash256;

use crate::blockindex::{BlockIndex, BlockIndexId};

pub type TipObserver = Box<dyn Fn(Option<BlockIndexId>, Option<BlockIndexId>) + Send>;

#[derive(Default)]
pub struct ChainView {
    chain: Vec<BlockIndexId>,
    observers: Vec<TipObserver>,
}

impl ChainView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<BlockIndexId> {
        self.chain.first().copied()
    }

    pub fn tip(&self) -> Option<BlockIndexId> {
        self.chain.last().copied()
    }

    /// Height of the tip; -1 for an empty chain.
    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<BlockIndexId> {
        if height < 0 {
            return None;
        }
        self.chain.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: BlockIndexId) -> bool {
        self.at(index.entry(id).height) == Some(id)
    }

    pub fn next(&self, index: &BlockIndex, id: BlockIndexId) -> Option<BlockIndexId> {
        if !self.contains(index, id) {
            return None;
        }
        self.at(index.entry(id).height + 1)
    }

    /// Replace the tip, truncating or extending the vector to match, and
    /// notify observers of the change.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<BlockIndexId>) {
        let old = self.tip();
        match tip {
            None => self.chain.clear(),
            Some(tip_id) => {
                let height = index.entry(tip_id).height;
                self.chain.resize((height + 1) as usize, tip_id);
                let mut walk = Some(tip_id);
                while let Some(id) = walk {
                    let entry_height = index.entry(id).height as usize;
                    if self.chain[entry_height] == id && entry_height != height as usize {
                        break;
                    }
                    self.chain[entry_height] = id;
                    walk = index.entry(id).prev;
                }
            }
        }
        let new = self.tip();
        for observer in &self.observers {
            observer(old, new);
        }
    }

    pub fn add_tip_observer(&mut self, observer: TipObserver) {
        self.observers.push(observer);
    }

    /// Exponentially sparse locator describing this chain to a peer.
    pub fn locator(&self, index: &BlockIndex, from: Option<BlockIndexId>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut walk = from.or_else(|| self.tip());
        let mut step = 1i32;
        while let Some(id) = walk {
            let entry = index.entry(id);
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            let next_height = (entry.height - step).max(0);
            // Back off exponentially once the locator has ten entries.
            if hashes.len() > 10 {
                step *= 2;
            }
            walk = if self.contains(index, id) {
                self.at(next_height)
            } else {
                index.ancestor(id, next_height)
            };
        }
        hashes
    }

    /// Deepest entry shared between this chain and the branch ending at `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: BlockIndexId) -> Option<BlockIndexId> {
        let mut walk = Some(id);
        if let Some(walk_id) = walk {
            if index.entry(walk_id).height > self.height() {
                walk = index.ancestor(walk_id, self.height());
            }
        }
        while let Some(walk_id) = walk {
            if self.contains(index, walk_id) {
                return Some(walk_id);
            }
            walk = index.entry(walk_id).prev;
        }
        None
    }

    /// The block size cap recorded at the tip.
    pub fn max_block_size(&self, index: &BlockIndex) -> u64 {
        match self.tip() {
            Some(tip) => index.entry(tip).max_block_size.max(MAX_BLOCK_SIZE),
            None => MAX_BLOCK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::block::BlockHeader;
    use primitive_types::U256;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn build_chain(index: &mut BlockIndex, count: i32) -> Vec<BlockIndexId> {
        let mut ids = Vec::new();
        let mut prev = None;
        for height in 0..count {
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&(height as u32 + 1).to_le_bytes());
            let header = BlockHeader {
                version: 0x2000_0000,
                prev_block: prev.map(|id| index.entry(id).hash).unwrap_or([0u8; 32]),
                merkle_root: [0u8; 32],
                time: height as u32,
                bits: 0x207f_ffff,
                nonce: 0,
            };
            let id = index.add_header(hash, &header, prev, U256::from(2u64));
            ids.push(id);
            prev = Some(id);
        }
        ids
    }

    #[test]
    fn set_tip_truncates_and_extends() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 8);
        let mut chain = ChainView::new();
        chain.set_tip(&index, Some(ids[7]));
        assert_eq!(chain.height(), 7);
        assert_eq!(chain.genesis(), Some(ids[0]));
        assert!(chain.contains(&index, ids[3]));
        assert_eq!(chain.next(&index, ids[3]), Some(ids[4]));

        chain.set_tip(&index, Some(ids[4]));
        assert_eq!(chain.height(), 4);
        assert!(!chain.contains(&index, ids[7]));
    }

    #[test]
    fn observers_fire_on_every_tip_change() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 3);
        let mut chain = ChainView::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        chain.add_tip_observer(Box::new(move |_, _| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        chain.set_tip(&index, Some(ids[0]));
        chain.set_tip(&index, Some(ids[2]));
        chain.set_tip(&index, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn locator_is_sparse_and_anchored_at_genesis() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 100);
        let mut chain = ChainView::new();
        chain.set_tip(&index, Some(ids[99]));
        let locator = chain.locator(&index, None);
        assert_eq!(locator[0], index.entry(ids[99]).hash);
        assert_eq!(*locator.last().unwrap(), index.entry(ids[0]).hash);
        assert!(locator.len() < 25);
    }

    #[test]
    fn find_fork_walks_to_shared_ancestor() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 6);
        let mut chain = ChainView::new();
        chain.set_tip(&index, Some(trunk[5]));

        let header = BlockHeader {
            version: 0x2000_0000,
            prev_block: index.entry(trunk[2]).hash,
            merkle_root: [1u8; 32],
            time: 77,
            bits: 0x207f_ffff,
            nonce: 1,
        };
        let branch = index.add_header([0xee; 32], &header, Some(trunk[2]), U256::from(2u64));
        assert_eq!(chain.find_fork(&index, branch), Some(trunk[2]));
        assert_eq!(chain.find_fork(&index, trunk[5]), Some(trunk[5]));
    }
}
