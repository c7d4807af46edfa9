//! The in-memory DAG of every known block header.

use std::collections::{BTreeSet, HashMap};

use emberd_consensus::Hash256;
use emberd_primitives::block::BlockHeader;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;

/// Index into the append-only entry arena. Entries are never removed for the
/// lifetime of the process.
pub type BlockIndexId = u32;

pub mod status {
    pub const VALID_HEADER: u32 = 1;
    /// Parent headers known and valid back to genesis.
    pub const VALID_TREE: u32 = 2;
    /// Full block data received and context-free checks passed.
    pub const VALID_TRANSACTIONS: u32 = 3;
    pub const VALID_CHAIN: u32 = 4;
    /// Scripts verified; the block has been connected at least once.
    pub const VALID_SCRIPTS: u32 = 5;
    pub const VALID_MASK: u32 = 0x07;

    pub const HAVE_DATA: u32 = 0x08;
    pub const HAVE_UNDO: u32 = 0x10;
    pub const FAILED_VALID: u32 = 0x20;
    pub const FAILED_CHILD: u32 = 0x40;
    pub const FAILED_MASK: u32 = FAILED_VALID | FAILED_CHILD;
}

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Option<BlockIndexId>,
    /// Deterministic far-back ancestor enabling O(log n) ancestor walks.
    pub skip: Option<BlockIndexId>,
    pub height: i32,
    /// Total work on the branch ending in this block.
    pub chain_work: U256,
    pub status: u32,
    pub n_tx: u32,
    /// Transactions in this block and all ancestors; zero while any ancestor
    /// is missing data.
    pub chain_tx: u64,
    pub file: Option<u32>,
    pub data_pos: u64,
    pub undo_pos: u64,
    /// Arrival order stamp, assigned when full block data first arrives.
    /// Zero for entries loaded from disk.
    pub sequence_id: u64,
    pub time_data_received: i64,
    /// The size cap that applied to this block.
    pub max_block_size: u64,
    /// Size-limit vote parsed from this block's coinbase.
    pub max_block_size_vote: u64,

    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockIndexEntry {
    fn empty(hash: Hash256) -> Self {
        Self {
            hash,
            prev: None,
            skip: None,
            height: 0,
            chain_work: U256::zero(),
            status: 0,
            n_tx: 0,
            chain_tx: 0,
            file: None,
            data_pos: 0,
            undo_pos: 0,
            sequence_id: 0,
            time_data_received: 0,
            max_block_size: 0,
            max_block_size_vote: 0,
            version: 0,
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        }
    }

    pub fn is_valid(&self, up_to: u32) -> bool {
        debug_assert!(up_to <= status::VALID_MASK);
        if self.status & status::FAILED_MASK != 0 {
            return false;
        }
        self.status & status::VALID_MASK >= up_to
    }

    pub fn failed(&self) -> bool {
        self.status & status::FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & status::HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & status::HAVE_UNDO != 0
    }

    /// Serialized subset persisted per entry; `chain_work`, `chain_tx`,
    /// `skip` and `sequence_id` are recomputed on load.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.n_tx);
        encoder.write_u32_le(self.file.unwrap_or(u32::MAX));
        encoder.write_u64_le(self.data_pos);
        encoder.write_u64_le(self.undo_pos);
        encoder.write_u64_le(self.max_block_size);
        encoder.write_u64_le(self.max_block_size_vote);
        encoder.write_i64_le(self.time_data_received);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    /// Decode a persisted entry; the previous-block hash is returned for
    /// relinking since arena ids are not stable across restarts.
    pub fn decode(hash: Hash256, prev_hash: &mut Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut entry = Self::empty(hash);
        entry.height = decoder.read_i32_le()?;
        entry.status = decoder.read_u32_le()?;
        entry.n_tx = decoder.read_u32_le()?;
        let file = decoder.read_u32_le()?;
        entry.file = if file == u32::MAX { None } else { Some(file) };
        entry.data_pos = decoder.read_u64_le()?;
        entry.undo_pos = decoder.read_u64_le()?;
        entry.max_block_size = decoder.read_u64_le()?;
        entry.max_block_size_vote = decoder.read_u64_le()?;
        entry.time_data_received = decoder.read_i64_le()?;
        entry.version = decoder.read_i32_le()?;
        entry.merkle_root = decoder.read_hash()?;
        entry.time = decoder.read_u32_le()?;
        entry.bits = decoder.read_u32_le()?;
        entry.nonce = decoder.read_u32_le()?;
        *prev_hash = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(entry)
    }

    pub fn encode_with_prev(&self, prev_hash: &Hash256) -> Vec<u8> {
        let mut bytes = self.encode();
        bytes.extend_from_slice(prev_hash);
        bytes
    }
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Deterministic height the skip pointer of a block at `height` jumps to.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    // Walks favor lowering the height by exact powers of two.
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockIndexId>,
    dirty: BTreeSet<BlockIndexId>,
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_hash: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: BlockIndexId) -> &BlockIndexEntry {
        &self.entries[id as usize]
    }

    pub fn entry_mut(&mut self, id: BlockIndexId) -> &mut BlockIndexEntry {
        &mut self.entries[id as usize]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockIndexId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockIndexId> {
        0..self.entries.len() as BlockIndexId
    }

    /// Idempotent creation of an unlinked shell, used when streaming entries
    /// from disk.
    pub fn insert_shell(&mut self, hash: Hash256) -> BlockIndexId {
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let id = self.entries.len() as BlockIndexId;
        self.entries.push(BlockIndexEntry::empty(hash));
        self.by_hash.insert(hash, id);
        id
    }

    /// Create or return the entry for a checked header, linking it under its
    /// parent and raising validity to VALID_TREE.
    pub fn add_header(
        &mut self,
        hash: Hash256,
        header: &BlockHeader,
        prev: Option<BlockIndexId>,
        work: U256,
    ) -> BlockIndexId {
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let id = self.insert_shell(hash);
        {
            let (height, prev_work) = match prev {
                Some(prev_id) => {
                    let prev_entry = self.entry(prev_id);
                    (prev_entry.height + 1, prev_entry.chain_work)
                }
                None => (0, U256::zero()),
            };
            let entry = self.entry_mut(id);
            entry.prev = prev;
            entry.height = height;
            entry.chain_work = prev_work + work;
            entry.version = header.version;
            entry.merkle_root = header.merkle_root;
            entry.time = header.time;
            entry.bits = header.bits;
            entry.nonce = header.nonce;
        }
        self.build_skip(id);
        self.raise_validity(id, status::VALID_TREE);
        self.dirty.insert(id);
        id
    }

    pub fn build_skip(&mut self, id: BlockIndexId) {
        let (prev, height) = {
            let entry = self.entry(id);
            (entry.prev, entry.height)
        };
        let skip = prev.and_then(|prev_id| self.ancestor(prev_id, skip_height(height)));
        self.entry_mut(id).skip = skip;
    }

    /// Ancestor of `id` at `height`, following skip pointers where they help.
    pub fn ancestor(&self, id: BlockIndexId, height: i32) -> Option<BlockIndexId> {
        let mut walk = id;
        let mut walk_height = self.entry(id).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let entry = self.entry(walk);
            let height_skip = skip_height(walk_height);
            let height_skip_prev = skip_height(walk_height - 1);
            match entry.skip {
                // Use the skip pointer when it lands on target, or jumps past
                // it without being only marginally better than single-stepping.
                Some(skip)
                    if height_skip == height
                        || (height_skip > height
                            && !(height_skip_prev < height_skip - 2
                                && height_skip_prev >= height)) =>
                {
                    walk = skip;
                    walk_height = height_skip;
                }
                _ => {
                    walk = entry.prev?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    pub fn last_common_ancestor(
        &self,
        a: BlockIndexId,
        b: BlockIndexId,
    ) -> Option<BlockIndexId> {
        let (mut a, mut b) = (a, b);
        let height = self.entry(a).height.min(self.entry(b).height);
        a = self.ancestor(a, height)?;
        b = self.ancestor(b, height)?;
        while a != b {
            a = self.entry(a).prev?;
            b = self.entry(b).prev?;
        }
        Some(a)
    }

    /// Median of the previous 11 block times, the contextual lower bound on
    /// a child's timestamp.
    pub fn median_time_past(&self, id: BlockIndexId) -> i64 {
        let mut times = Vec::with_capacity(11);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == 11 {
                break;
            }
            let entry = self.entry(current);
            times.push(entry.time as i64);
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Monotonically promote the validity level; returns whether it changed.
    pub fn raise_validity(&mut self, id: BlockIndexId, level: u32) -> bool {
        debug_assert!(level <= status::VALID_MASK);
        let entry = self.entry_mut(id);
        if entry.status & status::FAILED_MASK != 0 {
            return false;
        }
        if entry.status & status::VALID_MASK < level {
            entry.status = (entry.status & !status::VALID_MASK) | level;
            self.dirty.insert(id);
            return true;
        }
        false
    }

    pub fn mark_dirty(&mut self, id: BlockIndexId) {
        self.dirty.insert(id);
    }

    pub fn take_dirty(&mut self) -> Vec<BlockIndexId> {
        let ids: Vec<BlockIndexId> = self.dirty.iter().copied().collect();
        self.dirty.clear();
        ids
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn header_for(&self, id: BlockIndexId) -> BlockHeader {
        let entry = self.entry(id);
        let prev_block = match entry.prev {
            Some(prev_id) => self.entry(prev_id).hash,
            None => [0u8; 32],
        };
        BlockHeader {
            version: entry.version,
            prev_block,
            merkle_root: entry.merkle_root,
            time: entry.time,
            bits: entry.bits,
            nonce: entry.nonce,
        }
    }

    pub fn prev_hash(&self, id: BlockIndexId) -> Hash256 {
        match self.entry(id).prev {
            Some(prev_id) => self.entry(prev_id).hash,
            None => [0u8; 32],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(index: &mut BlockIndex, length: i32) -> Vec<BlockIndexId> {
        let mut ids = Vec::new();
        let mut prev = None;
        for height in 0..length {
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&(height as u32).to_le_bytes());
            let header = BlockHeader {
                version: 0x2000_0000,
                prev_block: prev
                    .map(|id| index.entry(id).hash)
                    .unwrap_or([0u8; 32]),
                merkle_root: [0u8; 32],
                time: 1_000 + height as u32 * 600,
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
    fn heights_and_work_accumulate() {
        let mut index = BlockIndex::new();
        let ids = chain_of(&mut index, 10);
        assert_eq!(index.entry(ids[9]).height, 9);
        assert_eq!(index.entry(ids[9]).chain_work, U256::from(20u64));
        assert!(index.entry(ids[9]).chain_work > index.entry(ids[8]).chain_work);
    }

    #[test]
    fn ancestor_walks_match_linear_walk() {
        let mut index = BlockIndex::new();
        let ids = chain_of(&mut index, 200);
        for target in [0, 1, 2, 63, 64, 65, 128, 199] {
            assert_eq!(
                index.ancestor(ids[199], target),
                Some(ids[target as usize]),
                "ancestor at height {target}"
            );
        }
        assert_eq!(index.ancestor(ids[10], 11), None);
    }

    #[test]
    fn skip_heights_are_deterministic_and_lower() {
        for height in 2..1_000 {
            let skip = skip_height(height);
            assert!(skip < height);
            assert!(skip >= 0);
        }
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let mut index = BlockIndex::new();
        let ids = chain_of(&mut index, 20);
        // Times are 1000 + 600h; the median of heights 9..=19 is height 14.
        assert_eq!(index.median_time_past(ids[19]), 1_000 + 600 * 14);
        // Short chains take the median of what exists.
        assert_eq!(index.median_time_past(ids[0]), 1_000);
    }

    #[test]
    fn validity_is_monotonic_and_respects_failure() {
        let mut index = BlockIndex::new();
        let ids = chain_of(&mut index, 2);
        assert_eq!(
            index.entry(ids[1]).status & status::VALID_MASK,
            status::VALID_TREE
        );
        assert!(index.raise_validity(ids[1], status::VALID_TRANSACTIONS));
        assert!(!index.raise_validity(ids[1], status::VALID_TREE));
        index.entry_mut(ids[1]).status |= status::FAILED_VALID;
        assert!(!index.raise_validity(ids[1], status::VALID_SCRIPTS));
    }

    #[test]
    fn entries_roundtrip_through_disk_form() {
        let mut index = BlockIndex::new();
        let ids = chain_of(&mut index, 3);
        let entry = index.entry(ids[2]).clone();
        let prev_hash = index.prev_hash(ids[2]);
        let bytes = entry.encode_with_prev(&prev_hash);
        let mut decoded_prev = [0u8; 32];
        let decoded = BlockIndexEntry::decode(entry.hash, &mut decoded_prev, &bytes).unwrap();
        assert_eq!(decoded.height, entry.height);
        assert_eq!(decoded.status, entry.status);
        assert_eq!(decoded.bits, entry.bits);
        assert_eq!(decoded_prev, prev_hash);
    }

    #[test]
    fn last_common_ancestor_finds_fork_point() {
        let mut index = BlockIndex::new();
        let trunk = chain_of(&mut index, 5);
        // Branch off height 2.
        let mut prev = Some(trunk[2]);
        let mut branch = Vec::new();
        for i in 0..3 {
            let mut hash = [0xb0u8; 32];
            hash[0] = i;
            let header = BlockHeader {
                version: 0x2000_0000,
                prev_block: index.entry(prev.unwrap()).hash,
                merkle_root: [0u8; 32],
                time: 9_000 + i as u32,
                bits: 0x207f_ffff,
                nonce: 0,
            };
            let id = index.add_header(hash, &header, prev, U256::from(2u64));
            branch.push(id);
            prev = Some(id);
        }
        assert_eq!(
            index.last_common_ancestor(trunk[4], branch[2]),
            Some(trunk[2])
        );
    }
}
