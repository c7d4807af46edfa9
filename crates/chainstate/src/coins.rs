//! Layered UTXO views: persistent coin database, tip cache, scratch caches.

use std::collections::{hash_map::Entry as MapEntry, HashMap};

use emberd_consensus::Hash256;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::outpoint::OutPoint;
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// One unspent transaction output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    Corrupt(&'static str),
    /// `add_coin` without the overwrite escape hatch hit an existing coin.
    DoubleAdd,
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Corrupt(message) => write!(f, "{message}"),
            CoinsError::DoubleAdd => write!(f, "coin already exists for outpoint"),
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

/// Read-only view over a coin set at some best block.
pub trait CoinsView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError>;
}

const BEST_BLOCK_KEY: &[u8] = b"B";
const HEAD_BLOCKS_KEY: &[u8] = b"H";

/// How many coin writes go into one storage batch during a flush. The
/// interrupted-flush head marker exists because a flush spans batches.
const FLUSH_BATCH_OPS: usize = 16_384;

/// The persistent coin database.
pub struct CoinsDb<S> {
    store: S,
}

impl<S> CoinsDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsDb<S> {
    /// The `[new, old]` tip pair recorded while a multi-batch flush is in
    /// progress; empty means the database is consistent.
    pub fn head_blocks(&self) -> Result<Vec<Hash256>, CoinsError> {
        let Some(bytes) = self.store.get(Column::Meta, HEAD_BLOCKS_KEY)? else {
            return Ok(Vec::new());
        };
        if bytes.len() != 64 {
            return Err(CoinsError::Corrupt("invalid head blocks entry"));
        }
        let mut new_head = [0u8; 32];
        let mut old_head = [0u8; 32];
        new_head.copy_from_slice(&bytes[..32]);
        old_head.copy_from_slice(&bytes[32..]);
        Ok(vec![new_head, old_head])
    }

    /// Apply a drained cache to disk. The first batch publishes the head
    /// pair, the last one retires it and moves the best block, so a crash at
    /// any point leaves a state `replay_blocks` can roll to `new_best`.
    pub fn write_coins(
        &self,
        changes: Vec<(OutPoint, Option<Coin>)>,
        new_best: Hash256,
        old_best: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        let mut batch = WriteBatch::new();
        let mut heads = Vec::with_capacity(64);
        heads.extend_from_slice(&new_best);
        heads.extend_from_slice(&old_best.unwrap_or([0u8; 32]));
        batch.put(Column::Meta, HEAD_BLOCKS_KEY, heads);
        batch.delete(Column::Meta, BEST_BLOCK_KEY);

        for (outpoint, coin) in changes {
            match coin {
                Some(coin) => batch.put(Column::Coins, outpoint.key_bytes(), coin.encode()),
                None => batch.delete(Column::Coins, outpoint.key_bytes()),
            }
            if batch.len() >= FLUSH_BATCH_OPS {
                self.store.write_batch(&batch)?;
                batch = WriteBatch::new();
            }
        }

        batch.put(Column::Meta, BEST_BLOCK_KEY, new_best.to_vec());
        batch.delete(Column::Meta, HEAD_BLOCKS_KEY);
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

impl<S: KeyValueStore> CoinsView for CoinsDb<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.store.get(Column::Coins, &outpoint.key_bytes())? {
            Some(bytes) => Coin::decode(&bytes)
                .map(Some)
                .map_err(|_| CoinsError::Corrupt("invalid coin entry")),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        let Some(bytes) = self.store.get(Column::Meta, BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(CoinsError::Corrupt("invalid best block entry"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    /// `None` records a spent of a coin the base still has.
    coin: Option<Coin>,
    dirty: bool,
    /// The base view is known not to contain this outpoint, so a spend may
    /// simply forget the entry rather than write a deletion through.
    fresh: bool,
}

/// A dirty change drained out of a child cache.
pub struct CoinChange {
    pub outpoint: OutPoint,
    pub coin: Option<Coin>,
    pub fresh: bool,
}

/// In-memory overlay over a [`CoinsView`].
pub struct CoinsCache<V> {
    base: V,
    entries: HashMap<OutPoint, CacheEntry>,
    best: Option<Hash256>,
    script_bytes: usize,
}

/// Bookkeeping bytes charged per cache entry on top of script bytes.
const PER_ENTRY_OVERHEAD: usize = 100;

impl<V: CoinsView> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best: None,
            script_bytes: 0,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.entries.len() * PER_ENTRY_OVERHEAD + self.script_bytes
    }

    fn ensure_fetched(&mut self, outpoint: &OutPoint) -> Result<(), CoinsError> {
        if self.entries.contains_key(outpoint) {
            return Ok(());
        }
        let base_coin = self.base.coin(outpoint)?;
        let fresh = base_coin.is_none();
        if let Some(coin) = &base_coin {
            self.script_bytes += coin.script_pubkey.len();
        }
        self.entries.insert(
            *outpoint,
            CacheEntry {
                coin: base_coin,
                dirty: false,
                fresh,
            },
        );
        Ok(())
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        self.ensure_fetched(outpoint)?;
        Ok(self.entries[outpoint].coin.is_some())
    }

    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.ensure_fetched(outpoint)?;
        Ok(self.entries[outpoint].coin.clone())
    }

    /// Create a coin. Unless `potential_overwrite` is set, creating over a
    /// live coin is refused; that refusal is how the connect path catches
    /// accidental double-creation.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        potential_overwrite: bool,
    ) -> Result<(), CoinsError> {
        self.ensure_fetched(&outpoint)?;
        let script_len = coin.script_pubkey.len();
        let mut freed = 0usize;
        {
            let entry = self.entries.get_mut(&outpoint).expect("fetched above");
            if entry.coin.is_some() {
                if !potential_overwrite {
                    return Err(CoinsError::DoubleAdd);
                }
                // Overwriting forgets freshness; the base may hold the old coin.
                entry.fresh = false;
            }
            if let Some(old) = entry.coin.take() {
                freed = old.script_pubkey.len();
            }
            entry.coin = Some(coin);
            entry.dirty = true;
        }
        self.script_bytes = self.script_bytes.saturating_sub(freed) + script_len;
        Ok(())
    }

    /// Spend a coin, returning the previous value for undo recording.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.ensure_fetched(outpoint)?;
        let (taken, fresh) = {
            let entry = self.entries.get_mut(outpoint).expect("fetched above");
            (entry.coin.take(), entry.fresh)
        };
        if let Some(coin) = &taken {
            self.script_bytes = self.script_bytes.saturating_sub(coin.script_pubkey.len());
        }
        if fresh {
            // Created and spent entirely within this cache: nothing to tell
            // the base about.
            self.entries.remove(outpoint);
        } else if let Some(entry) = self.entries.get_mut(outpoint) {
            entry.dirty = true;
        }
        Ok(taken)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best = Some(hash);
    }

    pub fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.best {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }

    /// Drain dirty entries for absorption into the parent cache.
    pub fn into_changes(self) -> (Vec<CoinChange>, Option<Hash256>) {
        let mut changes = Vec::with_capacity(self.entries.len());
        for (outpoint, entry) in self.entries {
            if !entry.dirty {
                continue;
            }
            changes.push(CoinChange {
                outpoint,
                coin: entry.coin,
                fresh: entry.fresh,
            });
        }
        (changes, self.best)
    }

    /// Fold a child cache's drained changes into this one.
    pub fn absorb(&mut self, changes: Vec<CoinChange>, best: Option<Hash256>) {
        for change in changes {
            match self.entries.entry(change.outpoint) {
                MapEntry::Vacant(slot) => {
                    if change.fresh && change.coin.is_none() {
                        continue;
                    }
                    if let Some(coin) = &change.coin {
                        self.script_bytes += coin.script_pubkey.len();
                    }
                    slot.insert(CacheEntry {
                        coin: change.coin,
                        dirty: true,
                        fresh: change.fresh,
                    });
                }
                MapEntry::Occupied(mut slot) => {
                    if let Some(old) = &slot.get().coin {
                        self.script_bytes =
                            self.script_bytes.saturating_sub(old.script_pubkey.len());
                    }
                    if slot.get().fresh && change.coin.is_none() {
                        slot.remove();
                        continue;
                    }
                    if let Some(coin) = &change.coin {
                        self.script_bytes += coin.script_pubkey.len();
                    }
                    let entry = slot.get_mut();
                    entry.coin = change.coin;
                    entry.dirty = true;
                }
            }
        }
        if best.is_some() {
            self.best = best;
        }
    }
}

impl<V: CoinsView> CoinsView for &CoinsCache<V> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.best {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }
}

impl<S: KeyValueStore> CoinsCache<CoinsDb<S>> {
    /// Write every dirty entry to the database and drop the overlay.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let Some(new_best) = self.best.or(self.base.best_block()?) else {
            // Nothing was ever connected.
            self.entries.clear();
            self.script_bytes = 0;
            return Ok(());
        };
        let old_best = self.base.best_block()?;

        let mut changes = Vec::with_capacity(self.entries.len());
        for (outpoint, entry) in self.entries.drain() {
            if !entry.dirty {
                continue;
            }
            if entry.fresh && entry.coin.is_none() {
                continue;
            }
            changes.push((outpoint, entry.coin));
        }
        self.script_bytes = 0;
        self.base.write_coins(changes, new_best, old_best)?;
        self.best = Some(new_best);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn coin(value: i64) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51, 0x52, 0x53],
            height: 7,
            is_coinbase: false,
        }
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new([n; 32], n as u32)
    }

    #[test]
    fn add_without_overwrite_refuses_double_creation() {
        let db = CoinsDb::new(Arc::new(MemoryStore::new()));
        let mut cache = CoinsCache::new(db);
        cache.add_coin(outpoint(1), coin(10), false).unwrap();
        assert!(matches!(
            cache.add_coin(outpoint(1), coin(11), false),
            Err(CoinsError::DoubleAdd)
        ));
        cache.add_coin(outpoint(1), coin(11), true).unwrap();
        assert_eq!(cache.access_coin(&outpoint(1)).unwrap().unwrap().value, 11);
    }

    #[test]
    fn spend_returns_previous_coin() {
        let db = CoinsDb::new(Arc::new(MemoryStore::new()));
        let mut cache = CoinsCache::new(db);
        cache.add_coin(outpoint(2), coin(25), false).unwrap();
        let spent = cache.spend_coin(&outpoint(2)).unwrap().unwrap();
        assert_eq!(spent.value, 25);
        assert!(!cache.have_coin(&outpoint(2)).unwrap());
        assert!(cache.spend_coin(&outpoint(2)).unwrap().is_none());
    }

    #[test]
    fn flush_persists_and_fresh_spends_never_touch_disk() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsDb::new(Arc::clone(&store)));
        cache.add_coin(outpoint(3), coin(30), false).unwrap();
        // Created and spent before any flush: invisible to the database.
        cache.add_coin(outpoint(4), coin(40), false).unwrap();
        cache.spend_coin(&outpoint(4)).unwrap();
        cache.set_best_block([9u8; 32]);
        cache.flush().unwrap();

        let db = CoinsDb::new(Arc::clone(&store));
        assert_eq!(db.coin(&outpoint(3)).unwrap().unwrap().value, 30);
        assert!(db.coin(&outpoint(4)).unwrap().is_none());
        assert_eq!(db.best_block().unwrap(), Some([9u8; 32]));
        assert!(db.head_blocks().unwrap().is_empty());
    }

    #[test]
    fn scratch_cache_absorbs_into_parent() {
        let store = Arc::new(MemoryStore::new());
        let mut parent = CoinsCache::new(CoinsDb::new(Arc::clone(&store)));
        parent.add_coin(outpoint(5), coin(50), false).unwrap();

        let (changes, best) = {
            let mut scratch = CoinsCache::new(&parent);
            let spent = scratch.spend_coin(&outpoint(5)).unwrap().unwrap();
            assert_eq!(spent.value, 50);
            scratch.add_coin(outpoint(6), coin(60), false).unwrap();
            scratch.set_best_block([6u8; 32]);
            scratch.into_changes()
        };
        parent.absorb(changes, best);

        assert!(!parent.have_coin(&outpoint(5)).unwrap());
        assert_eq!(parent.access_coin(&outpoint(6)).unwrap().unwrap().value, 60);
        assert_eq!(parent.best_block().unwrap(), Some([6u8; 32]));
    }

    #[test]
    fn connect_then_disconnect_restores_the_view() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = CoinsCache::new(CoinsDb::new(Arc::clone(&store)));
        cache.add_coin(outpoint(7), coin(70), false).unwrap();
        cache.set_best_block([1u8; 32]);
        cache.flush().unwrap();

        // Connect: spend 7, create 8.
        let spent = cache.spend_coin(&outpoint(7)).unwrap().unwrap();
        cache.add_coin(outpoint(8), coin(80), false).unwrap();
        cache.set_best_block([2u8; 32]);

        // Disconnect: remove 8, restore 7 from the undo coin.
        cache.spend_coin(&outpoint(8)).unwrap();
        cache.add_coin(outpoint(7), spent, true).unwrap();
        cache.set_best_block([1u8; 32]);
        cache.flush().unwrap();

        let db = CoinsDb::new(Arc::clone(&store));
        assert_eq!(db.coin(&outpoint(7)).unwrap().unwrap().value, 70);
        assert!(db.coin(&outpoint(8)).unwrap().is_none());
        assert_eq!(db.best_block().unwrap(), Some([1u8; 32]));
    }
}
