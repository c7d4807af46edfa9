//! In-memory store used by tests and reindex scaffolding.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<BTreeMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        let mut out = Vec::new();
        if let Some(entries) = columns.get(&column) {
            for (key, value) in entries.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key.clone(), value.clone()));
            }
        }
        Ok(out)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.scan_prefix(column, prefix)? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(column) {
                        entries.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_applied_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key".to_vec(), b"one".to_vec());
        batch.put(Column::Meta, b"key".to_vec(), b"two".to_vec());
        batch.delete(Column::Meta, b"gone".to_vec());
        store.write_batch(&batch).unwrap();
        assert_eq!(
            store.get(Column::Meta, b"key").unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Coins, b"aa1", b"1").unwrap();
        store.put(Column::Coins, b"aa2", b"2").unwrap();
        store.put(Column::Coins, b"ab1", b"3").unwrap();
        let hits = store.scan_prefix(Column::Coins, b"aa").unwrap();
        assert_eq!(hits.len(), 2);
    }
}
