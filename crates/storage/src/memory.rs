//! In-memory backend used by tests and the simulation network.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{KeyValueStore, StoreError, StoreKey, WriteBatch, BUCKETS};

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<&'static str, Bucket>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut buckets = HashMap::new();
        for name in BUCKETS {
            buckets.insert(name, Bucket::new());
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let buckets = self.buckets.lock().map_err(|_| lock_poisoned())?;
        Ok(buckets
            .get(key.bucket())
            .and_then(|bucket| bucket.get(key.raw().as_slice()).cloned()))
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().map_err(|_| lock_poisoned())?;
        buckets
            .entry(key.bucket())
            .or_default()
            .insert(key.raw().as_slice().to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().map_err(|_| lock_poisoned())?;
        if let Some(bucket) = buckets.get_mut(key.bucket()) {
            bucket.remove(key.raw().as_slice());
        }
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        // The whole batch applies under a single lock acquisition, so
        // readers never observe a partially applied batch.
        let mut buckets = self.buckets.lock().map_err(|_| lock_poisoned())?;
        for (key, op) in batch.iter() {
            let bucket = buckets.entry(key.bucket()).or_default();
            match op {
                Some(value) => {
                    bucket.insert(key.raw().as_slice().to_vec(), value.clone());
                }
                None => {
                    bucket.remove(key.raw().as_slice());
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
    fn batch_put_and_delete() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(StoreKey::Tip, vec![1, 2, 3]);
        batch.put(StoreKey::Block([0xaa; 32]), vec![4]);
        store.commit(&batch).expect("commit");

        assert_eq!(store.get(&StoreKey::Tip).expect("get"), Some(vec![1, 2, 3]));

        let mut batch = WriteBatch::new();
        batch.delete(StoreKey::Tip);
        store.commit(&batch).expect("commit");
        assert_eq!(store.get(&StoreKey::Tip).expect("get"), None);
        assert_eq!(
            store.get(&StoreKey::Block([0xaa; 32])).expect("get"),
            Some(vec![4])
        );
    }

    #[test]
    fn single_puts_roundtrip() {
        let store = MemoryStore::new();
        store
            .put(&StoreKey::Height(7), &[0x11; 32])
            .expect("put");
        assert_eq!(
            store.get(&StoreKey::Height(7)).expect("get"),
            Some(vec![0x11; 32])
        );
        store.delete(&StoreKey::Height(7)).expect("delete");
        assert_eq!(store.get(&StoreKey::Height(7)).expect("get"), None);
    }
}
