//! fjall-backed persistent store, one partition per bucket.

use std::collections::HashMap;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{KeyValueStore, StoreError, StoreKey, WriteBatch, BUCKETS};

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: HashMap<&'static str, PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(Config::new(path))
    }

    pub fn open_with_config(config: Config) -> Result<Self, StoreError> {
        let keyspace = config.open().map_err(map_err)?;
        let mut partitions = HashMap::new();
        for name in BUCKETS {
            let handle = keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.insert(name, handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, key: &StoreKey) -> Result<&PartitionHandle, StoreError> {
        let name = key.bucket();
        self.partitions
            .get(name)
            .ok_or_else(|| StoreError::Backend(format!("missing partition {name}")))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let partition = self.partition(key)?;
        let raw = key.raw();
        let value = partition.get(raw.as_slice()).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        let raw = key.raw();
        partition.insert(raw.as_slice(), value).map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let partition = self.partition(key)?;
        let raw = key.raw();
        partition.remove(raw.as_slice()).map_err(map_err)?;
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut fjall_batch = self.keyspace.batch();
        for (key, op) in batch.iter() {
            let partition = self.partition(key)?;
            let raw = key.raw();
            match op {
                Some(value) => fjall_batch.insert(partition, raw.as_slice(), value.as_slice()),
                None => fjall_batch.remove(partition, raw.as_slice()),
            }
        }
        fjall_batch.commit().map_err(map_err)?;
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FjallStore::open(dir.path()).expect("open");
            let mut batch = WriteBatch::new();
            batch.put(StoreKey::MaxHeight, 42u32.to_be_bytes().to_vec());
            store.commit(&batch).expect("commit");
        }
        let store = FjallStore::open(dir.path()).expect("reopen");
        assert_eq!(
            store.get(&StoreKey::MaxHeight).expect("get"),
            Some(42u32.to_be_bytes().to_vec())
        );
    }
}
