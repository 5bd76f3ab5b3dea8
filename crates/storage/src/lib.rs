//! Storage behind the header store.
//!
//! The SPV namespace is small and fixed, so keys are typed: every slot the
//! service can address is a `StoreKey` variant, and each backend maps those
//! onto its own layout. Batches apply atomically.

use std::fmt;

use spvd_consensus::Hash256;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The two parallel committed-filter chains.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FilterChain {
    Basic,
    Extended,
}

impl FilterChain {
    pub fn from_extended(extended: bool) -> Self {
        if extended {
            FilterChain::Extended
        } else {
            FilterChain::Basic
        }
    }

    pub fn is_extended(self) -> bool {
        matches!(self, FilterChain::Extended)
    }
}

/// A typed address into the SPV namespace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKey {
    /// Serialized header and height, keyed by block hash.
    Block(Hash256),
    /// Best-chain block hash, keyed by height.
    Height(u32),
    /// Filter header for one block on one chain.
    FilterHeader(FilterChain, Hash256),
    /// Cached filter contents for one block on one chain.
    Filter(FilterChain, Hash256),
    /// The chain-tip stamp.
    Tip,
    /// Highest height present in the height index.
    MaxHeight,
}

/// Bucket names persistent backends lay the namespace out under.
pub const BUCKETS: [&str; 7] = [
    "blocks_by_hash",
    "blocks_by_height",
    "basic_fh",
    "ext_fh",
    "basic_filter",
    "ext_filter",
    "meta",
];

impl StoreKey {
    pub fn bucket(&self) -> &'static str {
        match self {
            StoreKey::Block(_) => "blocks_by_hash",
            StoreKey::Height(_) => "blocks_by_height",
            StoreKey::FilterHeader(FilterChain::Basic, _) => "basic_fh",
            StoreKey::FilterHeader(FilterChain::Extended, _) => "ext_fh",
            StoreKey::Filter(FilterChain::Basic, _) => "basic_filter",
            StoreKey::Filter(FilterChain::Extended, _) => "ext_filter",
            StoreKey::Tip | StoreKey::MaxHeight => "meta",
        }
    }

    /// Raw key bytes within the bucket. Hash keys are the hash itself;
    /// heights are big-endian so the height index sorts numerically.
    pub fn raw(&self) -> RawKey {
        match self {
            StoreKey::Block(hash)
            | StoreKey::FilterHeader(_, hash)
            | StoreKey::Filter(_, hash) => RawKey::new(hash),
            StoreKey::Height(height) => RawKey::new(&height.to_be_bytes()),
            StoreKey::Tip => RawKey::new(b"tip"),
            StoreKey::MaxHeight => RawKey::new(b"max_height"),
        }
    }
}

/// Key bytes on the stack; nothing in the namespace is longer than a hash.
#[derive(Clone, Copy, Debug)]
pub struct RawKey {
    buf: [u8; 32],
    len: usize,
}

impl RawKey {
    fn new(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 32];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsRef<[u8]> for RawKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// An ordered set of puts and deletes applied atomically on commit. A
/// delete is a `None` value.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(StoreKey, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: StoreKey, value: impl Into<Vec<u8>>) {
        self.ops.push((key, Some(value.into())));
    }

    pub fn delete(&mut self, key: StoreKey) {
        self.ops.push((key, None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(StoreKey, Option<Vec<u8>>)> {
        self.ops.iter()
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;
    /// Applies every operation in the batch; readers never observe a
    /// partially applied batch.
    fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keys_split_by_chain() {
        let hash = [0x5a; 32];
        assert_eq!(
            StoreKey::FilterHeader(FilterChain::Basic, hash).bucket(),
            "basic_fh"
        );
        assert_eq!(
            StoreKey::FilterHeader(FilterChain::Extended, hash).bucket(),
            "ext_fh"
        );
        assert_eq!(StoreKey::Filter(FilterChain::Basic, hash).bucket(), "basic_filter");
        assert_eq!(
            StoreKey::FilterHeader(FilterChain::Basic, hash).raw().as_slice(),
            &hash
        );
    }

    #[test]
    fn height_keys_sort_numerically() {
        let low = StoreKey::Height(255).raw();
        let high = StoreKey::Height(256).raw();
        assert!(low.as_slice() < high.as_slice());
    }

    #[test]
    fn every_key_lands_in_a_known_bucket() {
        let keys = [
            StoreKey::Block([0; 32]),
            StoreKey::Height(1),
            StoreKey::FilterHeader(FilterChain::Extended, [0; 32]),
            StoreKey::Filter(FilterChain::Extended, [0; 32]),
            StoreKey::Tip,
            StoreKey::MaxHeight,
        ];
        for key in keys {
            assert!(BUCKETS.contains(&key.bucket()));
        }
    }
}
