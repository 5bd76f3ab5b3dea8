//! Header store: block headers keyed by hash and height, the two parallel
//! committed-filter header chains, cached filters, and the chain tip.

use std::fmt;

use log::debug;
use spvd_consensus::{ChainParams, Hash256};
use spvd_primitives::block::{BlockHeader, HEADER_SIZE};
use spvd_primitives::encoding::DecodeError;
use spvd_storage::{FilterChain, KeyValueStore, StoreError, StoreKey, WriteBatch};

const LOG_TARGET: &str = "chainstate";

/// The chain-tip marker: (hash, height).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockStamp {
    pub hash: Hash256,
    pub height: u32,
}

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Decode(DecodeError),
    MissingTip,
    MissingHeader(Hash256),
    MissingHeight(u32),
    RollbackPastGenesis,
    CorruptIndex(&'static str),
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::MissingTip => write!(f, "store has no chain tip"),
            ChainStateError::MissingHeader(hash) => {
                write!(f, "no header for {}", spvd_consensus::hash256_to_hex(hash))
            }
            ChainStateError::MissingHeight(height) => {
                write!(f, "no best-chain entry at height {height}")
            }
            ChainStateError::RollbackPastGenesis => {
                write!(f, "cannot roll back the genesis block")
            }
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

pub struct HeaderStore<S> {
    store: S,
}

impl<S: KeyValueStore> HeaderStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Seeds the genesis header and tip on first run. Subsequent calls are
    /// no-ops as long as a tip exists.
    pub fn ensure_genesis(&self, params: &ChainParams) -> Result<BlockStamp, ChainStateError> {
        if let Some(tip) = self.tip()? {
            return Ok(tip);
        }
        let genesis = genesis_header(params);
        let hash = genesis.hash();
        let mut batch = WriteBatch::new();
        batch.put(StoreKey::Block(hash), encode_block_entry(&genesis, 0));
        batch.put(StoreKey::Height(0), hash.to_vec());
        // Filter-header chains are anchored at genesis; the placeholder is
        // replaced by the sync engine once a peer reports the real value.
        batch.put(
            StoreKey::FilterHeader(FilterChain::Basic, hash),
            [0u8; 32].to_vec(),
        );
        batch.put(
            StoreKey::FilterHeader(FilterChain::Extended, hash),
            [0u8; 32].to_vec(),
        );
        batch.put(StoreKey::Tip, encode_stamp(&BlockStamp { hash, height: 0 }));
        batch.put(StoreKey::MaxHeight, 0u32.to_be_bytes().to_vec());
        self.store.commit(&batch)?;
        debug!(target: LOG_TARGET, "seeded genesis {}", spvd_consensus::hash256_to_hex(&hash));
        Ok(BlockStamp { hash, height: 0 })
    }

    pub fn tip(&self) -> Result<Option<BlockStamp>, ChainStateError> {
        match self.store.get(&StoreKey::Tip)? {
            Some(bytes) => Ok(Some(decode_stamp(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn best_snapshot(&self) -> Result<BlockStamp, ChainStateError> {
        self.tip()?.ok_or(ChainStateError::MissingTip)
    }

    pub fn max_height(&self) -> Result<u32, ChainStateError> {
        let bytes = self
            .store
            .get(&StoreKey::MaxHeight)?
            .ok_or(ChainStateError::MissingTip)?;
        decode_height(&bytes)
    }

    /// Appends validated headers to the best chain in one atomic batch and
    /// advances the tip to the last of them.
    pub fn put_block_headers(
        &self,
        headers: &[(BlockHeader, u32)],
    ) -> Result<BlockStamp, ChainStateError> {
        let (last_header, last_height) =
            headers.last().ok_or(ChainStateError::CorruptIndex("empty header batch"))?;
        let mut batch = WriteBatch::new();
        for (header, height) in headers {
            let hash = header.hash();
            batch.put(StoreKey::Block(hash), encode_block_entry(header, *height));
            batch.put(StoreKey::Height(*height), hash.to_vec());
        }
        let stamp = BlockStamp {
            hash: last_header.hash(),
            height: *last_height,
        };
        batch.put(StoreKey::Tip, encode_stamp(&stamp));
        batch.put(StoreKey::MaxHeight, last_height.to_be_bytes().to_vec());
        self.store.commit(&batch)?;
        Ok(stamp)
    }

    pub fn put_block(&self, header: &BlockHeader, height: u32) -> Result<BlockStamp, ChainStateError> {
        self.put_block_headers(&[(*header, height)])
    }

    pub fn get_block_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<(BlockHeader, u32)>, ChainStateError> {
        match self.store.get(&StoreKey::Block(*hash))? {
            Some(bytes) => Ok(Some(decode_block_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(
        &self,
        height: u32,
    ) -> Result<Option<(BlockHeader, u32)>, ChainStateError> {
        let Some(hash) = self.hash_at_height(height)? else {
            return Ok(None);
        };
        self.get_block_by_hash(&hash)
    }

    pub fn hash_at_height(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        match self.store.get(&StoreKey::Height(height))? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_block(&self) -> Result<(BlockHeader, u32), ChainStateError> {
        let tip = self.best_snapshot()?;
        self.get_block_by_hash(&tip.hash)?
            .ok_or(ChainStateError::MissingHeader(tip.hash))
    }

    pub fn put_basic_header(&self, hash: &Hash256, fh: &Hash256) -> Result<(), ChainStateError> {
        self.put_filter_header(hash, fh, false)
    }

    pub fn put_ext_header(&self, hash: &Hash256, fh: &Hash256) -> Result<(), ChainStateError> {
        self.put_filter_header(hash, fh, true)
    }

    pub fn get_basic_header(&self, hash: &Hash256) -> Result<Option<Hash256>, ChainStateError> {
        self.filter_header(hash, false)
    }

    pub fn get_ext_header(&self, hash: &Hash256) -> Result<Option<Hash256>, ChainStateError> {
        self.filter_header(hash, true)
    }

    pub fn filter_header(
        &self,
        hash: &Hash256,
        extended: bool,
    ) -> Result<Option<Hash256>, ChainStateError> {
        let key = StoreKey::FilterHeader(FilterChain::from_extended(extended), *hash);
        match self.store.get(&key)? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_filter_header(
        &self,
        hash: &Hash256,
        fh: &Hash256,
        extended: bool,
    ) -> Result<(), ChainStateError> {
        let key = StoreKey::FilterHeader(FilterChain::from_extended(extended), *hash);
        Ok(self.store.put(&key, fh)?)
    }

    pub fn put_basic_filter(&self, hash: &Hash256, filter: &[u8]) -> Result<(), ChainStateError> {
        self.put_filter(hash, filter, false)
    }

    pub fn put_ext_filter(&self, hash: &Hash256, filter: &[u8]) -> Result<(), ChainStateError> {
        self.put_filter(hash, filter, true)
    }

    pub fn get_basic_filter(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, ChainStateError> {
        self.filter(hash, false)
    }

    pub fn get_ext_filter(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, ChainStateError> {
        self.filter(hash, true)
    }

    pub fn filter(
        &self,
        hash: &Hash256,
        extended: bool,
    ) -> Result<Option<Vec<u8>>, ChainStateError> {
        let key = StoreKey::Filter(FilterChain::from_extended(extended), *hash);
        Ok(self.store.get(&key)?)
    }

    pub fn put_filter(
        &self,
        hash: &Hash256,
        filter: &[u8],
        extended: bool,
    ) -> Result<(), ChainStateError> {
        let key = StoreKey::Filter(FilterChain::from_extended(extended), *hash);
        Ok(self.store.put(&key, filter)?)
    }

    /// Unwinds the tip block: removes its header, height-index entry, filter
    /// headers, and cached filters, then moves the tip to its parent.
    pub fn rollback_last_block(&self) -> Result<BlockStamp, ChainStateError> {
        let tip = self.best_snapshot()?;
        if tip.height == 0 {
            return Err(ChainStateError::RollbackPastGenesis);
        }
        let prev_height = tip.height - 1;
        let prev_hash = self
            .hash_at_height(prev_height)?
            .ok_or(ChainStateError::MissingHeight(prev_height))?;

        let mut batch = WriteBatch::new();
        batch.delete(StoreKey::Block(tip.hash));
        batch.delete(StoreKey::Height(tip.height));
        for chain in [FilterChain::Basic, FilterChain::Extended] {
            batch.delete(StoreKey::FilterHeader(chain, tip.hash));
            batch.delete(StoreKey::Filter(chain, tip.hash));
        }
        let stamp = BlockStamp {
            hash: prev_hash,
            height: prev_height,
        };
        batch.put(StoreKey::Tip, encode_stamp(&stamp));
        batch.put(StoreKey::MaxHeight, prev_height.to_be_bytes().to_vec());
        self.store.commit(&batch)?;
        Ok(stamp)
    }

    /// Repeats `rollback_last_block` until the tip height is at most `height`.
    pub fn rollback_to_height(&self, height: u32) -> Result<BlockStamp, ChainStateError> {
        let mut tip = self.best_snapshot()?;
        while tip.height > height {
            tip = self.rollback_last_block()?;
        }
        debug!(
            target: LOG_TARGET,
            "rolled back to {} at height {}",
            spvd_consensus::hash256_to_hex(&tip.hash),
            tip.height
        );
        Ok(tip)
    }

    /// Block locator descending from the tip: the last ten hashes step by
    /// one, then the step doubles until genesis.
    pub fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainStateError> {
        let tip = self.best_snapshot()?;
        self.block_locator_from(tip.height)
    }

    pub fn block_locator_from(&self, height: u32) -> Result<Vec<Hash256>, ChainStateError> {
        let mut locator = Vec::new();
        let mut step = 1u32;
        let mut current = height as i64;
        while current > 0 {
            if let Some(hash) = self.hash_at_height(current as u32)? {
                locator.push(hash);
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            current -= step as i64;
        }
        if let Some(genesis) = self.hash_at_height(0)? {
            locator.push(genesis);
        }
        Ok(locator)
    }
}

fn genesis_header(params: &ChainParams) -> BlockHeader {
    BlockHeader {
        version: params.genesis_version,
        prev_block: [0u8; 32],
        merkle_root: params.genesis_merkle_root,
        time: params.genesis_time,
        bits: params.genesis_bits,
        nonce: params.genesis_nonce,
    }
}

fn encode_block_entry(header: &BlockHeader, height: u32) -> Vec<u8> {
    let mut out = header.consensus_encode();
    out.extend_from_slice(&height.to_le_bytes());
    out
}

fn decode_block_entry(bytes: &[u8]) -> Result<(BlockHeader, u32), ChainStateError> {
    if bytes.len() != HEADER_SIZE + 4 {
        return Err(ChainStateError::CorruptIndex("bad block entry length"));
    }
    let header = BlockHeader::consensus_decode(&bytes[..HEADER_SIZE])?;
    let height = u32::from_le_bytes([
        bytes[HEADER_SIZE],
        bytes[HEADER_SIZE + 1],
        bytes[HEADER_SIZE + 2],
        bytes[HEADER_SIZE + 3],
    ]);
    Ok((header, height))
}

fn encode_stamp(stamp: &BlockStamp) -> Vec<u8> {
    let mut out = stamp.hash.to_vec();
    out.extend_from_slice(&stamp.height.to_le_bytes());
    out
}

fn decode_stamp(bytes: &[u8]) -> Result<BlockStamp, ChainStateError> {
    if bytes.len() != 36 {
        return Err(ChainStateError::CorruptIndex("bad tip stamp length"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[..32]);
    let height = u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
    Ok(BlockStamp { hash, height })
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainStateError> {
    if bytes.len() != 32 {
        return Err(ChainStateError::CorruptIndex("bad hash length"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn decode_height(bytes: &[u8]) -> Result<u32, ChainStateError> {
    if bytes.len() != 4 {
        return Err(ChainStateError::CorruptIndex("bad height length"));
    }
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
