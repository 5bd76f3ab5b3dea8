//! Block header and block types with consensus serialization.

use spvd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, sha256d_pair};

/// Serialized size of a block header on the wire.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block identity: double-SHA256 of the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        Self::consensus_decode_from(&mut decoder)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

/// A full block as received from the network: the header plus the raw
/// serialized transactions. Transactions are kept opaque; the SPV layer only
/// needs their hashes for merkle validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode_to(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_bytes(tx);
        }
        encoder.into_inner()
    }

    /// Decodes a block payload. Transaction boundaries are recovered by
    /// walking the legacy transaction layout (no witness data on this
    /// network).
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::VarIntTooLarge)?;
        let mut transactions = Vec::with_capacity(count.min(16_384));
        for _ in 0..count {
            transactions.push(read_raw_transaction(&mut decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Merkle root over the transaction hashes, duplicating the final entry
    /// of odd-length levels.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let mut level: Vec<Hash256> = self
            .transactions
            .iter()
            .map(|tx| sha256d(tx))
            .collect();
        if level.is_empty() {
            return [0u8; 32];
        }
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(sha256d_pair(left, right));
            }
            level = next;
        }
        level[0]
    }
}

/// Reads one legacy-format transaction and returns its raw bytes.
fn read_raw_transaction(decoder: &mut Decoder<'_>) -> Result<Vec<u8>, DecodeError> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(decoder.read_i32_le()?);

    let input_count = decoder.read_varint()?;
    encoder.write_varint(input_count);
    for _ in 0..input_count {
        encoder.write_hash(&decoder.read_hash()?);
        encoder.write_u32_le(decoder.read_u32_le()?);
        let script = decoder.read_var_bytes()?;
        encoder.write_var_bytes(&script);
        encoder.write_u32_le(decoder.read_u32_le()?);
    }

    let output_count = decoder.read_varint()?;
    encoder.write_varint(output_count);
    for _ in 0..output_count {
        encoder.write_i64_le(decoder.read_i64_le()?);
        let script = decoder.read_var_bytes()?;
        encoder.write_var_bytes(&script);
    }

    encoder.write_u32_le(decoder.read_u32_le()?);
    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_401_292_357,
            bits: 0x207f_ffff,
            nonce: 7,
        }
    }

    fn coinbase_tx(tag: u8) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(1);
        encoder.write_varint(1);
        encoder.write_hash(&[0u8; 32]);
        encoder.write_u32_le(u32::MAX);
        encoder.write_var_bytes(&[tag]);
        encoder.write_u32_le(u32::MAX);
        encoder.write_varint(1);
        encoder.write_i64_le(50 * 100_000_000);
        encoder.write_var_bytes(&[0x51]);
        encoder.write_u32_le(0);
        encoder.into_inner()
    }

    #[test]
    fn header_encoding_is_eighty_bytes() {
        let header = sample_header();
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::consensus_decode(&bytes).unwrap(), header);
    }

    #[test]
    fn block_decode_recovers_transaction_boundaries() {
        let block = Block {
            header: sample_header(),
            transactions: vec![coinbase_tx(0xaa), coinbase_tx(0xbb), coinbase_tx(0xcc)],
        };
        let bytes = block.consensus_encode();
        let decoded = Block::consensus_decode(&bytes).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn merkle_root_single_tx_is_txid() {
        let tx = coinbase_tx(0xaa);
        let expected = sha256d(&tx);
        let block = Block {
            header: sample_header(),
            transactions: vec![tx],
        };
        assert_eq!(block.compute_merkle_root(), expected);
    }

    #[test]
    fn merkle_root_duplicates_odd_leaf() {
        let txs = vec![coinbase_tx(0xaa), coinbase_tx(0xbb), coinbase_tx(0xcc)];
        let hashes: Vec<_> = txs.iter().map(|tx| sha256d(tx)).collect();
        let left = sha256d_pair(&hashes[0], &hashes[1]);
        let right = sha256d_pair(&hashes[2], &hashes[2]);
        let expected = sha256d_pair(&left, &right);
        let block = Block {
            header: sample_header(),
            transactions: txs,
        };
        assert_eq!(block.compute_merkle_root(), expected);
    }
}
