//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use primitive_types::U256;
use spvd_consensus::{ChainParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of header fields the retarget calculation needs.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow =
            size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn hash_meets_target(hash: &Hash256, bits: u32) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    Ok(U256::from_little_endian(hash) <= target)
}

/// Amount of work a block with the given bits contributes to its chain.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_work(a: &U256, b: &U256) -> Ordering {
    a.cmp(b)
}

/// Required bits for the block following `chain.last()`.
///
/// `chain` must hold the headers of the current retarget window in ascending
/// height order; only the first and last entries are inspected outside of
/// min-difficulty handling.
pub fn next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let pow_limit_bits = u256_to_compact(pow_limit);
    let last = chain.last().ok_or(DifficultyError::EmptyChain)?;

    if params.pow_no_retargeting {
        return Ok(pow_limit_bits);
    }

    let interval = params.retarget_interval();
    let next_height = last.height + 1;

    if next_height % interval != 0 {
        // Between retarget boundaries the difficulty carries over, except on
        // networks that permit min-difficulty blocks after twice the target
        // spacing with no block found.
        if params.pow_allow_min_difficulty {
            if let Some(next_time) = next_block_time {
                if next_time > last.time as i64 + params.pow_target_spacing * 2 {
                    return Ok(pow_limit_bits);
                }
            }
        }
        return Ok(last.bits);
    }

    // Retarget boundary: scale the target by the actual timespan of the
    // window, clamped to a factor of four in either direction.
    let first = chain
        .iter()
        .find(|header| header.height + interval >= next_height)
        .ok_or(DifficultyError::EmptyChain)?;
    let mut actual_timespan = last.time as i64 - first.time as i64;
    let min_timespan = params.pow_target_timespan / 4;
    let max_timespan = params.pow_target_timespan * 4;
    actual_timespan = actual_timespan.clamp(min_timespan, max_timespan);

    let old_target = compact_to_u256(last.bits)?;
    let mut next = old_target / U256::from(params.pow_target_timespan as u64);
    next = next.saturating_mul(U256::from(actual_timespan as u64));
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvd_consensus::{chain_params, Network};

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_64ba] {
            let value = compact_to_u256(bits).unwrap();
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn block_proof_increases_with_difficulty() {
        let easy = block_proof(0x207f_ffff).unwrap();
        let hard = block_proof(0x1d00_ffff).unwrap();
        assert!(hard > easy);
    }

    #[test]
    fn no_retarget_network_stays_at_limit() {
        let params = chain_params(Network::Simnet);
        let chain = [HeaderInfo {
            height: 2015,
            time: 1_401_292_357,
            bits: 0x207f_ffff,
        }];
        let bits = next_work_required(&chain, None, &params).unwrap();
        assert_eq!(bits, 0x207f_ffff);
    }

    #[test]
    fn mid_interval_carries_bits_forward() {
        let params = chain_params(Network::Mainnet);
        let chain = [HeaderInfo {
            height: 100,
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
        }];
        let bits = next_work_required(&chain, None, &params).unwrap();
        assert_eq!(bits, 0x1d00_ffff);
    }

    #[test]
    fn retarget_clamps_to_factor_of_four() {
        let params = chain_params(Network::Mainnet);
        let interval = params.retarget_interval();
        // A window mined instantly: timespan clamps to timespan/4, so the
        // target shrinks by exactly four.
        let chain: Vec<HeaderInfo> = (0..interval)
            .map(|i| HeaderInfo {
                height: i,
                time: 1_231_006_505,
                bits: 0x1c00_ffff,
            })
            .collect();
        let bits = next_work_required(&chain, None, &params).unwrap();
        let old = compact_to_u256(0x1c00_ffff).unwrap();
        let new = compact_to_u256(bits).unwrap();
        assert!(new < old);
        assert!(new >= old / U256::from(5u64));
    }
}
