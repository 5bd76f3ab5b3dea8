//! Proof-of-work target handling.

pub mod difficulty;

pub use difficulty::{
    block_proof, compact_to_u256, hash_meets_target, next_work_required, u256_to_compact,
    CompactError, DifficultyError, HeaderInfo,
};
