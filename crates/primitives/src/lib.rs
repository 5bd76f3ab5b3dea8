//! Core block types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;

pub use block::{Block, BlockHeader, HEADER_SIZE};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{sha256, sha256d, sha256d_pair};
