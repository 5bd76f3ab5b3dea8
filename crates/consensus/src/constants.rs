//! Protocol-wide constants shared across the peer and sync layers.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: u32 = 70_013;
/// Protocol version that introduced timestamps in addr messages.
pub const NET_ADDRESS_TIME_VERSION: u32 = 31_402;
/// Protocol version that introduced BIP-37 transaction filtering.
pub const BIP37_VERSION: u32 = 70_001;
/// Protocol version that introduced the sendheaders command.
pub const SEND_HEADERS_VERSION: u32 = 70_012;

/// Maximum number of headers in a single headers message (network rule).
pub const MAX_HEADERS_PER_MSG: usize = 2_000;
/// Maximum number of inventory vectors in a single message (network rule).
pub const MAX_INV_PER_MSG: usize = 50_000;
/// Maximum number of entries in a single addr message (network rule).
pub const MAX_ADDR_PER_MSG: usize = 1_000;
/// Maximum number of hashes in a block locator.
pub const MAX_LOCATOR_HASHES: usize = 500;

/// Service bit advertising full-block serving capability.
pub const NODE_NETWORK: u64 = 1;
/// Service bit advertising committed-filter serving capability.
pub const NODE_CF: u64 = 1 << 6;

/// Largest valid amount in the money range, in base units.
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// How far a header timestamp may be ahead of adjusted network time.
pub const MAX_TIME_OFFSET_SECS: i64 = 2 * 60 * 60;
/// Number of block times used for the median-time-past calculation.
pub const MEDIAN_TIME_SPAN: usize = 11;
