//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
    Simnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Simnet => "simnet",
        }
    }
}

/// A hard-coded (height, hash) pair; any chain disagreeing at that height
/// is rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Message-start magic prepended to every wire envelope.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: Vec<&'static str>,

    pub hash_genesis_block: Hash256,
    pub genesis_version: i32,
    pub genesis_merkle_root: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,

    /// Highest permitted proof-of-work target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Allow blocks to drop to the minimum difficulty when the network has
    /// been idle longer than twice the target spacing.
    pub pow_allow_min_difficulty: bool,
    /// Skip retarget enforcement entirely (regression and simulation nets).
    pub pow_no_retargeting: bool,

    pub checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    /// Number of blocks between difficulty retargets.
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            dns_seeds: vec![
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "seed.bitcoinstats.com",
                "seed.bitnodes.io",
            ],
            hash_genesis_block: hash256_from_hex(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
            genesis_version: 1,
            genesis_merkle_root: hash256_from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            genesis_time: 1_231_006_505,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 2_083_236_893,
            pow_limit: hash256_from_hex(
                "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_allow_min_difficulty: false,
            pow_no_retargeting: false,
            checkpoints: vec![
                Checkpoint {
                    height: 11_111,
                    hash: hash256_from_hex(
                        "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                    ),
                },
                Checkpoint {
                    height: 33_333,
                    hash: hash256_from_hex(
                        "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
                    ),
                },
                Checkpoint {
                    height: 74_000,
                    hash: hash256_from_hex(
                        "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
                    ),
                },
                Checkpoint {
                    height: 105_000,
                    hash: hash256_from_hex(
                        "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                    ),
                },
                Checkpoint {
                    height: 134_444,
                    hash: hash256_from_hex(
                        "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
                    ),
                },
                Checkpoint {
                    height: 168_000,
                    hash: hash256_from_hex(
                        "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
                    ),
                },
                Checkpoint {
                    height: 193_000,
                    hash: hash256_from_hex(
                        "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
                    ),
                },
                Checkpoint {
                    height: 210_000,
                    hash: hash256_from_hex(
                        "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
                    ),
                },
            ],
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            dns_seeds: vec!["testnet-seed.bitcoin.jonasschnelli.ch", "seed.tbtc.petertodd.org"],
            hash_genesis_block: hash256_from_hex(
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            ),
            genesis_version: 1,
            genesis_merkle_root: hash256_from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            genesis_time: 1_296_688_602,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 414_098_458,
            pow_limit: hash256_from_hex(
                "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_allow_min_difficulty: true,
            pow_no_retargeting: false,
            checkpoints: vec![Checkpoint {
                height: 546,
                hash: hash256_from_hex(
                    "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
                ),
            }],
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            dns_seeds: Vec::new(),
            hash_genesis_block: hash256_from_hex(
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            ),
            genesis_version: 1,
            genesis_merkle_root: hash256_from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            genesis_time: 1_296_688_602,
            genesis_bits: 0x207f_ffff,
            genesis_nonce: 2,
            pow_limit: hash256_from_hex(
                "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_allow_min_difficulty: true,
            pow_no_retargeting: true,
            checkpoints: Vec::new(),
        },
        Network::Simnet => ChainParams {
            network,
            message_start: [0x16, 0x1c, 0x14, 0x12],
            default_port: 18555,
            dns_seeds: Vec::new(),
            hash_genesis_block: hash256_from_hex(
                "683e86bd5c6d110d91b94b97137ba6bfe02dbbdb8e3dff722a669b5d69d77af6",
            ),
            genesis_version: 1,
            genesis_merkle_root: hash256_from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            genesis_time: 1_401_292_357,
            genesis_bits: 0x207f_ffff,
            genesis_nonce: 2,
            pow_limit: hash256_from_hex(
                "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_allow_min_difficulty: true,
            pow_no_retargeting: true,
            checkpoints: Vec::new(),
        },
    }
}

/// Parses a display-order (big-endian) hex string into internal byte order.
///
/// Panics on malformed input; only used for hard-coded parameters.
pub fn hash256_from_hex(hex: &str) -> Hash256 {
    assert_eq!(hex.len(), 64, "hash hex must be 64 characters");
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[2 * i] as char).to_digit(16).expect("hex digit") as u8;
        let low = (bytes[2 * i + 1] as char).to_digit(16).expect("hex digit") as u8;
        // Reverse into little-endian internal order.
        out[31 - i] = (high << 4) | low;
    }
    out
}

/// Formats an internal-order hash as display-order hex.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_preserves_display_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex);
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn checkpoints_are_ascending() {
        let params = chain_params(Network::Mainnet);
        for pair in params.checkpoints.windows(2) {
            assert!(pair[0].height < pair[1].height);
        }
    }
}
