//! Network-specific chain parameters, selected once at startup by name.

use crate::deployments::{DeploymentPos, ForkDeployment, MAX_VERSION_BITS_DEPLOYMENTS};
use crate::money::COIN;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn name(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

/// A height/hash pair declared trusted by the chain parameters.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// How the required work for the next block is derived from its ancestors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetargetPolicy {
    /// Keep the previous target forever (regtest).
    NoRetargeting,
    /// Classic interval retarget clamped to [1/4, 4]x of the nominal timespan.
    Interval,
    /// Per-block exponential moving average clamped to [10/11, 11/10]x.
    Wtema,
}

/// Parameters that influence chain consensus.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Configured rule-change deployments, indexed by versionbit position.
    pub deployments: [Option<ForkDeployment>; MAX_VERSION_BITS_DEPLOYMENTS],

    /// One-based position from the end (beginning) of the ascending sorted list
    /// of max-block-size votes in an adjustment interval, at which the possible
    /// new higher (lower) limit is read. 1512 = 75th percentile of 2016.
    pub max_block_size_change_position: u32,
    pub max_block_size_adjustment_interval: u32,

    /// Highest admissible target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    /// Nominal timespan of one classic retarget interval, in seconds.
    pub pow_target_timespan: i64,
    pub retarget: RetargetPolicy,
    /// Testnet rule: a block twice the spacing late may use the pow limit.
    pub pow_allow_min_difficulty: bool,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn deployment(&self, pos: DeploymentPos) -> Option<&ForkDeployment> {
        self.deployments[pos.as_usize()].as_ref()
    }
}

/// Literal fields of the genesis block; the block itself is assembled by the
/// chainstate crate from these.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: i64,
    /// Text embedded in the genesis coinbase input.
    pub coinbase_message: &'static str,
    /// Raw public key paid by the genesis coinbase output.
    pub coinbase_pubkey: &'static str,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Message-start magic, also used to frame block file records.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub consensus: ConsensusParams,
    pub genesis: GenesisParams,
    pub checkpoints: Vec<Checkpoint>,
    /// Transaction count as of the last checkpoint, for progress display.
    pub checkpoint_total_tx: u64,
    /// Estimated transactions per day after the last checkpoint.
    pub checkpoint_tx_per_day: f64,
    /// Number of maximum-size blocks a block file holds before rolling over.
    pub min_blockfile_blocks: u64,
    /// Pruning never considers the chain below this height.
    pub prune_after_height: i32,
    /// Whether blocks are only produced on demand (regtest).
    pub mine_blocks_on_demand: bool,
}

impl ChainParams {
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Main => main_params(),
        Network::Test => test_params(),
        Network::Regtest => regtest_params(),
    }
}

const GENESIS_MESSAGE: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
                              49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

fn main_deployments() -> [Option<ForkDeployment>; MAX_VERSION_BITS_DEPLOYMENTS] {
    let mut deployments = [None; MAX_VERSION_BITS_DEPLOYMENTS];
    deployments[DeploymentPos::Cdsv.as_usize()] = Some(ForkDeployment {
        name: "cdsv",
        gbt_force: true,
        start_time: 1_557_921_600,
        timeout: 1_589_457_600,
        window_size: 12_960,
        threshold: 9_720,
        min_locked_blocks: 0,
        min_locked_time: 7_776_000,
    });
    deployments[DeploymentPos::Csv.as_usize()] = Some(ForkDeployment {
        name: "csv",
        gbt_force: true,
        start_time: 1_462_060_800,
        timeout: 1_493_596_800,
        window_size: 2_016,
        threshold: 1_916,
        min_locked_blocks: 0,
        min_locked_time: 0,
    });
    deployments[DeploymentPos::TestDummy.as_usize()] = Some(ForkDeployment {
        name: "testdummy",
        gbt_force: false,
        start_time: 1_199_145_601,
        timeout: 1_230_767_999,
        window_size: 2_016,
        threshold: 1_916,
        min_locked_blocks: 0,
        min_locked_time: 0,
    });
    deployments
}

fn regtest_deployments() -> [Option<ForkDeployment>; MAX_VERSION_BITS_DEPLOYMENTS] {
    let mut deployments = [None; MAX_VERSION_BITS_DEPLOYMENTS];
    deployments[DeploymentPos::Cdsv.as_usize()] = Some(ForkDeployment {
        name: "cdsv",
        gbt_force: true,
        start_time: 0,
        timeout: 9_999_999_999,
        window_size: 144,
        threshold: 108,
        min_locked_blocks: 0,
        min_locked_time: 0,
    });
    deployments[DeploymentPos::Csv.as_usize()] = Some(ForkDeployment {
        name: "csv",
        gbt_force: true,
        start_time: 0,
        timeout: 9_999_999_999,
        window_size: 144,
        threshold: 108,
        min_locked_blocks: 0,
        min_locked_time: 0,
    });
    deployments[DeploymentPos::TestDummy.as_usize()] = Some(ForkDeployment {
        name: "testdummy",
        gbt_force: false,
        start_time: 0,
        timeout: 9_999_999_999,
        window_size: 144,
        threshold: 108,
        min_locked_blocks: 0,
        min_locked_time: 0,
    });
    deployments
}

fn main_params() -> ChainParams {
    ChainParams {
        network: Network::Main,
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8333,
        consensus: ConsensusParams {
            hash_genesis_block: hash256_from_hex(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
            subsidy_halving_interval: 210_000,
            deployments: main_deployments(),
            max_block_size_change_position: 1_512,
            max_block_size_adjustment_interval: 2_016,
            pow_limit: hash256_from_hex(
                "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            retarget: RetargetPolicy::Interval,
            pow_allow_min_difficulty: false,
        },
        genesis: GenesisParams {
            version: 1,
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
            reward: 50 * COIN,
            coinbase_message: GENESIS_MESSAGE,
            coinbase_pubkey: GENESIS_PUBKEY,
        },
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
                height: 105_000,
                hash: hash256_from_hex(
                    "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                ),
            },
            Checkpoint {
                height: 168_000,
                hash: hash256_from_hex(
                    "000000000000099e61ea72015e79632f216fe2cb33d7899acb35b75c8303b763",
                ),
            },
            Checkpoint {
                height: 295_000,
                hash: hash256_from_hex(
                    "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
                ),
            },
        ],
        checkpoint_total_tx: 36_544_669,
        checkpoint_tx_per_day: 60_000.0,
        min_blockfile_blocks: 128,
        prune_after_height: 100_000,
        mine_blocks_on_demand: false,
    }
}

fn test_params() -> ChainParams {
    let mut params = main_params();
    params.network = Network::Test;
    params.message_start = [0x0b, 0x11, 0x09, 0x07];
    params.default_port = 18_333;
    params.consensus.hash_genesis_block =
        hash256_from_hex("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943");
    params.consensus.pow_allow_min_difficulty = true;
    params.genesis.time = 1_296_688_602;
    params.genesis.nonce = 414_098_458;
    params.checkpoints = vec![Checkpoint {
        height: 546,
        hash: hash256_from_hex(
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        ),
    }];
    params.checkpoint_total_tx = 198;
    params.checkpoint_tx_per_day = 300.0;
    params.prune_after_height = 1_000;
    params
}

fn regtest_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        consensus: ConsensusParams {
            hash_genesis_block: hash256_from_hex(
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            ),
            subsidy_halving_interval: 150,
            deployments: regtest_deployments(),
            max_block_size_change_position: 1_512,
            max_block_size_adjustment_interval: 2_016,
            pow_limit: hash256_from_hex(
                "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            retarget: RetargetPolicy::NoRetargeting,
            pow_allow_min_difficulty: true,
        },
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
            reward: 50 * COIN,
            coinbase_message: GENESIS_MESSAGE,
            coinbase_pubkey: GENESIS_PUBKEY,
        },
        checkpoints: Vec::new(),
        checkpoint_total_tx: 0,
        checkpoint_tx_per_day: 300.0,
        min_blockfile_blocks: 128,
        prune_after_height: 0,
        mine_blocks_on_demand: true,
    }
}

/// Parse a big-endian hash literal into internal byte order.
///
/// Only called on the static tables above; a malformed literal is a
/// programming error.
pub fn hash256_from_hex(hex: &str) -> Hash256 {
    assert_eq!(hex.len(), 64, "hash literal must be 64 hex digits");
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = hex_digit(bytes[2 * i]);
        let low = hex_digit(bytes[2 * i + 1]);
        // Display order is big-endian; internal order is reversed.
        out[31 - i] = (high << 4) | low;
    }
    out
}

fn hex_digit(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => panic!("invalid hex digit in hash literal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_literals_reverse_to_internal_order() {
        let hash = hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        );
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash[31], 0x00);
    }

    #[test]
    fn networks_have_distinct_magic() {
        let main = chain_params(Network::Main);
        let test = chain_params(Network::Test);
        let regtest = chain_params(Network::Regtest);
        assert_ne!(main.message_start, test.message_start);
        assert_ne!(main.message_start, regtest.message_start);
        assert_ne!(test.message_start, regtest.message_start);
    }

    #[test]
    fn regtest_does_not_retarget() {
        let params = chain_params(Network::Regtest);
        assert_eq!(params.consensus.retarget, RetargetPolicy::NoRetargeting);
        assert!(params.consensus.pow_allow_min_difficulty);
    }
}
