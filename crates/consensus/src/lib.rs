//! Chain parameters and consensus-wide constants.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use deployments::{DeploymentPos, ForkDeployment, MAX_VERSION_BITS_DEPLOYMENTS};
pub use params::{chain_params, ChainParams, Checkpoint, ConsensusParams, Network, RetargetPolicy};
pub use rewards::block_subsidy;

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub const NULL_HASH: Hash256 = [0u8; 32];
