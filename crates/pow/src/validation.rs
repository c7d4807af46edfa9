//! Proof-of-work checks against a claimed compact target.

use emberd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowError {
    /// Target is negative, zero, overflowing, or above the pow limit.
    TargetOutOfRange,
    /// The block hash does not meet the claimed target.
    HighHash,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::TargetOutOfRange => write!(f, "target below minimum work"),
            PowError::HighHash => write!(f, "hash does not match target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(_: CompactError) -> Self {
        PowError::TargetOutOfRange
    }
}

pub fn check_pow(hash: &Hash256, bits: u32, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target.is_zero() || target > pow_limit {
        return Err(PowError::TargetOutOfRange);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HighHash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{chain_params, Network};

    #[test]
    fn rejects_zero_and_excessive_targets() {
        let params = chain_params(Network::Main).consensus;
        let hash = [0u8; 32];
        assert_eq!(
            check_pow(&hash, 0, &params),
            Err(PowError::TargetOutOfRange)
        );
        // Regtest-scale target exceeds the mainnet limit.
        assert_eq!(
            check_pow(&hash, 0x207f_ffff, &params),
            Err(PowError::TargetOutOfRange)
        );
    }

    #[test]
    fn accepts_hash_at_or_below_target() {
        let params = chain_params(Network::Regtest).consensus;
        let low_hash = [0u8; 32];
        assert_eq!(check_pow(&low_hash, 0x207f_ffff, &params), Ok(()));

        let mut high_hash = [0xffu8; 32];
        high_hash[31] = 0x7f;
        // Equal to the decoded 0x207fffff target's top byte region but above
        // the full target value.
        assert_eq!(
            check_pow(&high_hash, 0x207f_ffff, &params),
            Err(PowError::HighHash)
        );
    }
}
