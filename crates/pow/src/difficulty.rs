//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use emberd_consensus::{ConsensusParams, Hash256, RetargetPolicy};
use primitive_types::U256;

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
    NonContiguous,
    /// The header window does not reach back to the retarget boundary.
    ShortChain,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
            DifficultyError::ShortChain => {
                write!(f, "header list does not cover the retarget window")
            }
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

/// The slice of header data retargeting reads, oldest first.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

/// EMA gain denominator; one step moves the target by at most
/// [1 - 1/11, 1 + 1/10] of its prior value.
const WTEMA_ALPHA_INV: i64 = 11;
/// Solvetimes are clamped before feeding the EMA.
const WTEMA_MAX_SOLVETIME_SPACINGS: i64 = 6;

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
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
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

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Work contributed by a block: ~target / (target + 1) + 1, the 256-bit
/// safe form of 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Work contributed by a block on a competing fork, attenuated by how late
/// its data arrived relative to the active branch at the fork point.
///
/// The shift halves the contribution once per two target spacings of delay,
/// with the boundary placed so a block arriving just under one spacing late
/// is not penalized at all.
pub fn penalized_block_proof(
    bits: u32,
    time_data_received: i64,
    active_fork_start_time: i64,
    target_spacing: i64,
) -> Result<U256, CompactError> {
    let proof = block_proof(bits)?;
    if active_fork_start_time == 0 || target_spacing <= 0 {
        return Ok(proof);
    }
    let delta = time_data_received.saturating_sub(active_fork_start_time);
    let shift = (delta + target_spacing) / (2 * target_spacing);
    if shift <= 0 {
        return Ok(proof);
    }
    if shift >= 256 {
        return Ok(U256::zero());
    }
    Ok(proof >> shift as usize)
}

/// Compute the required `bits` for the block following `chain`, whose last
/// element is the current tip of the branch being extended.
pub fn next_work_required(
    chain: &[HeaderInfo],
    next_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(pow_limit_bits);
    };
    ensure_contiguous(chain)?;

    match params.retarget {
        RetargetPolicy::NoRetargeting => Ok(last.bits),
        RetargetPolicy::Wtema => wtema_next_work(chain, params, pow_limit_bits),
        RetargetPolicy::Interval => interval_next_work(chain, next_time, params, pow_limit_bits),
    }
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

fn wtema_next_work(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
    pow_limit_bits: u32,
) -> Result<u32, DifficultyError> {
    if chain.len() < 2 {
        return Ok(pow_limit_bits);
    }
    let last = chain[chain.len() - 1];
    let prev = chain[chain.len() - 2];
    let spacing = params.pow_target_spacing;
    let solvetime = (last.time - prev.time).clamp(0, WTEMA_MAX_SOLVETIME_SPACINGS * spacing);

    let prior = compact_to_u256(last.bits)?;
    // next = prior * ((a - 1) * T + t) / (a * T), divided first so targets
    // near the 256-bit limit cannot overflow the product.
    let denom = U256::from((WTEMA_ALPHA_INV * spacing) as u64);
    let numer = U256::from(((WTEMA_ALPHA_INV - 1) * spacing + solvetime) as u64);
    let mut next = (prior / denom) * numer;

    let floor = prior - prior / U256::from(WTEMA_ALPHA_INV as u64);
    let ceiling = prior + prior / U256::from((WTEMA_ALPHA_INV - 1) as u64);
    if next < floor {
        next = floor;
    }
    if next > ceiling {
        next = ceiling;
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn interval_next_work(
    chain: &[HeaderInfo],
    next_time: i64,
    params: &ConsensusParams,
    pow_limit_bits: u32,
) -> Result<u32, DifficultyError> {
    let last = chain[chain.len() - 1];
    let interval = params.difficulty_adjustment_interval();
    let spacing = params.pow_target_spacing;

    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty {
            // A block more than two spacings late may be mined at the
            // minimum difficulty.
            if next_time > last.time + 2 * spacing {
                return Ok(pow_limit_bits);
            }
            // Otherwise require the last non-minimum difficulty reached on
            // this interval.
            let mut idx = chain.len() - 1;
            while idx > 0 && chain[idx].height % interval != 0 && chain[idx].bits == pow_limit_bits
            {
                idx -= 1;
            }
            return Ok(chain[idx].bits);
        }
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let base = chain[0].height;
    if first_height < base {
        return Err(DifficultyError::ShortChain);
    }
    let first = chain[(first_height - base) as usize];

    let timespan = params.pow_target_timespan;
    let actual = (last.time - first.time).clamp(timespan / 4, timespan * 4);

    let prior = compact_to_u256(last.bits)?;
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let (product, overflowed) = prior.overflowing_mul(U256::from(actual as u64));
    let mut next = if overflowed {
        pow_limit
    } else {
        product / U256::from(timespan as u64)
    };
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{chain_params, Network};

    #[test]
    fn compact_roundtrips_for_representable_targets() {
        for bits in [
            0x1d00_ffffu32,
            0x1b04_04cb,
            0x1715_a35c,
            0x207f_ffff,
            0x2000_ffff,
            0x0100_0012,
            0x0200_1234,
            0x0312_3456,
        ] {
            let target = compact_to_u256(bits).expect("valid compact");
            assert_eq!(u256_to_compact(target), bits, "bits {bits:#x}");
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn block_proof_matches_known_values() {
        assert_eq!(block_proof(0x207f_ffff).unwrap(), U256::from(2u64));
        assert_eq!(block_proof(0x203f_ffff).unwrap(), U256::from(4u64));
        assert_eq!(block_proof(0x2027_ffff).unwrap(), U256::from(6u64));
        assert_eq!(block_proof(0x200f_ffff).unwrap(), U256::from(16u64));
        assert_eq!(block_proof(0x201f_ffff).unwrap(), U256::from(8u64));
    }

    #[test]
    fn penalty_shift_boundaries() {
        let spacing = 600;
        let fork_start = 1_000_000;
        let at = |delta: i64, bits: u32| {
            penalized_block_proof(bits, fork_start + delta, fork_start, spacing).unwrap()
        };
        // Arriving just under one spacing late keeps full work.
        assert_eq!(at(599, 0x203f_ffff), U256::from(4u64));
        // One spacing halves it.
        assert_eq!(at(600, 0x2027_ffff), U256::from(3u64));
        // Three spacings quarter it.
        assert_eq!(at(1800, 0x2027_ffff), U256::from(1u64));
        // Hours late reduces even heavy blocks to nothing.
        assert_eq!(at(7200, 0x200f_ffff), U256::zero());
        // Blocks received before the fork started are untouched.
        assert_eq!(at(-50, 0x203f_ffff), U256::from(4u64));
    }

    #[test]
    fn no_retargeting_keeps_previous_bits() {
        let params = chain_params(Network::Regtest).consensus;
        let chain = [HeaderInfo {
            height: 10,
            time: 1_000,
            bits: 0x207f_ffff,
        }];
        assert_eq!(
            next_work_required(&chain, 2_000, &params).unwrap(),
            0x207f_ffff
        );
    }

    #[test]
    fn interval_retarget_clamps_to_quarter_and_quadruple() {
        let mut params = chain_params(Network::Main).consensus;
        params.pow_allow_min_difficulty = false;
        let interval = params.difficulty_adjustment_interval();
        let spacing = params.pow_target_spacing;

        let window = |timespan: i64| -> Vec<HeaderInfo> {
            (0..interval)
                .map(|i| HeaderInfo {
                    height: i,
                    time: 1_000_000 + i * timespan / (interval - 1),
                    bits: 0x1c10_0000,
                })
                .collect()
        };

        // Blocks took four times too long: target quadruples.
        let slow = window(params.pow_target_timespan * 8);
        let slow_bits = next_work_required(&slow, 0, &params).unwrap();
        let slow_target = compact_to_u256(slow_bits).unwrap();
        let prior = compact_to_u256(0x1c10_0000).unwrap();
        assert_eq!(slow_target, prior * U256::from(4u64));

        // Blocks came far too fast: target quarters.
        let fast = window(spacing);
        let fast_bits = next_work_required(&fast, 0, &params).unwrap();
        let fast_target = compact_to_u256(fast_bits).unwrap();
        assert_eq!(fast_target, prior / U256::from(4u64));
    }

    #[test]
    fn wtema_steps_are_bounded() {
        let mut params = chain_params(Network::Main).consensus;
        params.retarget = RetargetPolicy::Wtema;
        let spacing = params.pow_target_spacing;
        let prior_bits = 0x1c10_0000;
        let prior = compact_to_u256(prior_bits).unwrap();

        let chain = |solvetime: i64| {
            [
                HeaderInfo {
                    height: 100,
                    time: 1_000_000,
                    bits: prior_bits,
                },
                HeaderInfo {
                    height: 101,
                    time: 1_000_000 + solvetime,
                    bits: prior_bits,
                },
            ]
        };

        // On-schedule block leaves the target within rounding of itself.
        let steady = compact_to_u256(next_work_required(&chain(spacing), 0, &params).unwrap())
            .unwrap();
        assert!(steady <= prior);
        assert!(steady >= prior - prior / U256::from(1000u64));

        // An instant block cannot drop the target below 10/11 of prior.
        let floor = compact_to_u256(next_work_required(&chain(0), 0, &params).unwrap()).unwrap();
        assert!(floor >= prior - prior / U256::from(10u64));

        // A very slow block cannot raise it above 11/10 of prior.
        let ceiling =
            compact_to_u256(next_work_required(&chain(spacing * 100), 0, &params).unwrap())
                .unwrap();
        assert!(ceiling <= prior + prior / U256::from(9u64));
    }

    #[test]
    fn min_difficulty_gap_rule_returns_limit() {
        let params = chain_params(Network::Test).consensus;
        let limit_bits = target_to_compact(&params.pow_limit);
        let chain = [
            HeaderInfo {
                height: 9,
                time: 1_000_000,
                bits: 0x1c10_0000,
            },
            HeaderInfo {
                height: 10,
                time: 1_000_600,
                bits: 0x1c10_0000,
            },
        ];
        let late = 1_000_600 + params.pow_target_spacing * 2 + 1;
        assert_eq!(next_work_required(&chain, late, &params).unwrap(), limit_bits);
        // An on-time block keeps the real difficulty.
        assert_eq!(
            next_work_required(&chain, 1_001_200, &params).unwrap(),
            0x1c10_0000
        );
    }
}
