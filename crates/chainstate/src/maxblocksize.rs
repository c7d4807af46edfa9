//! Miner-voted block size limit (coinbase size votes over retarget
//! intervals).

use emberd_consensus::constants::MAX_BLOCK_SIZE;
use emberd_consensus::ConsensusParams;
use emberd_script::serialized_height;

use crate::blockindex::{BlockIndex, BlockIndexId};

/// The size cap for the block following `last`.
///
/// The cap only moves on adjustment-interval boundaries, reading the 75th
/// percentile of the interval's votes in each direction and limiting any
/// change to 5%.
pub fn next_max_block_size(
    index: &BlockIndex,
    last: Option<BlockIndexId>,
    params: &ConsensusParams,
) -> u64 {
    let Some(last_id) = last else {
        return MAX_BLOCK_SIZE;
    };
    let last_entry = index.entry(last_id);
    let mut max_block_size = last_entry.max_block_size.max(MAX_BLOCK_SIZE);

    let interval = params.max_block_size_adjustment_interval as i64;
    if (last_entry.height as i64 + 1) % interval != 0 {
        return max_block_size;
    }

    let mut votes = Vec::with_capacity(interval as usize);
    let mut walk = Some(last_id);
    for _ in 0..interval {
        let Some(id) = walk else {
            // The interval reaches past genesis only on tiny test chains.
            break;
        };
        let entry = index.entry(id);
        votes.push(if entry.max_block_size_vote != 0 {
            entry.max_block_size_vote
        } else {
            max_block_size
        });
        walk = entry.prev;
    }
    votes.sort_unstable();

    let change_position = params.max_block_size_change_position as usize;
    if votes.len() < change_position {
        return max_block_size;
    }
    let lower_value = votes[change_position - 1];
    let mut raise_value = votes[votes.len() - change_position];

    let raise_cap = next_block_raise_cap(max_block_size);
    raise_value = raise_value.min(raise_cap);
    if raise_value > max_block_size {
        max_block_size = raise_value;
    } else {
        let lower_floor = max_block_size * 100 / 105;
        let lower_value = lower_value.max(lower_floor);
        if lower_value < max_block_size {
            max_block_size = lower_value;
        }
    }

    max_block_size
}

/// The limit may be raised at most 5% per adjustment.
pub fn next_block_raise_cap(current: u64) -> u64 {
    current * 105 / 100
}

/// Parse the size vote out of a coinbase script: an explicit `/BIP100/B<n>/`
/// vote wins over an `/EB<n>/` advertisement; both are megabytes.
pub fn max_block_size_vote(coinbase_script_sig: &[u8], height: i32) -> u64 {
    // Skip the serialized height when it prefixes the coinbase.
    let expect = serialized_height(height);
    let start = if coinbase_script_sig.len() >= expect.len()
        && coinbase_script_sig[..expect.len()] == expect[..]
    {
        expect.len()
    } else {
        0
    };
    let text = &coinbase_script_sig[start..];
    // Shortest possible vote is "/EB1/".
    if text.len() < 5 {
        return 0;
    }
    find_vote(text) * 1_000_000
}

fn find_vote(text: &[u8]) -> u64 {
    let mut eb_vote: Option<u64> = None;
    let mut current: Vec<u8> = Vec::new();
    let mut bip100_vote = false;
    let mut started = false;

    for &byte in text {
        if byte == b'/' {
            started = true;
            if current.len() < 2 {
                bip100_vote = false;
                current.clear();
                continue;
            }
            if current == b"BIP100" {
                bip100_vote = true;
                current.clear();
                continue;
            }
            if bip100_vote && current[0] == b'B' {
                if let Some(value) = parse_decimal(&current[1..]) {
                    return value;
                }
            }
            if eb_vote.is_none() && current[0] == b'E' && current[1] == b'B' {
                eb_vote = parse_decimal(&current[2..]);
            }
            bip100_vote = false;
            current.clear();
        } else if started {
            current.push(byte);
        }
    }
    eb_vote.unwrap_or(0)
}

fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }
    let mut value = 0u64;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (byte - b'0') as u64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_height(height: i32, text: &str) -> Vec<u8> {
        let mut script = serialized_height(height);
        script.extend_from_slice(text.as_bytes());
        script
    }

    #[test]
    fn explicit_bip100_vote_wins_over_eb() {
        let script = with_height(100, "/EB2/BIP100/B8/");
        assert_eq!(max_block_size_vote(&script, 100), 8_000_000);
    }

    #[test]
    fn eb_advertisement_counts_as_vote() {
        let script = with_height(5, "some-tag/EB32/other");
        assert_eq!(max_block_size_vote(&script, 5), 32_000_000);
    }

    #[test]
    fn absent_or_malformed_votes_are_zero() {
        assert_eq!(max_block_size_vote(&with_height(5, ""), 5), 0);
        assert_eq!(max_block_size_vote(&with_height(5, "/EBx/"), 5), 0);
        assert_eq!(max_block_size_vote(&with_height(5, "/B8/"), 5), 0);
    }

    #[test]
    fn raise_cap_is_five_percent() {
        assert_eq!(next_block_raise_cap(1_000_000), 1_050_000);
        assert_eq!(next_block_raise_cap(8_000_000), 8_400_000);
    }
}
