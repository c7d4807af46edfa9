//! Consensus-wide constants shared across validation.

/// Legacy maximum block size and the floor for size votes (network rule).
pub const MAX_BLOCK_SIZE: u64 = 1_000_000;
/// The maximum allowed size for a serialized transaction, in bytes (network rule).
pub const MAX_TRANSACTION_SIZE: u64 = 1_000_000;
/// The maximum allowed number of signature check operations per transaction (network rule).
pub const MAX_TX_SIGOPS_COUNT: u64 = 20_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks (network rule).
pub const COINBASE_MATURITY: i32 = 100;

/// Block files holding a block this close to the tip are never pruned.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// Farthest ahead of the last common block we fetch from a single peer.
pub const BLOCK_DOWNLOAD_WINDOW: i32 = 1024;

/// Block versions at or above this value carry versionbits signals.
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
/// Mask isolating the versionbits marker bits.
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
/// Number of usable signal bits below the marker.
pub const VERSIONBITS_NUM_BITS: u32 = 29;

/// Interpret sequence numbers as relative lock-time constraints.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use median time past instead of the block timestamp as the lock-time cutoff.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;

/// Lock-time values at or above this threshold are timestamps, below it heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Seconds between periodic block index writes.
pub const DATABASE_WRITE_INTERVAL: i64 = 60 * 60;
/// Seconds between periodic coin cache flushes.
pub const DATABASE_FLUSH_INTERVAL: i64 = 24 * 60 * 60;

/// The maximum allowed number of signature check operations scaled by block size
/// (network rule).
pub fn max_block_sigops(block_size: u64) -> u64 {
    (block_size.saturating_sub(1) / 1_000_000 + 1) * 1_000_000 / 50
}

#[cfg(test)]
mod tests {
    use super::max_block_sigops;

    #[test]
    fn sigop_limit_scales_with_block_size() {
        assert_eq!(max_block_sigops(1), 20_000);
        assert_eq!(max_block_sigops(1_000_000), 20_000);
        assert_eq!(max_block_sigops(1_000_001), 40_000);
        assert_eq!(max_block_sigops(8_000_000), 160_000);
    }
}
