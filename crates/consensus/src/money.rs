//! Monetary amounts and their valid range.

/// Number of base units in one coin.
pub const COIN: i64 = 100_000_000;
/// Upper bound on any amount appearing in a transaction (network rule).
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
