//! Block subsidy schedule.

use crate::money::COIN;
use crate::params::ConsensusParams;

pub fn block_subsidy(height: i32, params: &ConsensusParams) -> i64 {
    let halvings = height / params.subsidy_halving_interval;
    // Force the subsidy to zero once the shift would wrap.
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::block_subsidy;
    use crate::money::COIN;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_on_schedule() {
        let params = chain_params(Network::Main).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 12 * COIN + COIN / 2);
        assert_eq!(block_subsidy(64 * 210_000, &params), 0);
    }
}
