//! Merkle root computation with mutation detection.

use emberd_consensus::Hash256;

use crate::hash::sha256d;
use crate::transaction::Transaction;

/// Compute the block merkle root over transaction ids.
///
/// The second return value reports merkle malleability (CVE-2012-2459):
/// repeating trailing transactions produces the same root while changing the
/// block, so a mutated tree must be rejected outright.
pub fn block_merkle_root(transactions: &[Transaction]) -> (Hash256, bool) {
    let leaves: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
    merkle_root_from_leaves(leaves)
}

pub fn merkle_root_from_leaves(mut hashes: Vec<Hash256>) -> (Hash256, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    while hashes.len() > 1 {
        let mut next = Vec::with_capacity(hashes.len().div_ceil(2));
        for pair in hashes.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&left);
            concat[32..].copy_from_slice(&right);
            next.push(sha256d(&concat));
        }
        hashes = next;
    }
    (hashes[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash256 {
        [byte; 32]
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let (root, mutated) = merkle_root_from_leaves(vec![leaf(1)]);
        assert_eq!(root, leaf(1));
        assert!(!mutated);
    }

    #[test]
    fn duplicated_trailing_leaves_report_mutation() {
        // [a, b, c] and [a, b, c, c] share a root; the latter is mutated.
        let (root_odd, mutated_odd) = merkle_root_from_leaves(vec![leaf(1), leaf(2), leaf(3)]);
        let (root_dup, mutated_dup) =
            merkle_root_from_leaves(vec![leaf(1), leaf(2), leaf(3), leaf(3)]);
        assert_eq!(root_odd, root_dup);
        assert!(!mutated_odd);
        assert!(mutated_dup);
    }

    #[test]
    fn order_matters() {
        let (root_ab, _) = merkle_root_from_leaves(vec![leaf(1), leaf(2)]);
        let (root_ba, _) = merkle_root_from_leaves(vec![leaf(2), leaf(1)]);
        assert_ne!(root_ab, root_ba);
    }
}
