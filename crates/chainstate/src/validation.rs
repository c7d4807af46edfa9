//! Validation results and context-free block checks.

use emberd_consensus::constants::{max_block_sigops, MAX_TRANSACTION_SIZE};
use emberd_consensus::money::{money_range, MAX_MONEY};
use emberd_consensus::ChainParams;
use emberd_primitives::block::Block;
use emberd_primitives::encoding::DecodeError;
use emberd_primitives::merkle::block_merkle_root;
use emberd_primitives::transaction::Transaction;
use emberd_script::{flags, legacy_sigop_count, serialized_height};
use emberd_storage::StoreError;
use std::collections::HashSet;

use crate::coins::CoinsError;
use crate::flatfiles::FlatFileError;

/// BIP61 reject codes carried on invalid results.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
    HighFee = 0x44,
}

/// Why a block or header was judged invalid.
#[derive(Clone, Copy, Debug)]
pub struct InvalidReason {
    pub code: RejectCode,
    pub reason: &'static str,
    /// Misbehavior score charged to the peer that relayed the object.
    pub dos: u32,
    /// The failure could stem from local corruption rather than the peer;
    /// such failures never mark the index entry failed.
    pub corruption_possible: bool,
}

#[derive(Clone, Debug)]
pub enum ValidationError {
    Invalid(InvalidReason),
    System(String),
}

impl ValidationError {
    pub fn invalid(code: RejectCode, reason: &'static str, dos: u32) -> Self {
        ValidationError::Invalid(InvalidReason {
            code,
            reason,
            dos,
            corruption_possible: false,
        })
    }

    pub fn invalid_mutation(code: RejectCode, reason: &'static str, dos: u32) -> Self {
        ValidationError::Invalid(InvalidReason {
            code,
            reason,
            dos,
            corruption_possible: true,
        })
    }

    pub fn system(message: impl Into<String>) -> Self {
        ValidationError::System(message.into())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationError::Invalid(_))
    }

    pub fn corruption_possible(&self) -> bool {
        match self {
            ValidationError::Invalid(reason) => reason.corruption_possible,
            ValidationError::System(_) => false,
        }
    }

    pub fn dos_score(&self) -> u32 {
        match self {
            ValidationError::Invalid(reason) => reason.dos,
            ValidationError::System(_) => 0,
        }
    }

    pub fn invalid_reason(&self) -> Option<InvalidReason> {
        match self {
            ValidationError::Invalid(reason) => Some(*reason),
            ValidationError::System(_) => None,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Invalid(reason) => {
                write!(f, "{} (code {:#04x})", reason.reason, reason.code as u8)
            }
            ValidationError::System(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError::System(err.to_string())
    }
}

impl From<FlatFileError> for ValidationError {
    fn from(err: FlatFileError) -> Self {
        ValidationError::System(err.to_string())
    }
}

impl From<CoinsError> for ValidationError {
    fn from(err: CoinsError) -> Self {
        ValidationError::System(err.to_string())
    }
}

impl From<DecodeError> for ValidationError {
    fn from(err: DecodeError) -> Self {
        ValidationError::System(err.to_string())
    }
}

/// Allowed clock drift for incoming headers.
const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Context-free header check: only the timestamp bound, everything else
/// needs the parent.
pub fn check_block_header(
    header: &emberd_primitives::block::BlockHeader,
    params: &ChainParams,
    adjusted_time: i64,
) -> Result<(), ValidationError> {
    let future_limit = if params.mine_blocks_on_demand {
        // Blocks mined on demand may carry any plausible timestamp.
        100_000 * params.consensus.pow_target_spacing
    } else {
        MAX_FUTURE_BLOCK_TIME
    };
    if header.time as i64 > adjusted_time + future_limit {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "time-too-new",
            0,
        ));
    }
    Ok(())
}

pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-txns-vin-empty",
            10,
        ));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-txns-vout-empty",
            10,
        ));
    }
    if tx.serialized_size() > MAX_TRANSACTION_SIZE {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-txns-oversize",
            100,
        ));
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-txns-vout-negative",
                100,
            ));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-txns-vout-toolarge",
                100,
            ));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-txns-txouttotal-toolarge",
                100,
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-txns-inputs-duplicate",
                100,
            ));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-cb-length",
                100,
            ));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ValidationError::invalid(
                    RejectCode::Invalid,
                    "bad-txns-prevout-null",
                    10,
                ));
            }
        }
    }

    Ok(())
}

/// Context-free block check: structure, merkle root and legacy sigop bound.
pub fn check_block(
    block: &Block,
    params: &ChainParams,
    adjusted_time: i64,
    check_merkle_root: bool,
) -> Result<(), ValidationError> {
    check_block_header(&block.header, params, adjusted_time)?;

    if check_merkle_root {
        let (root, mutated) = block_merkle_root(&block.transactions);
        if block.header.merkle_root != root {
            return Err(ValidationError::invalid_mutation(
                RejectCode::Invalid,
                "bad-txnmrklroot",
                100,
            ));
        }
        // Merkle malleability: repeated trailing transactions keep the root
        // while changing the block.
        if mutated {
            return Err(ValidationError::invalid_mutation(
                RejectCode::Invalid,
                "bad-txns-duplicate",
                100,
            ));
        }
    }

    // All potential-corruption checks precede transaction validation so a
    // valid header is never marked failed for the wrong block body.
    if block.transactions.is_empty() {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-blk-length",
            100,
        ));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-cb-missing",
            100,
        ));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-cb-multiple",
                100,
            ));
        }
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let mut sigops = 0u64;
    for tx in &block.transactions {
        sigops += legacy_sigop_count(tx, 0);
    }
    if sigops > max_block_sigops(block.serialized_size()) {
        return Err(ValidationError::invalid_mutation(
            RejectCode::Invalid,
            "bad-blk-sigops",
            100,
        ));
    }

    Ok(())
}

/// Block checks that need the parent: transaction finality, the coinbase
/// height commitment and the extended sigop count once CHECKDATASIG is live.
pub fn contextual_check_block(
    block: &Block,
    height: i32,
    lock_time_cutoff: i64,
    cdsv_active: bool,
) -> Result<(), ValidationError> {
    for tx in &block.transactions {
        if !tx.is_final(height, lock_time_cutoff) {
            return Err(ValidationError::invalid(
                RejectCode::Invalid,
                "bad-txns-nonfinal",
                10,
            ));
        }
    }

    // The coinbase commits to the block height (BIP34).
    let expect = serialized_height(height);
    let script_sig = &block.transactions[0].vin[0].script_sig;
    if script_sig.len() < expect.len() || script_sig[..expect.len()] != expect[..] {
        return Err(ValidationError::invalid(
            RejectCode::Invalid,
            "bad-cb-height",
            100,
        ));
    }

    if cdsv_active {
        let mut sigops = 0u64;
        for tx in &block.transactions {
            sigops += legacy_sigop_count(tx, flags::SCRIPT_ENABLE_CHECKDATASIG);
        }
        if sigops > max_block_sigops(block.serialized_size()) {
            return Err(ValidationError::invalid_mutation(
                RejectCode::Invalid,
                "bad-blk-sigops",
                100,
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{chain_params, Network};
    use emberd_primitives::block::BlockHeader;
    use emberd_primitives::{OutPoint, TxIn, TxOut};

    fn coinbase_tx(height: i32) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: serialized_height_script(height),
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn serialized_height_script(height: i32) -> Vec<u8> {
        let mut script = serialized_height(height);
        // Pad to the minimum coinbase script size.
        while script.len() < 2 {
            script.push(0x00);
        }
        script
    }

    fn block_with(transactions: Vec<Transaction>) -> Block {
        let (root, _) = block_merkle_root(&transactions);
        Block {
            header: BlockHeader {
                version: 0x2000_0000,
                prev_block: [1u8; 32],
                merkle_root: root,
                time: 1_600_000_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn merkle_mismatch_is_corruption_possible() {
        let params = chain_params(Network::Regtest);
        let mut block = block_with(vec![coinbase_tx(1)]);
        block.header.merkle_root = [0xabu8; 32];
        let err = check_block(&block, &params, 1_600_000_000, true).unwrap_err();
        assert!(err.corruption_possible());
    }

    #[test]
    fn multiple_coinbases_are_rejected() {
        let params = chain_params(Network::Regtest);
        let block = block_with(vec![coinbase_tx(1), coinbase_tx(2)]);
        let err = check_block(&block, &params, 1_600_000_000, true).unwrap_err();
        assert_eq!(err.invalid_reason().unwrap().reason, "bad-cb-multiple");
    }

    #[test]
    fn coinbase_height_commitment_is_enforced() {
        let block = block_with(vec![coinbase_tx(5)]);
        assert!(contextual_check_block(&block, 5, 0, false).is_ok());
        let err = contextual_check_block(&block, 6, 0, false).unwrap_err();
        assert_eq!(err.invalid_reason().unwrap().reason, "bad-cb-height");
    }

    #[test]
    fn future_timestamp_is_bounded() {
        let params = chain_params(Network::Main);
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_600_010_000,
            bits: 0x1d00_ffff,
            nonce: 0,
        };
        assert!(check_block_header(&header, &params, 1_600_000_000).is_ok());
        let err = check_block_header(&header, &params, 1_600_000_000 - 7_201).unwrap_err();
        assert_eq!(err.invalid_reason().unwrap().reason, "time-too-new");
    }
}
