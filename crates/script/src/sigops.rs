//! Signature-operation accounting.

use emberd_primitives::Transaction;

use crate::{
    flags, is_pay_to_script_hash, last_push, ScriptIter, OP_1, OP_16, OP_CHECKDATASIG,
    OP_CHECKDATASIGVERIFY, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG,
    OP_CHECKSIGVERIFY,
};

const MAX_PUBKEYS_PER_MULTISIG: u64 = 20;

fn decode_op_n(opcode: u8) -> u64 {
    ((opcode - OP_1) + 1) as u64
}

/// Count sigops in one script.
///
/// `accurate` uses the multisig key count when a preceding OP_N names it;
/// the legacy mode charges the worst case of 20.
pub fn script_sigop_count(script: &[u8], accurate: bool, script_flags: u32) -> u64 {
    let count_datasig = script_flags & flags::SCRIPT_ENABLE_CHECKDATASIG != 0;
    let mut count = 0u64;
    let mut last_opcode = 0xff;
    for (opcode, _) in ScriptIter::new(script) {
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += decode_op_n(last_opcode);
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG;
                }
            }
            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY if count_datasig => count += 1,
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Legacy (inaccurate) sigop count over every script in a transaction.
pub fn legacy_sigop_count(tx: &Transaction, script_flags: u32) -> u64 {
    let mut count = 0u64;
    for input in &tx.vin {
        count += script_sigop_count(&input.script_sig, false, script_flags);
    }
    for output in &tx.vout {
        count += script_sigop_count(&output.script_pubkey, false, script_flags);
    }
    count
}

/// Accurate sigop count of the redeem script a P2SH input executes.
pub fn p2sh_sigop_count(script_sig: &[u8], prev_script_pubkey: &[u8], script_flags: u32) -> u64 {
    if !is_pay_to_script_hash(prev_script_pubkey) {
        return 0;
    }
    match last_push(script_sig) {
        Some(redeem_script) => script_sigop_count(&redeem_script, true, script_flags),
        None => 0,
    }
}

/// Full per-transaction sigop count given a resolver for previous output
/// scripts (the UTXO view during connect).
pub fn transaction_sigop_count<F>(
    tx: &Transaction,
    script_flags: u32,
    mut prev_script: F,
) -> u64
where
    F: FnMut(usize) -> Option<Vec<u8>>,
{
    let mut count = legacy_sigop_count(tx, script_flags);
    if tx.is_coinbase() || script_flags & flags::SCRIPT_VERIFY_P2SH == 0 {
        return count;
    }
    for (index, input) in tx.vin.iter().enumerate() {
        if let Some(script_pubkey) = prev_script(index) {
            count += p2sh_sigop_count(&input.script_sig, &script_pubkey, script_flags);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OP_EQUAL, OP_HASH160};
    use emberd_primitives::{OutPoint, TxIn, TxOut};

    fn tx_with_scripts(script_sig: Vec<u8>, script_pubkey: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig,
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey,
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn checksig_counts_one_multisig_twenty() {
        assert_eq!(script_sigop_count(&[OP_CHECKSIG], false, 0), 1);
        assert_eq!(script_sigop_count(&[OP_CHECKMULTISIG], false, 0), 20);
        // Accurate mode reads the key count off the preceding OP_N.
        assert_eq!(
            script_sigop_count(&[0x52, OP_CHECKMULTISIG], true, 0),
            2
        );
    }

    #[test]
    fn checkdatasig_counts_only_when_enabled() {
        let script = [OP_CHECKDATASIG, OP_CHECKDATASIGVERIFY];
        assert_eq!(script_sigop_count(&script, false, 0), 0);
        assert_eq!(
            script_sigop_count(&script, false, flags::SCRIPT_ENABLE_CHECKDATASIG),
            2
        );
    }

    #[test]
    fn p2sh_redeem_script_is_counted_accurately() {
        let mut prev = vec![OP_HASH160, 0x14];
        prev.extend_from_slice(&[0u8; 20]);
        prev.push(OP_EQUAL);

        // scriptSig pushing a 2-of-N multisig redeem script.
        let redeem = vec![0x52, OP_CHECKMULTISIG];
        let mut script_sig = vec![redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);

        assert_eq!(p2sh_sigop_count(&script_sig, &prev, 0), 2);

        let tx = tx_with_scripts(script_sig, vec![OP_CHECKSIG]);
        let count =
            transaction_sigop_count(&tx, flags::SCRIPT_VERIFY_P2SH, |_| Some(prev.clone()));
        assert_eq!(count, 3);
    }
}
