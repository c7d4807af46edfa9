//! Assemble the genesis block from chain parameters.

use emberd_consensus::ChainParams;
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
use emberd_primitives::OutPoint;
use emberd_script::num::script_num_bytes;
use emberd_script::OP_CHECKSIG;

pub fn genesis_block(params: &ChainParams) -> Block {
    let genesis = &params.genesis;

    // The canonical genesis input script: the original difficulty as a
    // script number, the literal 4, then the timestamp message.
    let mut script_sig = Vec::new();
    let bits_bytes = script_num_bytes(genesis.bits as i64);
    script_sig.push(bits_bytes.len() as u8);
    script_sig.extend_from_slice(&bits_bytes);
    script_sig.push(1);
    script_sig.push(4);
    let message = genesis.coinbase_message.as_bytes();
    script_sig.push(message.len() as u8);
    script_sig.extend_from_slice(message);

    let mut script_pubkey = Vec::new();
    let pubkey = hex_to_bytes(genesis.coinbase_pubkey);
    script_pubkey.push(pubkey.len() as u8);
    script_pubkey.extend_from_slice(&pubkey);
    script_pubkey.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: TxIn::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: genesis.reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    debug_assert!(hex.len() % 2 == 0);
    let bytes = hex.as_bytes();
    let mut out = Vec::with_capacity(hex.len() / 2);
    let digit = |byte: u8| -> u8 {
        match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => 0,
        }
    };
    for pair in bytes.chunks(2) {
        out.push((digit(pair[0]) << 4) | digit(pair[1]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{chain_params, params::hash256_from_hex, Network};

    #[test]
    fn mainnet_genesis_hashes_match() {
        let params = chain_params(Network::Main);
        let block = genesis_block(&params);
        assert_eq!(block.block_hash(), params.consensus.hash_genesis_block);
        assert_eq!(
            block.header.merkle_root,
            hash256_from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
        );
    }

    #[test]
    fn regtest_and_testnet_genesis_hashes_match() {
        for network in [Network::Regtest, Network::Test] {
            let params = chain_params(network);
            let block = genesis_block(&params);
            assert_eq!(
                block.block_hash(),
                params.consensus.hash_genesis_block,
                "{}",
                network.name()
            );
        }
    }

    #[test]
    fn genesis_coinbase_is_well_formed() {
        let params = chain_params(Network::Main);
        let block = genesis_block(&params);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        let script = &block.transactions[0].vin[0].script_sig;
        assert!((2..=100).contains(&script.len()));
    }
}
