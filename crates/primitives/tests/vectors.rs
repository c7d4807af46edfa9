//! Wire-format vectors against the canonical genesis serialization.

use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::hash::hash256_to_hex;
use emberd_primitives::transaction::Transaction;

const GENESIS_BLOCK_HEX: &str = "\
0100000000000000000000000000000000000000000000000000000000000000000000003ba3ed\
fd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac\
2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000\
ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63\
656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e\
6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e039\
09a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf1\
1d5fac00000000";

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    let digit = |byte: u8| (byte as char).to_digit(16).expect("hex digit") as u8;
    for pair in bytes.chunks(2) {
        out.push((digit(pair[0]) << 4) | digit(pair[1]));
    }
    out
}

#[test]
fn genesis_block_roundtrips_byte_exactly() {
    let bytes = hex_to_bytes(GENESIS_BLOCK_HEX);
    let block = Block::consensus_decode(&bytes).expect("decode genesis");
    assert_eq!(block.transactions.len(), 1);
    assert!(block.transactions[0].is_coinbase());
    assert_eq!(block.consensus_encode(), bytes);
    assert_eq!(block.serialized_size(), bytes.len() as u64);
}

#[test]
fn genesis_header_hashes_to_the_known_value() {
    let bytes = hex_to_bytes(GENESIS_BLOCK_HEX);
    let header = BlockHeader::consensus_decode(&bytes[..80]).expect("decode header");
    assert_eq!(
        hash256_to_hex(&header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    assert_eq!(
        hash256_to_hex(&header.merkle_root),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
}

#[test]
fn genesis_coinbase_txid_is_the_merkle_root() {
    let bytes = hex_to_bytes(GENESIS_BLOCK_HEX);
    let block = Block::consensus_decode(&bytes).expect("decode genesis");
    assert_eq!(block.transactions[0].txid(), block.header.merkle_root);

    let tx_bytes = block.transactions[0].consensus_encode();
    let tx = Transaction::consensus_decode(&tx_bytes).expect("decode coinbase");
    assert_eq!(tx, block.transactions[0]);
}
