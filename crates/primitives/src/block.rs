use emberd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::{compact_size_len, Transaction};

pub const HEADER_SIZE: usize = 80;

/// The 80-byte wire header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size() as usize);
        self.header.encode_into(&mut encoder);
        encoder.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let count = decoder.read_compact_size()?;
        if count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn serialized_size(&self) -> u64 {
        let mut size = HEADER_SIZE as u64;
        size += compact_size_len(self.transactions.len() as u64);
        for tx in &self.transactions {
            size += tx.serialized_size();
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash256_to_hex;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    #[test]
    fn header_serialization_is_eighty_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [2u8; 32],
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        };
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::consensus_decode(&bytes).unwrap(), header);
    }

    #[test]
    fn block_roundtrips_byte_exactly() {
        let block = Block {
            header: BlockHeader {
                version: 2,
                prev_block: [7u8; 32],
                merkle_root: [9u8; 32],
                time: 100,
                bits: 0x207f_ffff,
                nonce: 4,
            },
            transactions: vec![Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig: vec![0x51],
                    sequence: TxIn::SEQUENCE_FINAL,
                }],
                vout: vec![TxOut {
                    value: 50,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        };
        let bytes = block.consensus_encode();
        assert_eq!(bytes.len() as u64, block.serialized_size());
        assert_eq!(Block::consensus_decode(&bytes).unwrap(), block);
    }

    #[test]
    fn header_hash_displays_big_endian() {
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let hex = hash256_to_hex(&header.hash());
        assert_eq!(hex.len(), 64);
    }
}
