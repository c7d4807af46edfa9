//! Per-block undo data: the coins each input consumed.

use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

/// Spent coins of one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub coins: Vec<Coin>,
}

/// Undo records for every non-coinbase transaction of a block, in block
/// order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub tx_undo: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.tx_undo.len() as u64);
        for tx in &self.tx_undo {
            encoder.write_compact_size(tx.coins.len() as u64);
            for coin in &tx.coins {
                encoder.write_var_bytes(&coin.encode());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_compact_size()?;
        if tx_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut tx_undo = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let coin_count = decoder.read_compact_size()?;
            if coin_count > decoder.remaining() as u64 {
                return Err(DecodeError::Oversized);
            }
            let mut coins = Vec::with_capacity(coin_count as usize);
            for _ in 0..coin_count {
                let coin_bytes = decoder.read_var_bytes()?;
                coins.push(Coin::decode(&coin_bytes)?);
            }
            tx_undo.push(TxUndo { coins });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { tx_undo })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_roundtrips() {
        let undo = BlockUndo {
            tx_undo: vec![
                TxUndo {
                    coins: vec![Coin {
                        value: 12_345,
                        script_pubkey: vec![0xac],
                        height: 42,
                        is_coinbase: true,
                    }],
                },
                TxUndo { coins: Vec::new() },
            ],
        };
        let bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).unwrap(), undo);
    }
}
