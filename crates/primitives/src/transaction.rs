use emberd_consensus::constants::LOCKTIME_THRESHOLD;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use emberd_consensus::Hash256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
    /// If set, the sequence number carries no relative lock-time meaning.
    pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
    /// If set, the lock-time is time-based; otherwise height-based.
    pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
    pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
    /// Time-based relative lock-times tick in units of 2^9 seconds.
    pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

    fn encode_into(&self, encoder: &mut Encoder) {
        self.prevout.encode_into(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let prevout = OutPoint::decode_from(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Sum of output values; `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        let mut total = 0i64;
        for output in &self.vout {
            total = total.checked_add(output.value)?;
        }
        Some(total)
    }

    /// Whether the transaction is final with respect to a lock-time cutoff
    /// (a height if below the threshold, otherwise a timestamp).
    pub fn is_final(&self, height: i32, time_cutoff: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            time_cutoff
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin
            .iter()
            .all(|input| input.sequence == TxIn::SEQUENCE_FINAL)
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_compact_size(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_into(encoder);
        }
        encoder.write_compact_size(self.vout.len() as u64);
        for output in &self.vout {
            output.encode_into(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size() as usize);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_compact_size()?;
        if input_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut vin = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            vin.push(TxIn::decode_from(decoder)?);
        }
        let output_count = decoder.read_compact_size()?;
        if output_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut vout = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            vout.push(TxOut::decode_from(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn serialized_size(&self) -> u64 {
        let mut size = 4u64 + 4;
        size += compact_size_len(self.vin.len() as u64);
        for input in &self.vin {
            size += 36 + 4;
            size += compact_size_len(input.script_sig.len() as u64) + input.script_sig.len() as u64;
        }
        size += compact_size_len(self.vout.len() as u64);
        for output in &self.vout {
            size += 8;
            size += compact_size_len(output.script_pubkey.len() as u64)
                + output.script_pubkey.len() as u64;
        }
        size
    }
}

pub(crate) fn compact_size_len(value: u64) -> u64 {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(height_script: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: height_script,
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn coinbase_detection_requires_single_null_input() {
        let tx = coinbase(vec![0x51]);
        assert!(tx.is_coinbase());

        let mut spend = tx.clone();
        spend.vin[0].prevout = OutPoint::new([1u8; 32], 0);
        assert!(!spend.is_coinbase());
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        let tx = coinbase(vec![0x02, 0xe8, 0x03]);
        let bytes = tx.consensus_encode();
        assert_eq!(bytes.len() as u64, tx.serialized_size());
        let decoded = Transaction::consensus_decode(&bytes).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn finality_follows_locktime_and_sequences() {
        let mut tx = coinbase(vec![0x51]);
        tx.lock_time = 100;
        // Final sequences make any lock-time moot.
        assert!(tx.is_final(50, 0));
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        tx.lock_time = 1_500_000_000;
        assert!(!tx.is_final(101, 1_500_000_000));
        assert!(tx.is_final(101, 1_500_000_001));
    }
}
