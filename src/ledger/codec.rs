//! Decoding of the active-position list payload.
//!
//! The ledger returns positions as a flat byte string of fixed-width
//! records, three 32-byte words each:
//! - word 0: position hash
//! - word 1: counterparty, left-padded (account is the last 20 bytes)
//! - word 2: expiry timestamp, big-endian unsigned

use super::error::LedgerError;
use super::types::{Address, Position, PositionId};

pub const WORD_SIZE: usize = 32;
pub const FIELDS_PER_RECORD: usize = 3;
pub const RECORD_SIZE: usize = WORD_SIZE * FIELDS_PER_RECORD;

const ADDRESS_OFFSET: usize = WORD_SIZE - 20;

/// Decode a hex payload as transported by the gateway. A missing or empty
/// payload is an empty page.
pub fn decode_hex_payload(raw: Option<&str>) -> Result<Vec<u8>, LedgerError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| LedgerError::Schema(format!("invalid hex payload: {}", e)))
}

/// Decode a position page. Rejects payloads that are not a whole number of
/// records.
pub fn decode_positions(data: &[u8]) -> Result<Vec<Position>, LedgerError> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(LedgerError::Schema(format!(
            "payload length {} is not a multiple of record size {}",
            data.len(),
            RECORD_SIZE
        )));
    }

    data.chunks_exact(RECORD_SIZE).map(decode_record).collect()
}

fn decode_record(record: &[u8]) -> Result<Position, LedgerError> {
    let mut id = [0u8; 32];
    id.copy_from_slice(&record[..WORD_SIZE]);

    let mut counterparty = [0u8; 20];
    counterparty.copy_from_slice(&record[WORD_SIZE + ADDRESS_OFFSET..2 * WORD_SIZE]);

    let expiry_word = &record[2 * WORD_SIZE..RECORD_SIZE];
    let (high, low) = expiry_word.split_at(WORD_SIZE - 8);
    if high.iter().any(|b| *b != 0) {
        return Err(LedgerError::Schema(format!(
            "expiry of position 0x{} overflows 64 bits",
            hex::encode(id)
        )));
    }
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(low);

    Ok(Position {
        position_id: PositionId(id),
        counterparty: Address(counterparty),
        expiry_timestamp: u64::from_be_bytes(expiry),
    })
}

/// Encode positions in the record layout. Used by the paper ledger.
pub fn encode_positions(positions: &[Position]) -> Vec<u8> {
    let mut out = Vec::with_capacity(positions.len() * RECORD_SIZE);
    for position in positions {
        out.extend_from_slice(&position.position_id.0);
        out.extend_from_slice(&[0u8; ADDRESS_OFFSET]);
        out.extend_from_slice(&position.counterparty.0);
        out.extend_from_slice(&[0u8; WORD_SIZE - 8]);
        out.extend_from_slice(&position.expiry_timestamp.to_be_bytes());
    }
    out
}
