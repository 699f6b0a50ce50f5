use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use super::chain::Seal;

/// Fixed textual form of a timestamp used as hash input.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SHA-256 over the block fields concatenated in order: index, timestamp,
/// payload, previous hash, then the seal fields. Returns lowercase hex.
pub fn calculate_hash(
    index: u64,
    timestamp: &DateTime<Utc>,
    payload: i64,
    prev_hash: &str,
    seal: &Seal,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(canonical_timestamp(timestamp).as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    match seal {
        Seal::Work { difficulty, nonce } => {
            hasher.update(difficulty.to_string().as_bytes());
            hasher.update(nonce.as_bytes());
        }
        Seal::Stake { validator_id } => {
            hasher.update(validator_id.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// True when the hex digest starts with `difficulty` zero characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
