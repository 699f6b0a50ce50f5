//! Proof-of-work nonce search.

use tracing::{debug, trace};

use crate::blockchain::{meets_difficulty, Block, Seal};
use crate::error::ChainError;

/// How many nonces are tried between checks of the abort predicate.
const ABORT_CHECK_INTERVAL: u64 = 1024;

/// Build the starting candidate for a search: child of `parent` with nonce unset.
pub fn build_candidate(parent: &Block, payload: i64, difficulty: u32) -> Result<Block, ChainError> {
    Block::child_of(
        parent,
        payload,
        Seal::Work {
            difficulty,
            nonce: String::new(),
        },
    )
}

/// Search nonces 0, 1, 2, ... (as lowercase hex) until the block hash has
/// `difficulty` leading zeros. `should_abort` is polled periodically; when
/// it returns true the search stops with `ChainError::Cancelled`.
pub fn mine_block<F>(mut block: Block, should_abort: F) -> Result<Block, ChainError>
where
    F: Fn() -> bool,
{
    let difficulty = match &block.seal {
        Seal::Work { difficulty, .. } => *difficulty,
        Seal::Stake { .. } => {
            return Err(ChainError::PolicyMismatch(
                "cannot mine a stake-sealed block".to_string(),
            ))
        }
    };

    let mut nonce: u64 = 0;
    loop {
        if nonce % ABORT_CHECK_INTERVAL == 0 && should_abort() {
            debug!(index = block.index, attempts = nonce, "nonce search aborted");
            return Err(ChainError::Cancelled);
        }

        block.seal = Seal::Work {
            difficulty,
            nonce: format!("{:x}", nonce),
        };
        let hash = block.calculate_hash();
        if meets_difficulty(&hash, difficulty) {
            debug!(index = block.index, nonce = %format!("{:x}", nonce), hash = %hash, "work done");
            block.hash = hash;
            return Ok(block);
        }
        trace!(index = block.index, hash = %hash, "do more work");
        nonce = nonce.wrapping_add(1);
    }
}
