//! Proof-of-stake leader election.
//!
//! Participants drop candidate blocks into a [`CandidatePool`] during a round.
//! At round end a stake-weighted lottery over the distinct proposers picks
//! one identity, and that identity's first candidate becomes the next block.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::blockchain::{Block, Seal};
use crate::error::ChainError;

/// Balance deducted from a proposer whose submission finds the chain invalid.
pub const DEFAULT_STAKE_PENALTY: u64 = 5;

/// Wall-clock length of one election round.
pub const DEFAULT_ROUND_INTERVAL: Duration = Duration::from_secs(10);

/// Build a stake-sealed child of `parent` proposed by `validator_id`.
pub fn build_candidate(parent: &Block, payload: i64, validator_id: &str) -> Result<Block, ChainError> {
    Block::child_of(
        parent,
        payload,
        Seal::Stake {
            validator_id: validator_id.to_string(),
        },
    )
}

/// Blocks proposed during the current round. Cleared every round.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    blocks: Vec<Block>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Empty the pool, handing back what it held.
    pub fn take(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.blocks)
    }
}

/// Weighted selection pool. Each distinct proposer appears with weight equal
/// to its balance; drawing is uniform over the sum of weights, which is the
/// same distribution as a pool holding each identity `balance` times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lottery {
    entries: Vec<(String, u64)>,
    total: u64,
}

impl Lottery {
    /// Build from the proposers present in `candidates`, in first-seen order.
    /// Unregistered and zero-balance proposers contribute nothing.
    pub fn from_candidates(candidates: &[Block], stakes: &HashMap<String, u64>) -> Self {
        let mut lottery = Lottery::default();
        for block in candidates {
            let Some(id) = block.validator_id() else { continue };
            if lottery.entries.iter().any(|(seen, _)| seen == id) {
                continue;
            }
            let balance = stakes.get(id).copied().unwrap_or(0);
            if balance == 0 {
                continue;
            }
            lottery.total = lottery.total.saturating_add(balance);
            lottery.entries.push((id.to_string(), balance));
        }
        lottery
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Total number of tickets in the pool.
    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn weight_of(&self, id: &str) -> u64 {
        self.entries
            .iter()
            .find(|(seen, _)| seen == id)
            .map_or(0, |(_, w)| *w)
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        if self.total == 0 {
            return None;
        }
        let mut ticket = rng.gen_range(0..self.total);
        for (id, weight) in &self.entries {
            if ticket < *weight {
                return Some(id);
            }
            ticket -= weight;
        }
        None
    }
}

/// Run one lottery over `candidates` and return the winner's first block.
pub fn select_winner<R: Rng + ?Sized>(
    candidates: &[Block],
    stakes: &HashMap<String, u64>,
    rng: &mut R,
) -> Result<Block, ChainError> {
    let lottery = Lottery::from_candidates(candidates, stakes);
    let winner = lottery.draw(rng).ok_or(ChainError::NoEligibleValidator)?;
    candidates
        .iter()
        .find(|b| b.validator_id() == Some(winner))
        .cloned()
        .ok_or(ChainError::NoEligibleValidator)
}

/// Broadcast to participants when a round produces a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub round: u64,
    pub winner: String,
    pub block_index: u64,
    pub block_hash: String,
    pub announced_at: DateTime<Utc>,
}

/// What happened when a round closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The pool was empty.
    Idle { round: u64 },
    /// Candidates were present but none had stake.
    NoEligibleValidator { round: u64, discarded: usize },
    /// The winning block no longer extends the tip.
    Stale { round: u64, winner: String, discarded: usize },
    Appended { announcement: Announcement, discarded: usize },
}

impl RoundOutcome {
    pub fn round(&self) -> u64 {
        match self {
            RoundOutcome::Idle { round }
            | RoundOutcome::NoEligibleValidator { round, .. }
            | RoundOutcome::Stale { round, .. } => *round,
            RoundOutcome::Appended { announcement, .. } => announcement.round,
        }
    }

    pub fn announcement(&self) -> Option<&Announcement> {
        match self {
            RoundOutcome::Appended { announcement, .. } => Some(announcement),
            _ => None,
        }
    }
}
