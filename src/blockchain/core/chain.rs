use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, IntegrityViolation};

use super::hashing::{calculate_hash, meets_difficulty};
use super::validation::{check_block, is_chain_valid};

/// Default number of leading zero hex characters required of a mined hash.
pub const DEFAULT_DIFFICULTY: u32 = 3;

/// Largest difficulty a 256-bit hex digest can satisfy.
pub const MAX_DIFFICULTY: u32 = 64;

/// Admission-policy fields carried by a block. Serialized flat into the
/// block record, so the two wire formats differ only in these keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seal {
    Work { difficulty: u32, nonce: String },
    Stake {
        #[serde(rename = "validatorId")]
        validator_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: i64,
    pub prev_hash: String,
    pub hash: String,
    #[serde(flatten)]
    pub seal: Seal,
}

/// Timestamp shared by every genesis block.
pub fn genesis_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

impl Block {
    /// Build a block and compute its hash from the given fields.
    pub fn new(index: u64, timestamp: DateTime<Utc>, payload: i64, prev_hash: String, seal: Seal) -> Self {
        let hash = calculate_hash(index, &timestamp, payload, &prev_hash, &seal);
        Block {
            index,
            timestamp,
            payload,
            prev_hash,
            hash,
            seal,
        }
    }

    /// The fixed genesis block: index 0, epoch timestamp, zero payload, no parent.
    pub fn genesis(seal: Seal) -> Self {
        Block::new(0, genesis_timestamp(), 0, String::new(), seal)
    }

    /// Build an unsealed child of `parent`. The hash is computed for the
    /// given seal; miners overwrite nonce and hash as they search.
    pub fn child_of(parent: &Block, payload: i64, seal: Seal) -> Result<Self, ChainError> {
        Ok(Block::new(
            parent.index + 1,
            Block::next_timestamp(parent)?,
            payload,
            parent.hash.clone(),
            seal,
        ))
    }

    /// Current wall-clock time, bumped past the parent when the clock has not moved.
    pub fn next_timestamp(parent: &Block) -> Result<DateTime<Utc>, ChainError> {
        let floor = parent
            .timestamp
            .checked_add_signed(chrono::Duration::nanoseconds(1))
            .ok_or(IntegrityViolation::TimestampExhausted { index: parent.index })?;
        Ok(Utc::now().max(floor))
    }

    /// Whether any block can still follow this one.
    pub fn has_successor_time(&self) -> bool {
        self.timestamp
            .checked_add_signed(chrono::Duration::nanoseconds(1))
            .is_some()
    }

    pub fn calculate_hash(&self) -> String {
        calculate_hash(self.index, &self.timestamp, self.payload, &self.prev_hash, &self.seal)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.prev_hash.is_empty()
    }

    pub fn validator_id(&self) -> Option<&str> {
        match &self.seal {
            Seal::Stake { validator_id } => Some(validator_id),
            Seal::Work { .. } => None,
        }
    }
}

/// How blocks earn their place on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    ProofOfWork { difficulty: u32 },
    ProofOfStake,
}

impl AdmissionPolicy {
    pub fn genesis_seal(&self) -> Seal {
        match self {
            AdmissionPolicy::ProofOfWork { difficulty } => Seal::Work {
                difficulty: *difficulty,
                nonce: String::new(),
            },
            AdmissionPolicy::ProofOfStake => Seal::Stake {
                validator_id: String::new(),
            },
        }
    }

    pub fn genesis(&self) -> Block {
        Block::genesis(self.genesis_seal())
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdmissionPolicy::ProofOfWork { .. } => "pow",
            AdmissionPolicy::ProofOfStake => "pos",
        }
    }

    /// Check that a non-genesis block carries a seal this policy accepts.
    pub fn verify_seal(&self, block: &Block) -> Result<(), ChainError> {
        match (self, &block.seal) {
            (AdmissionPolicy::ProofOfWork { difficulty }, Seal::Work { difficulty: d, .. }) => {
                if d != difficulty {
                    return Err(ChainError::InvalidSeal(format!(
                        "block {} declares difficulty {}, chain requires {}",
                        block.index, d, difficulty
                    )));
                }
                if !meets_difficulty(&block.hash, *difficulty) {
                    return Err(ChainError::InvalidSeal(format!(
                        "block {} hash {} lacks {} leading zeros",
                        block.index, block.hash, difficulty
                    )));
                }
                Ok(())
            }
            (AdmissionPolicy::ProofOfStake, Seal::Stake { validator_id }) => {
                if validator_id.is_empty() {
                    return Err(ChainError::InvalidSeal(format!(
                        "block {} has no validator",
                        block.index
                    )));
                }
                Ok(())
            }
            _ => Err(ChainError::PolicyMismatch(format!(
                "block {} seal does not belong to a {} chain",
                block.index,
                self.name()
            ))),
        }
    }
}

/// Ordered, hash-linked blocks starting at genesis. Grows only by
/// validated appends; otherwise changes only by wholesale replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new(policy: &AdmissionPolicy) -> Self {
        Chain {
            blocks: vec![policy.genesis()],
        }
    }

    /// Adopt a block sequence after it passes the whole-chain check.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, ChainError> {
        is_chain_valid(&blocks)?;
        Ok(Chain { blocks })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn tip(&self) -> &Block {
        // never empty: constructors guarantee a genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// Append a block that extends the current tip.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        check_block(&block, self.tip())?;
        self.blocks.push(block);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn blocks_mut(&mut self) -> &mut Vec<Block> {
        &mut self.blocks
    }

    pub(crate) fn replace(&mut self, other: Chain) {
        self.blocks = other.blocks;
    }

    pub fn to_vec(&self) -> Vec<Block> {
        self.blocks.clone()
    }
}

impl TryFrom<Vec<Block>> for Chain {
    type Error = ChainError;

    fn try_from(blocks: Vec<Block>) -> Result<Self, Self::Error> {
        if blocks.is_empty() {
            return Err(IntegrityViolation::EmptyChain.into());
        }
        Chain::from_blocks(blocks)
    }
}
