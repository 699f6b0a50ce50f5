//! Fork choice: decides whether an observed chain replaces the local one.

use crate::blockchain::{is_chain_valid, AdmissionPolicy, Block, Chain};
use crate::error::{ChainError, IntegrityViolation};

/// Result of comparing a valid remote chain against the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkDecision {
    Adopted { previous_len: usize, new_len: usize },
    Kept { local_len: usize, remote_len: usize },
}

impl ForkDecision {
    pub fn is_adopted(&self) -> bool {
        matches!(self, ForkDecision::Adopted { .. })
    }
}

/// Longest-valid-chain rule. Equal length never replaces.
#[derive(Debug, Clone, Copy)]
pub struct ForkChoice {
    policy: AdmissionPolicy,
}

impl ForkChoice {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self { policy }
    }

    /// Validate a candidate chain: structural integrity, shared genesis
    /// and a policy-conforming seal on every non-genesis block.
    pub fn validate_candidate(&self, local: &Chain, candidate: &[Block]) -> Result<(), ChainError> {
        is_chain_valid(candidate)?;
        if candidate[0].hash != local.genesis().hash {
            return Err(IntegrityViolation::InvalidGenesis.into());
        }
        for block in &candidate[1..] {
            self.policy.verify_seal(block)?;
        }
        // a tip nothing can follow would wedge the node after adoption
        if let Some(tip) = candidate.last() {
            if !tip.has_successor_time() {
                return Err(IntegrityViolation::TimestampExhausted { index: tip.index }.into());
            }
        }
        Ok(())
    }

    /// Decide without mutating anything.
    pub fn evaluate(&self, local: &Chain, candidate: &[Block]) -> Result<ForkDecision, ChainError> {
        self.validate_candidate(local, candidate)?;
        if candidate.len() > local.len() {
            Ok(ForkDecision::Adopted {
                previous_len: local.len(),
                new_len: candidate.len(),
            })
        } else {
            Ok(ForkDecision::Kept {
                local_len: local.len(),
                remote_len: candidate.len(),
            })
        }
    }

    /// Decide and, on adoption, swap the local chain in one step.
    pub fn apply(&self, local: &mut Chain, candidate: Vec<Block>) -> Result<ForkDecision, ChainError> {
        let decision = self.evaluate(local, &candidate)?;
        if decision.is_adopted() {
            local.replace(Chain::from_blocks(candidate)?);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Seal;
    use chrono::{DateTime, Utc};

    fn extend(chain: &mut Chain, n: usize, who: &str) {
        for i in 0..n {
            let block = Block::child_of(chain.tip(), i as i64, Seal::Stake { validator_id: who.into() }).unwrap();
            chain.append(block).unwrap();
        }
    }

    #[test]
    fn test_longer_valid_chain_is_adopted() {
        let policy = AdmissionPolicy::ProofOfStake;
        let fork = ForkChoice::new(policy);
        let mut local = Chain::new(&policy);
        extend(&mut local, 4, "alice");
        let mut remote = Chain::new(&policy);
        extend(&mut remote, 5, "bob");

        let decision = fork.apply(&mut local, remote.to_vec()).unwrap();
        assert_eq!(decision, ForkDecision::Adopted { previous_len: 5, new_len: 6 });
        assert_eq!(local, remote);
    }

    #[test]
    fn test_equal_or_shorter_chain_is_kept() {
        let policy = AdmissionPolicy::ProofOfStake;
        let fork = ForkChoice::new(policy);
        let mut local = Chain::new(&policy);
        extend(&mut local, 3, "alice");
        let before = local.clone();

        let mut equal = Chain::new(&policy);
        extend(&mut equal, 3, "bob");
        assert!(!fork.apply(&mut local, equal.to_vec()).unwrap().is_adopted());

        let mut shorter = Chain::new(&policy);
        extend(&mut shorter, 1, "bob");
        assert_eq!(
            fork.apply(&mut local, shorter.to_vec()).unwrap(),
            ForkDecision::Kept { local_len: 4, remote_len: 2 }
        );
        assert_eq!(local, before);
    }

    #[test]
    fn test_invalid_longer_chain_is_rejected() {
        let policy = AdmissionPolicy::ProofOfStake;
        let fork = ForkChoice::new(policy);
        let mut local = Chain::new(&policy);
        let mut remote = Chain::new(&policy);
        extend(&mut remote, 3, "bob");
        let mut blocks = remote.to_vec();
        blocks[2].payload = 999;

        let err = fork.apply(&mut local, blocks).unwrap_err();
        assert!(err.is_integrity_violation());
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn test_foreign_genesis_is_rejected() {
        let fork = ForkChoice::new(AdmissionPolicy::ProofOfStake);
        let local = Chain::new(&AdmissionPolicy::ProofOfStake);
        let other = Chain::new(&AdmissionPolicy::ProofOfWork { difficulty: 1 });
        assert_eq!(
            fork.evaluate(&local, other.blocks()),
            Err(ChainError::ChainIntegrity(IntegrityViolation::InvalidGenesis))
        );
    }

    #[test]
    fn test_unmined_work_block_is_rejected() {
        let policy = AdmissionPolicy::ProofOfWork { difficulty: 64 };
        let fork = ForkChoice::new(policy);
        let local = Chain::new(&policy);
        let mut remote = local.clone();
        let lazy = Block::child_of(remote.tip(), 1, Seal::Work { difficulty: 64, nonce: "0".into() }).unwrap();
        remote.append(lazy).unwrap();
        assert!(matches!(fork.evaluate(&local, remote.blocks()), Err(ChainError::InvalidSeal(_))));
    }

    #[test]
    fn test_tip_at_end_of_time_is_rejected() {
        let policy = AdmissionPolicy::ProofOfStake;
        let fork = ForkChoice::new(policy);
        let mut local = Chain::new(&policy);
        let genesis = local.genesis().clone();
        let last = Block::new(1, DateTime::<Utc>::MAX_UTC, 7, genesis.hash.clone(), Seal::Stake { validator_id: "x".into() });

        let err = fork.apply(&mut local, vec![genesis, last]).unwrap_err();
        assert_eq!(err, ChainError::ChainIntegrity(IntegrityViolation::TimestampExhausted { index: 1 }));
        assert_eq!(local.len(), 1);
    }
}
