use crate::error::{ChainError, IntegrityViolation};

use super::chain::Block;

/// Check a candidate against its parent. Every invariant is tested on its
/// own and the first failure rejects the candidate.
pub fn check_block(candidate: &Block, parent: &Block) -> Result<(), IntegrityViolation> {
    if candidate.index != parent.index + 1 {
        return Err(IntegrityViolation::IndexGap {
            index: candidate.index,
            expected: parent.index + 1,
        });
    }
    if candidate.prev_hash != parent.hash {
        return Err(IntegrityViolation::LinkBroken { index: candidate.index });
    }
    if candidate.timestamp <= parent.timestamp {
        return Err(IntegrityViolation::TimestampRegression { index: candidate.index });
    }
    if candidate.calculate_hash() != candidate.hash {
        return Err(IntegrityViolation::HashMismatch { index: candidate.index });
    }
    Ok(())
}

pub fn is_block_valid(candidate: &Block, parent: &Block) -> bool {
    check_block(candidate, parent).is_ok()
}

/// Walk the chain from genesis to tip and report the first broken invariant.
pub fn is_chain_valid(blocks: &[Block]) -> Result<(), ChainError> {
    let genesis = blocks.first().ok_or(IntegrityViolation::EmptyChain)?;
    if !genesis.is_genesis() {
        return Err(IntegrityViolation::InvalidGenesis.into());
    }
    if genesis.calculate_hash() != genesis.hash {
        return Err(IntegrityViolation::HashMismatch { index: 0 }.into());
    }

    for pair in blocks.windows(2) {
        check_block(&pair[1], &pair[0])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::chain::{AdmissionPolicy, Seal};

    fn stake(v: &str) -> Seal {
        Seal::Stake { validator_id: v.to_string() }
    }

    fn sample_chain(len: usize) -> Vec<Block> {
        let mut blocks = vec![AdmissionPolicy::ProofOfStake.genesis()];
        for i in 1..len {
            let parent = blocks.last().unwrap().clone();
            blocks.push(Block::child_of(&parent, i as i64 * 10, stake("alice")).unwrap());
        }
        blocks
    }

    #[test]
    fn test_valid_child_is_accepted() {
        let chain = sample_chain(3);
        assert!(is_block_valid(&chain[2], &chain[1]));
        assert!(is_chain_valid(&chain).is_ok());
    }

    #[test]
    fn test_genesis_only_chain_is_valid() {
        assert!(is_chain_valid(&sample_chain(1)).is_ok());
    }

    #[test]
    fn test_single_failed_invariant_rejects() {
        let chain = sample_chain(2);
        let (parent, child) = (&chain[0], &chain[1]);

        let mut wrong_index = child.clone();
        wrong_index.index = 5;
        assert_eq!(
            check_block(&wrong_index, parent),
            Err(IntegrityViolation::IndexGap { index: 5, expected: 1 })
        );

        let mut wrong_link = child.clone();
        wrong_link.prev_hash = "00".repeat(32);
        assert_eq!(check_block(&wrong_link, parent), Err(IntegrityViolation::LinkBroken { index: 1 }));

        let mut old = child.clone();
        old.timestamp = parent.timestamp;
        assert_eq!(
            check_block(&old, parent),
            Err(IntegrityViolation::TimestampRegression { index: 1 })
        );

        let mut tampered = child.clone();
        tampered.payload += 1;
        assert_eq!(check_block(&tampered, parent), Err(IntegrityViolation::HashMismatch { index: 1 }));
    }

    #[test]
    fn test_chain_reports_first_violation_kind() {
        let mut chain = sample_chain(4);
        chain[2].payload = -1;
        assert_eq!(
            is_chain_valid(&chain),
            Err(ChainError::ChainIntegrity(IntegrityViolation::HashMismatch { index: 2 }))
        );

        let mut chain = sample_chain(4);
        chain[3].prev_hash = chain[1].hash.clone();
        assert_eq!(
            is_chain_valid(&chain),
            Err(ChainError::ChainIntegrity(IntegrityViolation::LinkBroken { index: 3 }))
        );
    }

    #[test]
    fn test_rejects_bad_genesis() {
        let mut chain = sample_chain(2);
        chain[0].prev_hash = "ff".to_string();
        assert_eq!(
            is_chain_valid(&chain),
            Err(ChainError::ChainIntegrity(IntegrityViolation::InvalidGenesis))
        );
        assert_eq!(
            is_chain_valid(&[]),
            Err(ChainError::ChainIntegrity(IntegrityViolation::EmptyChain))
        );
    }
}
