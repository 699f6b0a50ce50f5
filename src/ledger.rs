//! The node's ledger: chain, stake registry and candidate pool behind one lock.
//!
//! Every read or write of shared state goes through [`Ledger`]. The lock is
//! never held while searching for a nonce or while waiting on I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::blockchain::{check_block, is_chain_valid, AdmissionPolicy, Block, Chain, StakeRegistry};
use crate::consensus::{ForkChoice, ForkDecision};
use crate::error::{ChainError, Result};
use crate::miner;
use crate::staking::{self, Announcement, CandidatePool, RoundOutcome, DEFAULT_STAKE_PENALTY};

const ANNOUNCEMENT_CAPACITY: usize = 64;

/// Parse a payload received as text.
pub fn parse_payload(text: &str) -> Result<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|e| ChainError::MalformedInput(format!("{:?} is not a number: {}", text.trim(), e)))
}

/// Everything guarded by the ledger lock.
#[derive(Debug)]
pub struct LedgerState {
    pub chain: Chain,
    pub registry: StakeRegistry,
    pub pool: CandidatePool,
    pub round: u64,
    pub last_announcement: Option<Announcement>,
}

#[derive(Clone)]
pub struct Ledger {
    policy: AdmissionPolicy,
    fork_choice: ForkChoice,
    stake_penalty: u64,
    state: Arc<Mutex<LedgerState>>,
    /// Bumped on every append and replacement; lets a nonce search notice a moved tip.
    generation: Arc<AtomicU64>,
    announcements: broadcast::Sender<Announcement>,
}

impl Ledger {
    pub fn new(policy: AdmissionPolicy) -> Self {
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_CAPACITY);
        Self {
            policy,
            fork_choice: ForkChoice::new(policy),
            stake_penalty: DEFAULT_STAKE_PENALTY,
            state: Arc::new(Mutex::new(LedgerState {
                chain: Chain::new(&policy),
                registry: StakeRegistry::new(),
                pool: CandidatePool::new(),
                round: 0,
                last_announcement: None,
            })),
            generation: Arc::new(AtomicU64::new(0)),
            announcements,
        }
    }

    pub fn with_stake_penalty(mut self, penalty: u64) -> Self {
        self.stake_penalty = penalty;
        self
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn stake_penalty(&self) -> u64 {
        self.stake_penalty
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Snapshot of the chain, genesis first.
    pub fn current_chain(&self) -> Vec<Block> {
        self.state.lock().chain.to_vec()
    }

    pub fn len(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chain.is_empty()
    }

    pub fn tip(&self) -> Block {
        self.state.lock().chain.tip().clone()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.state.lock().chain.get(index).cloned()
    }

    /// Serialized chain as sent to peers.
    pub fn snapshot(&self) -> Result<String> {
        let blocks = self.current_chain();
        serde_json::to_string(&blocks).map_err(|e| ChainError::DeserializationFailure(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Add data through the active policy. Work chains mine immediately;
    /// stake chains queue a candidate for the current round and need a proposer.
    pub fn submit_data(&self, payload: i64, proposer: Option<&str>) -> Result<Block> {
        self.submit_data_with_abort(payload, proposer, || false)
    }

    pub fn submit_data_with_abort<F>(&self, payload: i64, proposer: Option<&str>, should_abort: F) -> Result<Block>
    where
        F: Fn() -> bool,
    {
        match self.policy {
            AdmissionPolicy::ProofOfWork { .. } => self.mine(payload, should_abort),
            AdmissionPolicy::ProofOfStake => {
                let proposer = proposer.ok_or_else(|| {
                    ChainError::MalformedInput("a validator id is required on a stake chain".to_string())
                })?;
                self.propose(proposer, payload)
            }
        }
    }

    /// Mine a block carrying `payload` on top of the current tip and append it.
    ///
    /// The search runs without the lock. If the tip moves meanwhile the
    /// search restarts from the new tip; `should_abort` ends it for good.
    pub fn mine<F>(&self, payload: i64, should_abort: F) -> Result<Block>
    where
        F: Fn() -> bool,
    {
        let difficulty = match self.policy {
            AdmissionPolicy::ProofOfWork { difficulty } => difficulty,
            AdmissionPolicy::ProofOfStake => {
                return Err(ChainError::PolicyMismatch("mining requires a work chain".to_string()))
            }
        };

        loop {
            let (parent, generation) = {
                let state = self.state.lock();
                (state.chain.tip().clone(), self.generation())
            };

            let candidate = miner::build_candidate(&parent, payload, difficulty)?;
            let mined = match miner::mine_block(candidate, || {
                should_abort() || self.generation() != generation
            }) {
                Ok(block) => block,
                Err(ChainError::Cancelled) if !should_abort() => {
                    debug!(parent = parent.index, "tip moved during nonce search, restarting");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut state = self.state.lock();
            if state.chain.tip().hash != mined.prev_hash {
                debug!(index = mined.index, "mined block lost the race, restarting");
                continue;
            }
            is_chain_valid(state.chain.blocks())?;
            self.policy.verify_seal(&mined)?;
            state.chain.append(mined.clone())?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!(index = mined.index, hash = %mined.hash, payload, "appended mined block");
            return Ok(mined);
        }
    }

    /// Queue a stake-sealed candidate for the current round.
    ///
    /// The whole chain is re-validated first; if that fails the proposer's
    /// stake is penalized and the candidate is refused.
    pub fn propose(&self, validator_id: &str, payload: i64) -> Result<Block> {
        if self.policy != AdmissionPolicy::ProofOfStake {
            return Err(ChainError::PolicyMismatch("proposals require a stake chain".to_string()));
        }
        if validator_id.is_empty() {
            return Err(ChainError::MalformedInput("validator id is empty".to_string()));
        }

        let mut state = self.state.lock();
        if let Err(err) = is_chain_valid(state.chain.blocks()) {
            let remaining = state.registry.penalize(validator_id, self.stake_penalty);
            warn!(
                validator = validator_id,
                penalty = self.stake_penalty,
                remaining,
                error = %err,
                "chain invalid at proposal time, proposer penalized"
            );
            return Err(err);
        }

        let candidate = staking::build_candidate(state.chain.tip(), payload, validator_id)?;
        check_block(&candidate, state.chain.tip())?;
        state.pool.push(candidate.clone());
        debug!(validator = validator_id, index = candidate.index, pending = state.pool.len(), "candidate queued");
        Ok(candidate)
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Close the current round using the thread-local RNG.
    pub fn resolve_round(&self) -> RoundOutcome {
        self.resolve_round_with(&mut rand::thread_rng())
    }

    /// Close the current round: draw a winner by stake, append its block,
    /// announce it, and clear the pool whatever the result.
    pub fn resolve_round_with<R: Rng + ?Sized>(&self, rng: &mut R) -> RoundOutcome {
        let mut state = self.state.lock();
        state.round += 1;
        let round = state.round;
        let candidates = state.pool.take();

        if candidates.is_empty() {
            return RoundOutcome::Idle { round };
        }

        let stakes = state.registry.snapshot();
        let winner = match staking::select_winner(&candidates, &stakes, rng) {
            Ok(block) => block,
            Err(_) => {
                debug!(round, candidates = candidates.len(), "no candidate has stake, round skipped");
                return RoundOutcome::NoEligibleValidator {
                    round,
                    discarded: candidates.len(),
                };
            }
        };
        let validator = winner.validator_id().unwrap_or_default().to_string();

        if let Err(err) = state.chain.append(winner.clone()) {
            debug!(round, validator = %validator, error = %err, "winning candidate is stale");
            return RoundOutcome::Stale {
                round,
                winner: validator,
                discarded: candidates.len(),
            };
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let announcement = Announcement {
            round,
            winner: validator,
            block_index: winner.index,
            block_hash: winner.hash.clone(),
            announced_at: Utc::now(),
        };
        state.last_announcement = Some(announcement.clone());
        drop(state);

        info!(round, winner = %announcement.winner, index = announcement.block_index, "round winner appended");
        // no subscribers is not an error
        let _ = self.announcements.send(announcement.clone());

        RoundOutcome::Appended {
            announcement,
            discarded: candidates.len() - 1,
        }
    }

    pub fn subscribe_announcements(&self) -> broadcast::Receiver<Announcement> {
        self.announcements.subscribe()
    }

    pub fn last_announcement(&self) -> Option<Announcement> {
        self.state.lock().last_announcement.clone()
    }

    pub fn round(&self) -> u64 {
        self.state.lock().round
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Decode a peer's serialized chain and apply fork choice to it.
    pub fn receive_remote_chain(&self, serialized: &str) -> Result<ForkDecision> {
        let blocks: Vec<Block> = serde_json::from_str(serialized)?;
        self.receive_remote_blocks(blocks)
    }

    pub fn receive_remote_blocks(&self, blocks: Vec<Block>) -> Result<ForkDecision> {
        let mut state = self.state.lock();
        let decision = self.fork_choice.apply(&mut state.chain, blocks)?;
        if let ForkDecision::Adopted { previous_len, new_len } = decision {
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!(previous_len, new_len, "adopted longer remote chain");
        }
        Ok(decision)
    }

    // ------------------------------------------------------------------
    // Stake registry
    // ------------------------------------------------------------------

    pub fn register_validator(&self, id: &str, balance: u64) -> Result<()> {
        self.require_stake_policy()?;
        if id.is_empty() {
            return Err(ChainError::MalformedInput("validator id is empty".to_string()));
        }
        self.state.lock().registry.register(id, balance);
        info!(validator = id, balance, "validator registered");
        Ok(())
    }

    pub fn adjust_balance(&self, id: &str, delta: i64) -> Result<u64> {
        self.require_stake_policy()?;
        let balance = self.state.lock().registry.adjust(id, delta)?;
        debug!(validator = id, delta, balance, "balance adjusted");
        Ok(balance)
    }

    /// Drop a validator and return its last balance. Candidates it already
    /// queued stay in the pool but carry no stake at round end.
    pub fn remove_validator(&self, id: &str) -> Result<u64> {
        self.require_stake_policy()?;
        let balance = self
            .state
            .lock()
            .registry
            .remove(id)
            .ok_or_else(|| ChainError::UnknownValidator(id.to_string()))?;
        info!(validator = id, balance, "validator removed");
        Ok(balance)
    }

    pub fn balance(&self, id: &str) -> Option<u64> {
        self.state.lock().registry.get_balance(id)
    }

    pub fn validators(&self) -> HashMap<String, u64> {
        self.state.lock().registry.snapshot()
    }

    fn require_stake_policy(&self) -> Result<()> {
        match self.policy {
            AdmissionPolicy::ProofOfStake => Ok(()),
            AdmissionPolicy::ProofOfWork { .. } => Err(ChainError::PolicyMismatch(
                "validators exist only on a stake chain".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Seal;
    use crate::error::IntegrityViolation;
    use chrono::{DateTime, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pos() -> Ledger {
        Ledger::new(AdmissionPolicy::ProofOfStake)
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(" 72\n").unwrap(), 72);
        assert!(matches!(parse_payload("seventy"), Err(ChainError::MalformedInput(_))));
    }

    #[test]
    fn test_mine_appends_block() {
        let ledger = Ledger::new(AdmissionPolicy::ProofOfWork { difficulty: 1 });
        let block = ledger.submit_data(50, None).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.tip(), block);
        assert_eq!(ledger.generation(), 1);
    }

    #[test]
    fn test_mine_can_be_aborted() {
        let ledger = Ledger::new(AdmissionPolicy::ProofOfWork { difficulty: 64 });
        let result = ledger.submit_data_with_abort(1, None, || true);
        assert_eq!(result.unwrap_err(), ChainError::Cancelled);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_stake_chain_requires_proposer() {
        let ledger = pos();
        assert!(matches!(ledger.submit_data(1, None), Err(ChainError::MalformedInput(_))));
    }

    #[test]
    fn test_round_appends_winner_and_clears_pool() {
        let ledger = pos();
        ledger.register_validator("a", 10).unwrap();
        ledger.register_validator("b", 0).unwrap();
        let mut receiver = ledger.subscribe_announcements();

        ledger.propose("a", 1).unwrap();
        ledger.propose("b", 2).unwrap();
        assert_eq!(ledger.pending_candidates(), 2);

        let outcome = ledger.resolve_round_with(&mut StdRng::seed_from_u64(11));
        let announcement = outcome.announcement().cloned().unwrap();
        assert_eq!(announcement.winner, "a");
        assert_eq!(announcement.round, 1);
        assert_eq!(ledger.pending_candidates(), 0);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.tip().validator_id(), Some("a"));
        assert_eq!(receiver.try_recv().unwrap(), announcement);
        assert_eq!(ledger.last_announcement(), Some(announcement));
    }

    #[test]
    fn test_round_without_stake_clears_pool() {
        let ledger = pos();
        ledger.propose("ghost", 1).unwrap();
        let outcome = ledger.resolve_round();
        assert_eq!(outcome, RoundOutcome::NoEligibleValidator { round: 1, discarded: 1 });
        assert_eq!(ledger.pending_candidates(), 0);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.resolve_round(), RoundOutcome::Idle { round: 2 });
    }

    #[test]
    fn test_stale_winner_is_discarded() {
        let ledger = pos();
        ledger.register_validator("a", 1).unwrap();
        ledger.propose("a", 1).unwrap();

        // a peer's longer chain lands before the round closes
        let mut remote = Chain::new(&AdmissionPolicy::ProofOfStake);
        for i in 0..2 {
            let b = staking::build_candidate(remote.tip(), i, "peer").unwrap();
            remote.append(b).unwrap();
        }
        assert!(ledger.receive_remote_blocks(remote.to_vec()).unwrap().is_adopted());

        let outcome = ledger.resolve_round();
        assert!(matches!(outcome, RoundOutcome::Stale { ref winner, .. } if winner == "a"));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_invalid_chain_penalizes_proposer() {
        let ledger = pos();
        ledger.register_validator("a", 12).unwrap();
        ledger.propose("a", 1).unwrap();
        ledger.resolve_round();

        ledger.state.lock().chain.blocks_mut()[1].payload = 1_000;

        let err = ledger.propose("a", 2).unwrap_err();
        assert_eq!(err, ChainError::ChainIntegrity(IntegrityViolation::HashMismatch { index: 1 }));
        assert_eq!(ledger.balance("a"), Some(12 - DEFAULT_STAKE_PENALTY));
        assert_eq!(ledger.pending_candidates(), 0);
    }

    #[test]
    fn test_registry_is_stake_only() {
        let ledger = Ledger::new(AdmissionPolicy::ProofOfWork { difficulty: 1 });
        assert!(matches!(ledger.register_validator("a", 1), Err(ChainError::PolicyMismatch(_))));
        let ledger = pos();
        ledger.register_validator("a", 1).unwrap();
        assert_eq!(ledger.adjust_balance("a", 4).unwrap(), 5);
        assert!(matches!(ledger.adjust_balance("zed", 4), Err(ChainError::UnknownValidator(_))));
    }

    #[test]
    fn test_malformed_remote_chain_leaves_ledger_untouched() {
        let ledger = pos();
        let err = ledger.receive_remote_chain("{not a chain").unwrap_err();
        assert!(matches!(err, ChainError::DeserializationFailure(_)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_remote_tip_at_end_of_time_is_refused() {
        let ledger = pos();
        ledger.register_validator("a", 3).unwrap();
        let genesis = ledger.current_chain()[0].clone();
        let last = Block::new(1, DateTime::<Utc>::MAX_UTC, 7, genesis.hash.clone(), Seal::Stake { validator_id: "x".into() });

        let err = ledger.receive_remote_blocks(vec![genesis, last]).unwrap_err();
        assert_eq!(err, ChainError::ChainIntegrity(IntegrityViolation::TimestampExhausted { index: 1 }));
        assert_eq!(ledger.len(), 1);

        ledger.propose("a", 1).unwrap();
        assert!(ledger.resolve_round().announcement().is_some());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_exhausted_tip_is_an_error_not_a_crash() {
        let ledger = Ledger::new(AdmissionPolicy::ProofOfWork { difficulty: 1 });
        let genesis = ledger.tip();
        let last = Block::new(1, DateTime::<Utc>::MAX_UTC, 7, genesis.hash.clone(), Seal::Work { difficulty: 1, nonce: String::new() });
        ledger.state.lock().chain.blocks_mut().push(last);

        let err = ledger.submit_data(2, None).unwrap_err();
        assert_eq!(err, ChainError::ChainIntegrity(IntegrityViolation::TimestampExhausted { index: 1 }));

        let ledger = pos();
        ledger.register_validator("a", 3).unwrap();
        let genesis = ledger.tip();
        let last = Block::new(1, DateTime::<Utc>::MAX_UTC, 7, genesis.hash.clone(), Seal::Stake { validator_id: "a".into() });
        ledger.state.lock().chain.blocks_mut().push(last);

        let err = ledger.propose("a", 2).unwrap_err();
        assert_eq!(err, ChainError::ChainIntegrity(IntegrityViolation::TimestampExhausted { index: 1 }));
        assert_eq!(ledger.balance("a"), Some(3));
        assert_eq!(ledger.pending_candidates(), 0);
    }

    #[test]
    fn test_removed_validator_loses_its_stake() {
        let ledger = pos();
        ledger.register_validator("a", 8).unwrap();
        ledger.propose("a", 1).unwrap();

        assert_eq!(ledger.remove_validator("a").unwrap(), 8);
        assert_eq!(ledger.balance("a"), None);
        assert!(matches!(ledger.remove_validator("a"), Err(ChainError::UnknownValidator(_))));
        assert_eq!(ledger.resolve_round(), RoundOutcome::NoEligibleValidator { round: 1, discarded: 1 });
        assert_eq!(ledger.len(), 1);

        let ledger = Ledger::new(AdmissionPolicy::ProofOfWork { difficulty: 1 });
        assert!(matches!(ledger.remove_validator("a"), Err(ChainError::PolicyMismatch(_))));
    }
}
