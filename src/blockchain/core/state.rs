use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// Staked balance per participant identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRegistry {
    balances: HashMap<String, u64>,
}

impl StakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant, overwriting any previous balance.
    pub fn register(&mut self, id: &str, balance: u64) {
        self.balances.insert(id.to_string(), balance);
    }

    /// Apply a signed change to a registered balance. Balances floor at zero.
    pub fn adjust(&mut self, id: &str, delta: i64) -> Result<u64, ChainError> {
        let balance = self
            .balances
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownValidator(id.to_string()))?;
        *balance = if delta >= 0 {
            balance.saturating_add(delta as u64)
        } else {
            balance.saturating_sub(delta.unsigned_abs())
        };
        Ok(*balance)
    }

    /// Deduct a penalty; unregistered identities have nothing to lose.
    pub fn penalize(&mut self, id: &str, amount: u64) -> u64 {
        match self.balances.get_mut(id) {
            Some(balance) => {
                *balance = balance.saturating_sub(amount);
                *balance
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<u64> {
        self.balances.remove(id)
    }

    pub fn get_balance(&self, id: &str) -> Option<u64> {
        self.balances.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.balances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    /// Point-in-time copy used to build one round's lottery.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.balances.clone()
    }
}
