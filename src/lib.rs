//! duochain - A minimal ledger with two admission policies
//!
//! Blocks carry a single integer payload. A chain admits new blocks either
//! by proof of work (a nonce search against a leading-zero target) or by
//! proof of stake (a stake-weighted lottery among round proposers). Nodes
//! reconcile by gossiping whole chains and adopting any longer valid one.
//!
//! # Architecture
//!
//! ## Core Blockchain
//! - [`blockchain`] - Block format, hashing, chain validation and stake state
//! - [`ledger`] - The shared chain, registry and candidate pool
//!
//! ## Consensus
//! - [`consensus`] - Longest-valid-chain fork choice
//! - [`miner`] - Proof-of-work nonce search
//! - [`staking`] - Candidate pool, weighted lottery and round outcomes
//!
//! ## Networking & Integration
//! - [`network`] - Newline-delimited JSON over TCP
//! - [`sync`] - Snapshot change detection and reconciliation
//! - [`api`] - HTTP endpoints (feature `api`)
//! - [`node`] - Service orchestration
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`shutdown`] - Cancellation signal

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod ledger;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;
pub mod miner;
pub mod staking;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod sync;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod shutdown;

pub use blockchain::{AdmissionPolicy, Block, Chain, Seal};
pub use error::{ChainError, Result};
pub use ledger::Ledger;
