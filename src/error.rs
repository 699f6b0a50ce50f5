//! Error types for DuoChain

use std::fmt;

/// A broken chain invariant, tagged with the index of the offending block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    EmptyChain,
    InvalidGenesis,
    IndexGap { index: u64, expected: u64 },
    LinkBroken { index: u64 },
    TimestampRegression { index: u64 },
    HashMismatch { index: u64 },
    /// No later timestamp can be represented after this block.
    TimestampExhausted { index: u64 },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IntegrityViolation::EmptyChain => write!(f, "chain has no genesis block"),
            IntegrityViolation::InvalidGenesis => write!(f, "genesis block is malformed"),
            IntegrityViolation::IndexGap { index, expected } => {
                write!(f, "block index {} does not follow parent (expected {})", index, expected)
            }
            IntegrityViolation::LinkBroken { index } => {
                write!(f, "block {} does not reference its parent's hash", index)
            }
            IntegrityViolation::TimestampRegression { index } => {
                write!(f, "block {} is not newer than its parent", index)
            }
            IntegrityViolation::HashMismatch { index } => {
                write!(f, "block {} hash does not match its contents", index)
            }
            IntegrityViolation::TimestampExhausted { index } => {
                write!(f, "block {} timestamp leaves no room for a successor", index)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    MalformedInput(String),
    ChainIntegrity(IntegrityViolation),
    InvalidSeal(String),
    PolicyMismatch(String),
    NoEligibleValidator,
    UnknownValidator(String),
    DeserializationFailure(String),
    Cancelled,
    NetworkError(String),
    ConfigError(String),
    IoError(String),
}

impl ChainError {
    /// True for the link, timestamp and hash sub-kinds (and their genesis/empty relatives).
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, ChainError::ChainIntegrity(_))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::MalformedInput(msg) => write!(f, "Malformed input: {}", msg),
            ChainError::ChainIntegrity(v) => write!(f, "Chain integrity violation: {}", v),
            ChainError::InvalidSeal(msg) => write!(f, "Invalid seal: {}", msg),
            ChainError::PolicyMismatch(msg) => write!(f, "Policy mismatch: {}", msg),
            ChainError::NoEligibleValidator => write!(f, "No eligible validator in lottery pool"),
            ChainError::UnknownValidator(id) => write!(f, "Unknown validator: {}", id),
            ChainError::DeserializationFailure(msg) => write!(f, "Deserialization failure: {}", msg),
            ChainError::Cancelled => write!(f, "Operation cancelled"),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Config error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<IntegrityViolation> for ChainError {
    fn from(v: IntegrityViolation) -> Self {
        ChainError::ChainIntegrity(v)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::DeserializationFailure(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
