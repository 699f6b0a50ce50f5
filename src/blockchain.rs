// Thin re-export module: implementation lives in `blockchain/core.rs`, split
// into hashing, chain structure, validation and stake state.

pub mod core;
pub use core::*;
