//! Hierarchical decomposition and consolidation of change themes.
//!
//! The engines turn root themes into a bounded-depth, deduplicated tree:
//! - `ExpansionBreaker` + `ExpansionLedger` gate which nodes may still be
//!   decomposed (depth, repetition, structural atomicity, complexity)
//! - `DecompositionEngine` recursively asks the classifier how to split a
//!   node and validates every proposed scope partition
//! - `ConsolidationEngine` merges redundant siblings and collapses
//!   duplicate descendants toward the root
//! - `Analyzer` wires the shared gateway/cache/ledger and runs the whole
//!   pipeline over a pre-parsed diff

pub mod analyzer;
pub mod breaker;
pub mod consolidate;
pub mod decompose;
pub mod error;
pub mod ledger;
pub mod similarity;

pub use analyzer::Analyzer;
pub use breaker::{ExpansionBreaker, ExpansionGate};
pub use consolidate::ConsolidationEngine;
pub use decompose::DecompositionEngine;
pub use error::{EngineError, Result};
pub use ledger::{BreakerSnapshot, ExpansionLedger};
