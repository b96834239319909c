//! Shared protocol types for Theme Finder.
//!
//! This crate carries the data model exchanged between the classification
//! layer and the decomposition/consolidation engines:
//! - pre-parsed diff input (`DiffFile`, `DiffHunk`, `DiffLine`)
//! - the theme hierarchy (`ThemeNode`, `CodeScope`, `ThemeForest`)
//! - typed classification requests and payloads
//! - the configuration surface read once at startup
//!
//! It is consumed by both `theme-classifier` and `theme-engine`, and by
//! `theme-cli` for input/output serialization.

pub mod config;
pub mod diff;
pub mod request;
pub mod theme;

pub use config::{
    AnalysisConfig, BreakerConfig, CacheConfig, ConsolidationConfig, GatewayConfig,
};
pub use diff::{DiffFile, DiffHunk, DiffLine, LineKind};
pub use request::{
    ChildSpec, ClassificationKind, ClassificationPayload, ClassificationRequest,
    ExpansionDecision, Origin, RequestPriority, SimilarityPair, SimilarityVerdict, Verdict,
};
pub use theme::{
    CodeScope, CrossReference, ExpansionState, ScopeRange, ThemeForest, ThemeId, ThemeNode,
};
