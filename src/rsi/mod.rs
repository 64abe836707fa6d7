//! RSI Loop (§4.11): recursive self-improvement — benchmark, analyze, hypothesize,
//! implement in a sandbox, re-benchmark, and accept or roll back.
//!
//! Grounded in `original_source/core/rsi/loop.py`.

pub mod apply;
pub mod loop_engine;
pub mod types;

pub use loop_engine::{ApprovalGate, AutoApprove, RSILoop, RSISummary};
pub use types::{
    aggregate_score, analyze, decide, Analysis, BenchmarkOutcome, BenchmarkOutcomes, ChangeAction, Decision, FileChange,
    ImprovementHypothesis, RSIConfig, RSIIteration, RSIPhase,
};
