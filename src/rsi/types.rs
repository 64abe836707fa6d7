//! RSI Loop data model (§3.1, §4.11), grounded in
//! `original_source/core/rsi/loop.py`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RSIPhase {
    Idle,
    Benchmarking,
    Analyzing,
    Planning,
    Implementing,
    ReBenchmarking,
    Deciding,
    Accepted,
    Rejected,
}

impl RSIPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RSIPhase::Idle => "idle",
            RSIPhase::Benchmarking => "benchmarking",
            RSIPhase::Analyzing => "analyzing",
            RSIPhase::Planning => "planning",
            RSIPhase::Implementing => "implementing",
            RSIPhase::ReBenchmarking => "re_benchmarking",
            RSIPhase::Deciding => "deciding",
            RSIPhase::Accepted => "accepted",
            RSIPhase::Rejected => "rejected",
        }
    }
}

/// One file mutation staged for a hypothesis. Modify replaces `old` with `new`
/// once in the target file; create writes `new` verbatim; delete removes the file
/// (its prior content is kept in `old` so rollback can restore it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub file_path: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub old: String,
    #[serde(default)]
    pub new: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Modify,
    Create,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementHypothesis {
    pub hypothesis_id: String,
    pub created_at: DateTime<Utc>,
    pub target_benchmark: String,
    #[serde(default)]
    pub target_problems: Vec<String>,
    pub current_score: f64,
    pub expected_improvement: f64,
    pub description: String,
    pub file_changes: Vec<FileChange>,
    pub implemented: bool,
    pub tested: bool,
    pub accepted: bool,
    pub actual_improvement: Option<f64>,
    pub reasoning: String,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RSIIteration {
    pub iteration_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_phase: RSIPhase,
    pub baseline_score: f64,
    pub new_score: f64,
    pub hypothesis: Option<ImprovementHypothesis>,
    pub accepted: bool,
    pub improvement: f64,
    pub time_seconds: f64,
}

impl RSIIteration {
    pub fn new(iteration_id: u64) -> Self {
        Self {
            iteration_id,
            started_at: Utc::now(),
            finished_at: None,
            current_phase: RSIPhase::Idle,
            baseline_score: 0.0,
            new_score: 0.0,
            hypothesis: None,
            accepted: false,
            improvement: 0.0,
            time_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RSIConfig {
    pub benchmarks: Vec<String>,
    pub min_improvement: f64,
    pub max_regression: f64,
    pub max_iteration_time_secs: u64,
    pub sandbox_mode: bool,
    pub require_approval: bool,
    pub llm_model: String,
    pub planning_temperature: f64,
}

impl Default for RSIConfig {
    fn default() -> Self {
        Self {
            benchmarks: vec!["coding_tasks".to_string(), "bug_fixing".to_string()],
            min_improvement: 0.01,
            max_regression: 0.0,
            max_iteration_time_secs: 3600,
            sandbox_mode: true,
            require_approval: true,
            llm_model: "default".to_string(),
            planning_temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BenchmarkOutcome {
    pub score: f64,
    pub passed: usize,
    pub total: usize,
    pub run_id: String,
    pub error: Option<String>,
}

pub type BenchmarkOutcomes = HashMap<String, BenchmarkOutcome>;

#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub weak_areas: Vec<String>,
    pub error_patterns: HashMap<String, u32>,
    pub failed_count: usize,
}

/// Weighted average of per-benchmark scores; benchmarks that errored are excluded.
pub fn aggregate_score(results: &BenchmarkOutcomes) -> f64 {
    let scores: Vec<f64> = results.values().filter(|r| r.error.is_none()).map(|r| r.score).collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Benchmarks scoring below 0.8 are flagged weak; this drives hypothesis generation.
pub fn analyze(results: &BenchmarkOutcomes) -> Analysis {
    let weak_areas: Vec<String> =
        results.iter().filter(|(_, r)| r.error.is_none() && r.score < 0.8).map(|(name, _)| name.clone()).collect();
    Analysis { weak_areas, error_patterns: HashMap::new(), failed_count: 0 }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    RejectRegression(String),
    RejectTooSmall(String),
}

/// §9 scenario 7: regression fails before the min-improvement check; the message
/// format `"Regression detected: {improvement:.2%}"` is load-bearing for callers.
pub fn decide(baseline_score: f64, new_score: f64, config: &RSIConfig) -> Decision {
    let improvement = new_score - baseline_score;
    if improvement < -config.max_regression {
        return Decision::RejectRegression(format!("Regression detected: {:.2}%", improvement * 100.0));
    }
    if improvement < config.min_improvement {
        return Decision::RejectTooSmall(format!("Improvement too small: {:.2}%", improvement * 100.0));
    }
    Decision::Accept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(score: f64) -> BenchmarkOutcome {
        BenchmarkOutcome { score, passed: 1, total: 1, run_id: "r".to_string(), error: None }
    }

    #[test]
    fn aggregate_score_averages_successful_benchmarks_only() {
        let mut results = BenchmarkOutcomes::new();
        results.insert("a".to_string(), outcome(0.8));
        results.insert("b".to_string(), outcome(0.6));
        results.insert("c".to_string(), BenchmarkOutcome { error: Some("boom".to_string()), ..outcome(0.0) });
        assert!((aggregate_score(&results) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn regression_rejects_with_exact_scenario_7_message() {
        let config = RSIConfig { min_improvement: 0.01, max_regression: 0.0, ..Default::default() };
        let decision = decide(0.60, 0.59, &config);
        assert_eq!(decision, Decision::RejectRegression("Regression detected: -1.00%".to_string()));
    }

    #[test]
    fn improvement_below_threshold_rejects_as_too_small() {
        let config = RSIConfig { min_improvement: 0.05, max_regression: 0.0, ..Default::default() };
        let decision = decide(0.60, 0.61, &config);
        assert!(matches!(decision, Decision::RejectTooSmall(_)));
    }

    #[test]
    fn sufficient_improvement_accepts() {
        let config = RSIConfig { min_improvement: 0.01, max_regression: 0.0, ..Default::default() };
        assert_eq!(decide(0.60, 0.62, &config), Decision::Accept);
    }
}
