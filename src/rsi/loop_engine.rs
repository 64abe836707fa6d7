//! The RSI Loop state machine (§4.11): IDLE → BENCHMARKING → ANALYZING → PLANNING
//! → IMPLEMENTING → RE_BENCHMARKING → DECIDING → (ACCEPTED | REJECTED) → IDLE.
//!
//! Grounded in `original_source/core/rsi/loop.py`'s `RSILoop`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::benchmark::{BenchmarkRunner, ProblemExecutor, RunConfig};
use crate::inference::InferenceClient;
use crate::store::types::MemoryType;
use crate::store::PersistentStore;
use crate::utils::extract_json_object;

use super::apply::{apply_changes, rollback_changes, stage_sandbox};
use super::types::{
    aggregate_score, analyze, decide, BenchmarkOutcome, BenchmarkOutcomes, ChangeAction, Decision, FileChange,
    ImprovementHypothesis, RSIConfig, RSIIteration, RSIPhase,
};

/// Approve or reject a hypothesis before it is applied permanently. Returning
/// `true` with no callback registered auto-approves, matching the source.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, hypothesis: &ImprovementHypothesis) -> bool;
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(&self, _hypothesis: &ImprovementHypothesis) -> bool {
        true
    }
}

pub struct RSILoop {
    config: RSIConfig,
    benchmark_runner: Arc<BenchmarkRunner>,
    executor: Arc<dyn ProblemExecutor>,
    inference: Arc<InferenceClient>,
    store: Arc<PersistentStore>,
    approval: Arc<dyn ApprovalGate>,
    sandbox_root: PathBuf,
    current_phase: Mutex<RSIPhase>,
    iteration_count: Mutex<u64>,
    iterations: Mutex<Vec<RSIIteration>>,
}

impl RSILoop {
    pub fn new(
        config: RSIConfig,
        benchmark_runner: Arc<BenchmarkRunner>,
        executor: Arc<dyn ProblemExecutor>,
        inference: Arc<InferenceClient>,
        store: Arc<PersistentStore>,
        sandbox_root: PathBuf,
    ) -> Self {
        Self {
            config,
            benchmark_runner,
            executor,
            inference,
            store,
            approval: Arc::new(AutoApprove),
            sandbox_root,
            current_phase: Mutex::new(RSIPhase::Idle),
            iteration_count: Mutex::new(0),
            iterations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = gate;
        self
    }

    fn set_phase(&self, phase: RSIPhase) {
        let mut current = self.current_phase.lock().unwrap();
        info!(from = current.as_str(), to = phase.as_str(), "RSI phase transition");
        *current = phase;
    }

    pub fn current_phase(&self) -> RSIPhase {
        *self.current_phase.lock().unwrap()
    }

    pub fn iterations(&self) -> Vec<RSIIteration> {
        self.iterations.lock().unwrap().clone()
    }

    #[instrument(skip(self))]
    async fn run_benchmarks(&self) -> BenchmarkOutcomes {
        let mut results = BenchmarkOutcomes::new();
        for name in &self.config.benchmarks {
            match self.benchmark_runner.run(name, self.executor.as_ref(), &RunConfig::default(), None).await {
                Ok(run) => {
                    results.insert(
                        name.clone(),
                        BenchmarkOutcome { score: run.average_score, passed: run.passed_count, total: run.total_problems, run_id: run.run_id, error: None },
                    );
                }
                Err(e) => {
                    warn!(benchmark = %name, error = %e, "benchmark failed");
                    results.insert(name.clone(), BenchmarkOutcome { error: Some(e.to_string()), ..Default::default() });
                }
            }
        }
        results
    }

    /// LLM-driven hypothesis generation. Returns `None` when there is no weakness
    /// to target, or when the model's response doesn't parse into a usable
    /// hypothesis — both are ordinary "nothing to do this round" outcomes, not
    /// errors.
    #[instrument(skip(self, analysis))]
    async fn generate_hypothesis(&self, analysis: &super::types::Analysis) -> Option<ImprovementHypothesis> {
        if analysis.weak_areas.is_empty() {
            info!("no weaknesses identified - nothing to improve");
            return None;
        }

        let prompt = format!(
            "You are a self-improving coding assistant.\n\nAnalysis shows these weaknesses:\n- Weak benchmarks: {:?}\n- Failed count: {}\n\nGenerate an improvement hypothesis. Identify ONE specific change to make.\n\nReturn JSON with:\n{{\n  \"description\": \"what to change\",\n  \"target_benchmark\": \"which benchmark to improve\",\n  \"expected_improvement\": 0.1,\n  \"reasoning\": \"why this will help\",\n  \"file_path\": \"path/to/file\",\n  \"old\": \"text to replace\",\n  \"new\": \"replacement text\"\n}}",
            analysis.weak_areas, analysis.failed_count
        );

        let response = self.inference.generate(&prompt, None, &self.config.llm_model).await;
        if !response.is_success() {
            warn!(error = ?response.error, "failed to generate hypothesis");
            return None;
        }

        let object = extract_json_object(&response.content)?;
        let data: serde_json::Value = serde_json::from_str(object).ok()?;

        let file_path = data.get("file_path").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let file_changes = if file_path.is_empty() {
            Vec::new()
        } else {
            vec![FileChange {
                file_path,
                action: ChangeAction::Modify,
                old: data.get("old").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                new: data.get("new").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            }]
        };

        Some(ImprovementHypothesis {
            hypothesis_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            created_at: chrono::Utc::now(),
            target_benchmark: data
                .get("target_benchmark")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| analysis.weak_areas[0].clone()),
            target_problems: Vec::new(),
            current_score: 0.0,
            expected_improvement: data.get("expected_improvement").and_then(|v| v.as_f64()).unwrap_or(0.05),
            description: data.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            file_changes,
            implemented: false,
            tested: false,
            accepted: false,
            actual_improvement: None,
            reasoning: data.get("reasoning").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            rejection_reason: None,
        })
    }

    fn store_experience(&self, iteration: &RSIIteration) {
        let key = format!("rsi_iteration_{}", iteration.iteration_id);
        if iteration.accepted {
            let value = format!(
                "approach={} result=Improvement: {:.2}%",
                iteration.hypothesis.as_ref().map(|h| h.description.as_str()).unwrap_or(""),
                iteration.improvement * 100.0
            );
            let _ = self.store.store(&key, &value, MemoryType::Skill, 0.7, &["self-improvement".to_string(), "rsi".to_string()]);
        } else {
            let reason = iteration
                .hypothesis
                .as_ref()
                .and_then(|h| h.rejection_reason.clone())
                .unwrap_or_else(|| "no hypothesis".to_string());
            let _ = self.store.store(&key, &reason, MemoryType::Error, 0.5, &["self-improvement".to_string(), "rsi".to_string()]);
        }
    }

    /// Runs one complete iteration of the loop. Never propagates an error out:
    /// anything that goes wrong mid-iteration leaves the iteration in its current
    /// phase with `accepted=false`, mirroring the source's catch-all.
    #[instrument(skip(self))]
    pub async fn iterate(&self) -> RSIIteration {
        let iteration_id = {
            let mut count = self.iteration_count.lock().unwrap();
            *count += 1;
            *count
        };
        let mut iteration = RSIIteration::new(iteration_id);
        let start = Instant::now();

        let outcome = self.run_iteration_body(&mut iteration).await;
        if let Err(e) = outcome {
            warn!(error = %e, "RSI iteration failed");
            iteration.current_phase = RSIPhase::Idle;
        }

        iteration.finished_at = Some(chrono::Utc::now());
        iteration.time_seconds = start.elapsed().as_secs_f64();
        self.store_experience(&iteration);
        self.iterations.lock().unwrap().push(iteration.clone());
        iteration
    }

    async fn run_iteration_body(&self, iteration: &mut RSIIteration) -> anyhow::Result<()> {
        self.set_phase(RSIPhase::Benchmarking);
        let baseline_results = self.run_benchmarks().await;
        iteration.baseline_score = aggregate_score(&baseline_results);

        self.set_phase(RSIPhase::Analyzing);
        let analysis = analyze(&baseline_results);

        self.set_phase(RSIPhase::Planning);
        let hypothesis = self.generate_hypothesis(&analysis).await;
        let Some(mut hypothesis) = hypothesis else {
            iteration.current_phase = RSIPhase::Idle;
            return Ok(());
        };
        hypothesis.current_score = iteration.baseline_score;

        self.set_phase(RSIPhase::Implementing);
        let sandbox_dir = self.sandbox_root.join(&hypothesis.hypothesis_id);
        if stage_sandbox(&mut hypothesis, &sandbox_dir).is_err() {
            warn!("failed to implement hypothesis");
            iteration.current_phase = RSIPhase::Rejected;
            iteration.hypothesis = Some(hypothesis);
            return Ok(());
        }
        apply_changes(&hypothesis)?;

        self.set_phase(RSIPhase::ReBenchmarking);
        let new_results = self.run_benchmarks().await;
        iteration.new_score = aggregate_score(&new_results);

        self.set_phase(RSIPhase::Deciding);
        let decision = decide(iteration.baseline_score, iteration.new_score, &self.config);
        iteration.improvement = iteration.new_score - iteration.baseline_score;

        match decision {
            Decision::Accept => {
                self.set_phase(RSIPhase::Accepted);
                iteration.accepted = true;
                hypothesis.accepted = true;
                hypothesis.actual_improvement = Some(iteration.improvement);

                if self.config.require_approval && !self.approval.approve(&hypothesis).await {
                    rollback_changes(&hypothesis)?;
                    iteration.accepted = false;
                    hypothesis.accepted = false;
                    self.set_phase(RSIPhase::Rejected);
                }
            }
            Decision::RejectRegression(reason) | Decision::RejectTooSmall(reason) => {
                self.set_phase(RSIPhase::Rejected);
                rollback_changes(&hypothesis)?;
                hypothesis.rejection_reason = Some(reason);
            }
        }

        iteration.hypothesis = Some(hypothesis);
        Ok(())
    }

    /// Runs iterations until `max_iterations` or, if `stop_on_no_improvement`,
    /// after 3 consecutive non-accepted iterations.
    #[instrument(skip(self))]
    pub async fn run_loop(&self, max_iterations: u32, stop_on_no_improvement: bool) {
        let mut consecutive_no_improvement = 0u32;

        for i in 0..max_iterations {
            info!(iteration = i + 1, of = max_iterations, "starting RSI iteration");
            let iteration = self.iterate().await;

            if iteration.accepted {
                consecutive_no_improvement = 0;
                info!(improvement = %format!("{:.2}%", iteration.improvement * 100.0), "improvement accepted");
            } else {
                consecutive_no_improvement += 1;
                info!("no improvement this iteration");
                if stop_on_no_improvement && consecutive_no_improvement >= 3 {
                    info!("stopping: 3 consecutive iterations without improvement");
                    break;
                }
            }
        }

        info!(total = self.iterations.lock().unwrap().len(), "RSI loop complete");
    }

    pub fn summary(&self) -> RSISummary {
        let iterations = self.iterations.lock().unwrap();
        let accepted = iterations.iter().filter(|i| i.accepted).count();
        RSISummary {
            total_iterations: iterations.len(),
            accepted,
            rejected: iterations.len() - accepted,
            total_improvement: iterations.iter().filter(|i| i.accepted).map(|i| i.improvement).sum(),
            current_phase: self.current_phase(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RSISummary {
    pub total_iterations: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub total_improvement: f64,
    pub current_phase: RSIPhase,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{BaseBenchmark, BenchmarkCategory, BenchmarkRegistry, Problem, ValidationKind};

    struct StaticBenchmark(f64);

    #[async_trait]
    impl BaseBenchmark for StaticBenchmark {
        fn name(&self) -> &str {
            "coding_tasks"
        }
        fn category(&self) -> BenchmarkCategory {
            BenchmarkCategory::Coding
        }
        fn problems(&self) -> Vec<Problem> {
            vec![Problem {
                problem_id: "p1".to_string(),
                category: BenchmarkCategory::Coding,
                statement: "s".to_string(),
                expected_output: "ok".to_string(),
                validation_type: ValidationKind::Exact,
                difficulty: 1,
                timeout_seconds: 5,
                tags: Vec::new(),
            }]
        }
        async fn score_problem(&self, _problem: &Problem, _response: &str, _work_dir: &std::path::Path) -> (f64, bool, Option<String>) {
            (self.0, self.0 >= 1.0, None)
        }
    }

    struct StaticExecutor;

    #[async_trait]
    impl ProblemExecutor for StaticExecutor {
        async fn run_problem(&self, _problem: &Problem, _config: &RunConfig) -> anyhow::Result<String> {
            Ok("whatever".to_string())
        }
    }

    fn make_loop(score: f64) -> (tempfile::TempDir, RSILoop) {
        let dir = tempfile::tempdir().unwrap();
        let bench_registry = Arc::new(BenchmarkRegistry::new());
        bench_registry.register("coding_tasks", move || Box::new(StaticBenchmark(score)));
        let runner = Arc::new(BenchmarkRunner::new(bench_registry, dir.path().join("benchmarks")).unwrap());
        let config = Arc::new(crate::config::Config::from_env());
        let inference = Arc::new(InferenceClient::new(config));
        let store = Arc::new(PersistentStore::open_in_memory().unwrap());
        let rsi_config = RSIConfig { benchmarks: vec!["coding_tasks".to_string()], ..Default::default() };
        let rsi = RSILoop::new(rsi_config, runner, Arc::new(StaticExecutor), inference, store, dir.path().join("sandbox"));
        (dir, rsi)
    }

    #[tokio::test]
    async fn iteration_with_no_weak_areas_stays_idle() {
        let (_dir, rsi) = make_loop(1.0);
        let iteration = rsi.iterate().await;
        assert!(!iteration.accepted);
        assert!(matches!(iteration.current_phase, RSIPhase::Idle));
        assert!(iteration.hypothesis.is_none());
    }

    #[tokio::test]
    async fn summary_reflects_completed_iterations() {
        let (_dir, rsi) = make_loop(1.0);
        rsi.iterate().await;
        rsi.iterate().await;
        let summary = rsi.summary();
        assert_eq!(summary.total_iterations, 2);
        assert_eq!(summary.accepted, 0);
    }

    #[test]
    fn fresh_loop_starts_idle() {
        let (_dir, rsi) = make_loop(1.0);
        assert!(matches!(rsi.current_phase(), RSIPhase::Idle));
    }
}
