//! Benchmark execution and persistence (§4.11, §6 benchmark artifacts), grounded
//! in `original_source/core/benchmarks/runner.py`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::problem::{validate, Problem, ProblemResult};
use super::registry::{BaseBenchmark, BenchmarkRegistry};

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_concurrent: usize,
    pub timeout_seconds: u64,
    pub save_results: bool,
    pub verbose: bool,
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout_seconds: 120,
            save_results: true,
            verbose: false,
            model: None,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// Runs a single problem and returns the model's raw response text. Implemented
/// by whatever drives the model under test (the Task Executor, a raw chat call,
/// or a test double).
#[async_trait]
pub trait ProblemExecutor: Send + Sync {
    async fn run_problem(&self, problem: &Problem, config: &RunConfig) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub run_id: String,
    pub benchmark_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: HashMap<String, ProblemResult>,
    pub total_problems: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub timed_out_count: usize,
    pub error_count: usize,
    pub average_score: f64,
    pub total_tokens: u64,
    pub total_time_seconds: f64,
}

impl BenchmarkRun {
    fn new(run_id: String, benchmark_name: String, total_problems: usize) -> Self {
        Self {
            run_id,
            benchmark_name,
            started_at: Utc::now(),
            finished_at: None,
            results: HashMap::new(),
            total_problems,
            passed_count: 0,
            failed_count: 0,
            timed_out_count: 0,
            error_count: 0,
            average_score: 0.0,
            total_tokens: 0,
            total_time_seconds: 0.0,
        }
    }

    pub fn add_result(&mut self, result: ProblemResult) {
        if result.passed {
            self.passed_count += 1;
        } else if result.timed_out {
            self.timed_out_count += 1;
        } else if result.error.is_some() {
            self.error_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.total_tokens += result.tokens_used;
        self.total_time_seconds += result.wall_time_seconds;
        self.results.insert(result.problem_id.clone(), result);
        self.total_problems = self.results.len();

        let scores: Vec<f64> = self.results.values().filter_map(|r| r.score).collect();
        self.average_score = if scores.is_empty() { 0.0 } else { scores.iter().sum::<f64>() / scores.len() as f64 };
    }

    pub fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> String {
        let pass_pct = if self.total_problems == 0 { 0.0 } else { self.passed_count as f64 / self.total_problems as f64 * 100.0 };
        format!(
            "Benchmark: {}\nRun ID: {}\nTotal: {} problems\nPassed: {} ({:.1}%)\nFailed: {}\nTimed out: {}\nErrors: {}\n\nAverage Score: {:.2}\nTotal Tokens: {}\nTotal Time: {:.1}s\n",
            self.benchmark_name,
            self.run_id,
            self.total_problems,
            self.passed_count,
            pass_pct,
            self.failed_count,
            self.timed_out_count,
            self.error_count,
            self.average_score,
            self.total_tokens,
            self.total_time_seconds,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaselinePointer {
    run_id: String,
    set_at: DateTime<Utc>,
    average_score: f64,
    passed_count: usize,
    total_problems: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComparison {
    pub run1: String,
    pub run2: String,
    pub improved: Vec<String>,
    pub regressed: Vec<String>,
    pub unchanged: Vec<String>,
    pub score_diff: f64,
    pub run1_score: f64,
    pub run2_score: f64,
    pub is_improvement: bool,
}

pub struct BenchmarkRunner {
    registry: std::sync::Arc<BenchmarkRegistry>,
    results_dir: PathBuf,
}

impl BenchmarkRunner {
    pub fn new(registry: std::sync::Arc<BenchmarkRegistry>, results_dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&results_dir)?;
        Ok(Self { registry, results_dir })
    }

    #[instrument(skip(self, executor, config), fields(benchmark = %benchmark_name))]
    pub async fn run(
        &self,
        benchmark_name: &str,
        executor: &dyn ProblemExecutor,
        config: &RunConfig,
        problem_ids: Option<&[String]>,
    ) -> anyhow::Result<BenchmarkRun> {
        let benchmark = self
            .registry
            .create(benchmark_name)
            .ok_or_else(|| anyhow::anyhow!("unknown benchmark: {benchmark_name} (available: {:?})", self.registry.list_all()))?;

        let mut problems = benchmark.problems();
        if let Some(ids) = problem_ids {
            problems.retain(|p| ids.contains(&p.problem_id));
        }
        if problems.is_empty() {
            anyhow::bail!("no problems found for benchmark: {benchmark_name}");
        }

        let run_id = format!("{}_{}_{}", benchmark_name, Utc::now().format("%Y%m%d_%H%M%S"), &Uuid::new_v4().simple().to_string()[..8]);
        let mut run = BenchmarkRun::new(run_id, benchmark_name.to_string(), problems.len());

        info!(count = problems.len(), "starting benchmark");
        let work_dir = tempfile::tempdir()?;

        for (i, problem) in problems.iter().enumerate() {
            if config.verbose {
                info!(index = i + 1, total = problems.len(), problem = %problem.problem_id, "running problem");
            }
            let result = self.run_problem(benchmark.as_ref(), problem, executor, work_dir.path(), config).await;
            run.add_result(result);
        }

        run.finalize();
        if config.save_results {
            self.save_run(&run)?;
        }
        info!(passed = run.passed_count, total = run.total_problems, "benchmark complete");
        Ok(run)
    }

    async fn run_problem(
        &self,
        benchmark: &dyn BaseBenchmark,
        problem: &Problem,
        executor: &dyn ProblemExecutor,
        work_dir: &std::path::Path,
        config: &RunConfig,
    ) -> ProblemResult {
        let mut result = ProblemResult::new(problem.problem_id.clone());
        let start = Instant::now();

        if let Err(e) = benchmark.setup_problem(problem, work_dir).await {
            result.error = Some(e.to_string());
            result.wall_time_seconds = start.elapsed().as_secs_f64();
            return result;
        }

        let timeout = std::time::Duration::from_secs(problem.timeout_seconds.min(config.timeout_seconds));
        let response = tokio::time::timeout(timeout, executor.run_problem(problem, config)).await;

        match response {
            Err(_) => {
                result.timed_out = true;
                result.score = Some(0.0);
            }
            Ok(Err(e)) => {
                result.error = Some(e.to_string());
                result.score = Some(0.0);
                warn!(problem = %problem.problem_id, error = %e, "problem execution failed");
            }
            Ok(Ok(response)) => {
                let (score, passed, error) = benchmark.score_problem(problem, &response, work_dir).await;
                result.score = Some(score);
                result.passed = passed;
                result.actual_output = Some(response.chars().take(1000).collect());
                result.error = error;
                let _ = benchmark.cleanup_problem(problem, work_dir).await;
            }
        }

        result.wall_time_seconds = start.elapsed().as_secs_f64();
        result
    }

    pub async fn run_all(&self, executor: &dyn ProblemExecutor, config: &RunConfig) -> HashMap<String, BenchmarkRun> {
        let mut results = HashMap::new();
        for name in self.registry.list_all() {
            match self.run(&name, executor, config, None).await {
                Ok(run) => {
                    results.insert(name, run);
                }
                Err(e) => warn!(benchmark = %name, error = %e, "failed to run benchmark"),
            }
        }
        results
    }

    fn save_run(&self, run: &BenchmarkRun) -> anyhow::Result<()> {
        let path = self.results_dir.join(format!("{}.json", run.run_id));
        write_locked(&path, &serde_json::to_string_pretty(run)?)
    }

    pub fn load_run(&self, run_id: &str) -> anyhow::Result<Option<BenchmarkRun>> {
        let path = self.results_dir.join(format!("{run_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let contents = read_locked(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn list_runs(&self, benchmark_name: Option<&str>) -> anyhow::Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.results_dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if stem.ends_with("_baseline") {
                    continue;
                }
                if benchmark_name.map(|n| stem.starts_with(n)).unwrap_or(true) {
                    runs.push(stem.to_string());
                }
            }
        }
        runs.sort_by(|a, b| b.cmp(a));
        Ok(runs)
    }

    pub fn get_baseline(&self, benchmark_name: &str) -> anyhow::Result<Option<BenchmarkRun>> {
        let path = self.results_dir.join(format!("{benchmark_name}_baseline.json"));
        if !path.exists() {
            return Ok(None);
        }
        let contents = read_locked(&path)?;
        let pointer: BaselinePointer = serde_json::from_str(&contents)?;
        self.load_run(&pointer.run_id)
    }

    pub fn set_baseline(&self, run_id: &str) -> anyhow::Result<()> {
        let run = self.load_run(run_id)?.ok_or_else(|| anyhow::anyhow!("run not found: {run_id}"))?;
        let pointer = BaselinePointer {
            run_id: run_id.to_string(),
            set_at: Utc::now(),
            average_score: run.average_score,
            passed_count: run.passed_count,
            total_problems: run.total_problems,
        };
        let path = self.results_dir.join(format!("{}_baseline.json", run.benchmark_name));
        write_locked(&path, &serde_json::to_string_pretty(&pointer)?)?;
        info!(benchmark = %run.benchmark_name, run_id, "baseline set");
        Ok(())
    }

    pub fn compare(&self, run_id_1: &str, run_id_2: &str) -> anyhow::Result<RunComparison> {
        let run1 = self.load_run(run_id_1)?.ok_or_else(|| anyhow::anyhow!("could not load run: {run_id_1}"))?;
        let run2 = self.load_run(run_id_2)?.ok_or_else(|| anyhow::anyhow!("could not load run: {run_id_2}"))?;

        let mut improved = Vec::new();
        let mut regressed = Vec::new();
        let mut unchanged = Vec::new();

        let mut all_ids: Vec<&String> = run1.results.keys().chain(run2.results.keys()).collect();
        all_ids.sort();
        all_ids.dedup();

        for pid in all_ids {
            let (Some(r1), Some(r2)) = (run1.results.get(pid), run2.results.get(pid)) else { continue };
            let score1 = r1.score.unwrap_or(0.0);
            let score2 = r2.score.unwrap_or(0.0);
            if score2 > score1 + 0.01 {
                improved.push(pid.clone());
            } else if score2 < score1 - 0.01 {
                regressed.push(pid.clone());
            } else {
                unchanged.push(pid.clone());
            }
        }

        let score_diff = run2.average_score - run1.average_score;
        Ok(RunComparison {
            run1: run_id_1.to_string(),
            run2: run_id_2.to_string(),
            is_improvement: regressed.is_empty() && run2.average_score >= run1.average_score,
            improved,
            regressed,
            unchanged,
            score_diff,
            run1_score: run1.average_score,
            run2_score: run2.average_score,
        })
    }
}

fn write_locked(path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    use std::io::Write;
    let file = std::fs::File::create(path)?;
    file.lock_exclusive()?;
    let mut f = &file;
    f.write_all(contents.as_bytes())?;
    FileExt::unlock(&file)?;
    Ok(())
}

fn read_locked(path: &std::path::Path) -> anyhow::Result<String> {
    let file = std::fs::File::open(path)?;
    file.lock_shared()?;
    let contents = std::fs::read_to_string(path)?;
    FileExt::unlock(&file)?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::problem::{BenchmarkCategory, ValidationKind};
    use crate::benchmark::registry::BaseBenchmark;

    struct Echo;

    #[async_trait]
    impl BaseBenchmark for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn category(&self) -> BenchmarkCategory {
            BenchmarkCategory::Coding
        }
        fn problems(&self) -> Vec<Problem> {
            vec![Problem {
                problem_id: "p1".to_string(),
                category: BenchmarkCategory::Coding,
                statement: "say hi".to_string(),
                expected_output: "hi".to_string(),
                validation_type: ValidationKind::Exact,
                difficulty: 1,
                timeout_seconds: 5,
                tags: Vec::new(),
            }]
        }
        async fn score_problem(&self, problem: &Problem, response: &str, _work_dir: &std::path::Path) -> (f64, bool, Option<String>) {
            let (score, passed) = validate(problem, response);
            (score, passed, None)
        }
    }

    struct StaticExecutor(String);

    #[async_trait]
    impl ProblemExecutor for StaticExecutor {
        async fn run_problem(&self, _problem: &Problem, _config: &RunConfig) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn runner() -> (tempfile::TempDir, BenchmarkRunner) {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(BenchmarkRegistry::new());
        registry.register("echo", || Box::new(Echo));
        let runner = BenchmarkRunner::new(registry, dir.path().to_path_buf()).unwrap();
        (dir, runner)
    }

    #[tokio::test]
    async fn successful_run_persists_and_reloads_losslessly() {
        let (_dir, runner) = runner();
        let executor = StaticExecutor("hi".to_string());
        let run = runner.run("echo", &executor, &RunConfig::default(), None).await.unwrap();
        assert_eq!(run.passed_count, 1);
        assert_eq!(run.average_score, 1.0);

        let reloaded = runner.load_run(&run.run_id).unwrap().unwrap();
        assert_eq!(reloaded.average_score, run.average_score);
        assert_eq!(reloaded.passed_count, run.passed_count);
        assert_eq!(reloaded.total_problems, run.total_problems);
    }

    #[tokio::test]
    async fn baseline_pointer_round_trips() {
        let (_dir, runner) = runner();
        let executor = StaticExecutor("hi".to_string());
        let run = runner.run("echo", &executor, &RunConfig::default(), None).await.unwrap();
        runner.set_baseline(&run.run_id).unwrap();
        let baseline = runner.get_baseline("echo").unwrap().unwrap();
        assert_eq!(baseline.run_id, run.run_id);
    }

    #[tokio::test]
    async fn compare_flags_regression_when_score_drops() {
        let (_dir, runner) = runner();
        let good = StaticExecutor("hi".to_string());
        let bad = StaticExecutor("nope".to_string());
        let run1 = runner.run("echo", &good, &RunConfig::default(), None).await.unwrap();
        let run2 = runner.run("echo", &bad, &RunConfig::default(), None).await.unwrap();
        let cmp = runner.compare(&run1.run_id, &run2.run_id).unwrap();
        assert_eq!(cmp.regressed, vec!["p1".to_string()]);
        assert!(!cmp.is_improvement);
    }

    #[tokio::test]
    async fn unknown_benchmark_name_errors() {
        let (_dir, runner) = runner();
        let executor = StaticExecutor("hi".to_string());
        let result = runner.run("nonexistent", &executor, &RunConfig::default(), None).await;
        assert!(result.is_err());
    }
}
