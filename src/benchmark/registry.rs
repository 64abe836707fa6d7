//! Benchmark trait and registry (§4.11), grounded in
//! `original_source/core/benchmarks/base.py`'s `BaseBenchmark`/`BenchmarkRegistry`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::problem::{BenchmarkCategory, Problem};

/// A benchmark suite: a fixed problem set plus a scoring function. Implementors
/// may override `setup_problem`/`cleanup_problem` to stage files in the run's
/// temporary work directory.
#[async_trait]
pub trait BaseBenchmark: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    fn category(&self) -> BenchmarkCategory;
    fn problems(&self) -> Vec<Problem>;

    /// Returns (score in [0,1], passed, optional error message).
    async fn score_problem(&self, problem: &Problem, response: &str, work_dir: &Path) -> (f64, bool, Option<String>);

    async fn setup_problem(&self, _problem: &Problem, _work_dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup_problem(&self, _problem: &Problem, _work_dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_problem(&self, problem_id: &str) -> Option<Problem> {
        self.problems().into_iter().find(|p| p.problem_id == problem_id)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn BaseBenchmark> + Send + Sync>;

/// Process-wide registry of benchmark factories, keyed by benchmark name.
#[derive(Default)]
pub struct BenchmarkRegistry {
    factories: Mutex<HashMap<String, Factory>>,
}

impl BenchmarkRegistry {
    pub fn new() -> Self {
        Self { factories: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, name: impl Into<String>, factory: impl Fn() -> Box<dyn BaseBenchmark> + Send + Sync + 'static) {
        self.factories.lock().unwrap().insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn BaseBenchmark>> {
        self.factories.lock().unwrap().get(name).map(|f| f())
    }

    pub fn list_all(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
                validation_type: super::super::problem::ValidationKind::Exact,
                difficulty: 1,
                timeout_seconds: 10,
                tags: Vec::new(),
            }]
        }
        async fn score_problem(&self, _problem: &Problem, response: &str, _work_dir: &Path) -> (f64, bool, Option<String>) {
            let passed = response.trim() == "hi";
            (if passed { 1.0 } else { 0.0 }, passed, None)
        }
    }

    #[test]
    fn registered_benchmark_is_creatable_by_name() {
        let registry = BenchmarkRegistry::new();
        registry.register("echo", || Box::new(Echo));
        assert_eq!(registry.list_all(), vec!["echo".to_string()]);
        let bench = registry.create("echo").unwrap();
        assert_eq!(bench.problems().len(), 1);
    }

    #[test]
    fn unknown_benchmark_name_returns_none() {
        let registry = BenchmarkRegistry::new();
        assert!(registry.create("nope").is_none());
    }
}
