//! Benchmark Runner (§4.11): runs sequences of Problems against an injectable
//! executor and persists BenchmarkRuns and baselines to disk.
//!
//! Grounded in `original_source/core/benchmarks/{base,runner}.py`.

pub mod problem;
pub mod registry;
pub mod runner;

pub use problem::{BenchmarkCategory, Problem, ProblemResult, ValidationKind};
pub use registry::{BaseBenchmark, BenchmarkRegistry};
pub use runner::{BenchmarkRun, BenchmarkRunner, ProblemExecutor, RunConfig};
