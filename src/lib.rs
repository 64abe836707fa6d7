//! local-agency
//!
//! A local, single-process agentic orchestrator: a rule-based complexity gate
//! routes each request to a trivial/simple/planned path, a Supervisor drafts and
//! rescues plans, per-kind Operators execute them against a sandboxed tool
//! registry, and a Metrics Registry tracks per-model performance well enough to
//! fire or promote fleet members. A Council Engine, Worker Pool, Retrieval
//! Engine, VRAM Guard, and RSI Loop sit alongside the core request path as
//! independent collaborators wired together in `main`.

pub mod benchmark;
pub mod config;
pub mod council;
pub mod error;
pub mod eventbus;
pub mod executor;
pub mod gate;
pub mod inference;
pub mod metrics;
pub mod operator;
pub mod plan;
pub mod registry;
pub mod retrieval;
pub mod rsi;
pub mod safety;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod vram;
pub mod worker;

// Re-exports for convenience
pub use config::Config;
pub use executor::TaskExecutor;
pub use gate::{AgentKind, Complexity};
pub use plan::{Context, Plan, TaskResult};
