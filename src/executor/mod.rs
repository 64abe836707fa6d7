//! Task Executor (§4.7): the single top-level entry point. Glues the Complexity Gate,
//! the Supervisor, and the per-kind Operators together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tracing::instrument;

use crate::gate::{self, AgentKind, Complexity};
use crate::operator::Operator;
use crate::plan::{Context, Plan, TaskResult};
use crate::supervisor::{RescueAction, Supervisor};

pub struct TaskExecutor {
    supervisor: Arc<Supervisor>,
    operators: HashMap<AgentKind, Arc<Operator>>,
    default_model_tier: String,
}

fn handle_trivial(query: &str) -> String {
    let lower = query.trim().to_lowercase();
    if lower.contains("time") {
        return Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    }
    if lower.contains("date") {
        return Local::now().format("%Y-%m-%d").to_string();
    }
    if matches!(lower.as_str(), "quit" | "exit" | "goodbye" | "bye") {
        return "Goodbye.".to_string();
    }
    if matches!(lower.as_str(), "hi" | "hello" | "hey") {
        return "Hello! How can I help?".to_string();
    }
    "Done.".to_string()
}

impl TaskExecutor {
    pub fn new(supervisor: Arc<Supervisor>, operators: HashMap<AgentKind, Arc<Operator>>, default_model_tier: impl Into<String>) -> Self {
        Self { supervisor, operators, default_model_tier: default_model_tier.into() }
    }

    fn operator_for(&self, kind: AgentKind) -> Arc<Operator> {
        self.operators
            .get(&kind)
            .or_else(|| self.operators.get(&AgentKind::File))
            .cloned()
            .expect("at least the File operator must be registered")
    }

    /// Classify -> dispatch -> (on moderate/complex failure) rescue -> accumulate
    /// statistics. The Supervisor is invoked at most twice per request.
    #[instrument(skip(self, ctx), fields(query_len = query.len()))]
    pub async fn execute(&self, query: &str, ctx: &Context) -> TaskResult {
        let start = Instant::now();
        let decision = gate::classify(query);

        match decision.complexity {
            Complexity::Trivial => TaskResult {
                success: true,
                output: handle_trivial(query),
                plan_used: None,
                steps_completed: 0,
                total_duration: start.elapsed(),
                supervisor_calls: 0,
                operator_calls: 0,
                errors: Vec::new(),
            },
            Complexity::Simple => {
                let kind = decision.suggested_agent.unwrap_or(AgentKind::File);
                let operator = self.operator_for(kind);
                let result = operator.run_simple_task(query, &self.default_model_tier).await;
                TaskResult {
                    success: result.success,
                    output: result.output.clone().unwrap_or_default(),
                    plan_used: None,
                    steps_completed: if result.success { 1 } else { 0 },
                    total_duration: start.elapsed(),
                    supervisor_calls: 0,
                    operator_calls: 1,
                    errors: result.error.into_iter().collect(),
                }
            }
            Complexity::Moderate | Complexity::Complex => {
                self.execute_planned(query, ctx, decision.suggested_agent, start).await
            }
        }
    }

    async fn execute_planned(
        &self,
        query: &str,
        ctx: &Context,
        suggested_agent: Option<AgentKind>,
        start: Instant,
    ) -> TaskResult {
        let plan = self.supervisor.plan(query, ctx, suggested_agent.unwrap_or(AgentKind::File)).await;
        let operator = self.operator_for(plan.agent_kind);
        let outcome = operator.execute_plan(&plan).await;

        if outcome.success {
            return TaskResult {
                success: true,
                output: outcome
                    .step_results
                    .last()
                    .and_then(|r| r.output.clone())
                    .unwrap_or_default(),
                plan_used: Some(plan),
                steps_completed: outcome.steps_completed,
                total_duration: start.elapsed(),
                supervisor_calls: 1,
                operator_calls: 1,
                errors: outcome.errors,
            };
        }

        let rescue = self.supervisor.rescue(query, &plan, &outcome.errors).await;
        let mut errors = outcome.errors;

        match rescue {
            RescueAction::AdjustPlan(new_plan) | RescueAction::ChangeAgent(new_plan) => {
                let operator = self.operator_for(new_plan.agent_kind);
                let second_outcome = operator.execute_plan(&new_plan).await;
                errors.extend(second_outcome.errors.clone());
                TaskResult {
                    success: second_outcome.success,
                    output: second_outcome
                        .step_results
                        .last()
                        .and_then(|r| r.output.clone())
                        .unwrap_or_default(),
                    plan_used: Some(new_plan),
                    steps_completed: second_outcome.steps_completed,
                    total_duration: start.elapsed(),
                    supervisor_calls: 2,
                    operator_calls: 2,
                    errors,
                }
            }
            RescueAction::Takeover(text) => TaskResult {
                success: true,
                output: text,
                plan_used: Some(plan),
                steps_completed: outcome.steps_completed,
                total_duration: start.elapsed(),
                supervisor_calls: 2,
                operator_calls: 1,
                errors,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::eventbus::EventBus;
    use crate::inference::InferenceClient;
    use crate::safety::SafetyGuard;
    use crate::worker::MetaSearchClient;
    use crate::operator::tools::ToolRegistry;

    fn make_executor() -> TaskExecutor {
        let config = Arc::new(Config::from_env());
        let inference = Arc::new(InferenceClient::new(config.clone()));
        let events = Arc::new(EventBus::new(64));
        let tools = Arc::new(ToolRegistry::new(
            "/tmp",
            Arc::new(SafetyGuard::new()),
            Arc::new(MetaSearchClient::new("http://localhost:8888")),
        ));

        let mut operators = HashMap::new();
        for kind in [AgentKind::File, AgentKind::Code, AgentKind::Web, AgentKind::Shell, AgentKind::Rag] {
            operators.insert(kind, Arc::new(Operator::new(kind, tools.clone(), inference.clone(), events.clone())));
        }

        let supervisor = Arc::new(Supervisor::new(inference, config));
        TaskExecutor::new(supervisor, operators, "fast")
    }

    #[tokio::test]
    async fn trivial_time_query_never_touches_inference_server() {
        let executor = make_executor();
        let ctx = Context::new("/tmp", "s1");
        let result = executor.execute("what time is it?", &ctx).await;
        assert!(result.success);
        assert_eq!(result.supervisor_calls, 0);
        assert_eq!(result.operator_calls, 0);
        assert!(result.satisfies_invariant());
    }

    #[tokio::test]
    async fn task_result_invariant_holds_for_moderate_path_against_unreachable_server() {
        let mut config = Config::from_env();
        config.vllm_base_url = "http://127.0.0.1:1".to_string();
        let config = Arc::new(config);
        let inference = Arc::new(InferenceClient::new(config.clone()));
        let events = Arc::new(EventBus::new(64));
        let tools = Arc::new(ToolRegistry::new(
            "/tmp",
            Arc::new(SafetyGuard::new()),
            Arc::new(MetaSearchClient::new("http://localhost:8888")),
        ));
        let mut operators = HashMap::new();
        for kind in [AgentKind::File, AgentKind::Code, AgentKind::Web, AgentKind::Shell, AgentKind::Rag] {
            operators.insert(kind, Arc::new(Operator::new(kind, tools.clone(), inference.clone(), events.clone())));
        }
        let supervisor = Arc::new(Supervisor::new(inference, config));
        let executor = TaskExecutor::new(supervisor, operators, "fast");

        let ctx = Context::new("/tmp", "s1");
        let result = executor.execute("please refactor this module and explain how it works", &ctx).await;
        assert!(result.satisfies_invariant());
        assert!(result.supervisor_calls >= 1);
    }
}
