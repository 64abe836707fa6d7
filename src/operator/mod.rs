//! Operator (§4.6): executes a Plan's steps against the tool registry with a
//! shared retry/fallback state machine. Five specializations (File/Code/Web/Shell/Rag)
//! differ only in tool catalogue and system-prompt prefix.

pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{instrument, warn};

use crate::eventbus::{Event, EventBus, EventType};
use crate::gate::AgentKind;
use crate::inference::{ChatMessage, InferenceClient};
use crate::plan::{Plan, PlanStep, StepResult};
use crate::utils::extract_json_object;
use tools::{normalize_params, ToolRegistry};

/// The LLM-generated JSON contract for "simple" (gated) tool selection; validated at
/// the deserialization boundary, schema published to the model in the prompt itself.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    params: HashMap<String, Value>,
}

pub struct OperatorOutcome {
    pub success: bool,
    pub steps_completed: u32,
    pub step_results: Vec<StepResult>,
    pub errors: Vec<String>,
}

fn system_prefix(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::File => "You operate on the local filesystem.",
        AgentKind::Code => "You read, write, and run code in this repository.",
        AgentKind::Web => "You answer using web search results.",
        AgentKind::Shell => "You run shell commands to accomplish the task.",
        AgentKind::Rag => "You retrieve and cite relevant local content.",
    }
}

pub struct Operator {
    pub kind: AgentKind,
    tools: Arc<ToolRegistry>,
    inference: Arc<InferenceClient>,
    events: Arc<EventBus>,
}

impl Operator {
    pub fn new(kind: AgentKind, tools: Arc<ToolRegistry>, inference: Arc<InferenceClient>, events: Arc<EventBus>) -> Self {
        Self { kind, tools, inference, events }
    }

    async fn publish_status(&self, step_number: u32, action: &str, status: &str, attempts: u32, error: Option<&str>) {
        let mut data = HashMap::new();
        data.insert("step".to_string(), Value::from(step_number));
        data.insert("action".to_string(), Value::String(action.to_string()));
        data.insert("status".to_string(), Value::String(status.to_string()));
        data.insert("attempts".to_string(), Value::from(attempts));
        if let Some(e) = error {
            data.insert("error".to_string(), Value::String(e.to_string()));
        }
        self.events.emit(Event::new(EventType::Service, "operator", data)).await;
    }

    async fn run_step(&self, step: &PlanStep, attempts: u32) -> StepResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(step.timeout, self.tools.execute(&step.action, &step.params)).await;

        match outcome {
            Ok(Ok(output)) => {
                self.publish_status(step.step_number, &step.action, "success", attempts, None).await;
                StepResult::success(step.step_number, output, start.elapsed())
            }
            Ok(Err(e)) => {
                self.publish_status(step.step_number, &step.action, "failed", attempts, Some(&e)).await;
                StepResult::failure(step.step_number, e, start.elapsed())
            }
            Err(_) => {
                let msg = format!("step {} timed out after {:?}", step.step_number, step.timeout);
                self.publish_status(step.step_number, &step.action, "failed", attempts, Some(&msg)).await;
                StepResult::failure(step.step_number, msg, start.elapsed())
            }
        }
    }

    /// Runs a step, and on failure with a declared fallback action, retries once with
    /// the fallback under the same parameters.
    async fn run_step_with_fallback(&self, step: &PlanStep, attempts: u32) -> StepResult {
        let result = self.run_step(step, attempts).await;
        if result.success {
            return result;
        }
        let Some(fallback_action) = &step.fallback_action else {
            return result;
        };
        self.publish_status(step.step_number, fallback_action, "retrying", attempts, None).await;
        let fallback_step = PlanStep {
            step_number: step.step_number,
            action: fallback_action.clone(),
            params: step.params.clone(),
            description: step.description.clone(),
            fallback_action: None,
            timeout: step.timeout,
            capture_output: step.capture_output,
        };
        self.run_step(&fallback_step, attempts).await
    }

    /// Loops the full step sequence up to `plan.max_retries + 1` times, exiting early
    /// once a pass completes with every step successful.
    #[instrument(skip(self, plan), fields(agent_kind = ?self.kind, n_steps = plan.steps.len()))]
    pub async fn execute_plan(&self, plan: &Plan) -> OperatorOutcome {
        let mut errors = Vec::new();
        let mut last_pass_results = Vec::new();

        for attempt in 0..=plan.max_retries {
            let mut pass_results = Vec::new();
            let mut pass_success = true;

            for step in &plan.steps {
                let result = self.run_step_with_fallback(step, attempt + 1).await;
                if !result.success {
                    pass_success = false;
                    errors.push(result.error.clone().unwrap_or_default());
                    pass_results.push(result);
                    break;
                }
                pass_results.push(result);
            }

            last_pass_results = pass_results;
            if pass_success {
                return OperatorOutcome {
                    success: true,
                    steps_completed: last_pass_results.len() as u32,
                    step_results: last_pass_results,
                    errors,
                };
            }
        }

        let steps_completed = last_pass_results.iter().filter(|r| r.success).count() as u32;
        OperatorOutcome { success: false, steps_completed, step_results: last_pass_results, errors }
    }

    fn simple_task_prompt(&self, query: &str) -> String {
        let catalogue = self.tools.catalogue_for(self.kind);
        let schema = schemars::schema_for!(ToolCall);
        format!(
            "{}\nAvailable tools: {:?}\nRequest: {}\n\nRespond with a single JSON object matching this schema:\n{}",
            system_prefix(self.kind),
            catalogue,
            query,
            serde_json::to_string(&schema).unwrap_or_default(),
        )
    }

    /// Handles a "simple" (gated) task with no plan: one LLM call for tool selection,
    /// then a single tool execution.
    #[instrument(skip(self), fields(agent_kind = ?self.kind))]
    pub async fn run_simple_task(&self, query: &str, model: &str) -> StepResult {
        let start = Instant::now();
        let prompt = self.simple_task_prompt(query);
        let resp = self
            .inference
            .generate(&prompt, Some("Respond with JSON only, no prose."), model)
            .await;

        if !resp.is_success() {
            let msg = format!("tool selection call failed: {:?}", resp.error);
            return StepResult::failure(1, msg, start.elapsed());
        }

        let parsed = extract_json_object(&resp.content).and_then(|j| serde_json::from_str::<ToolCall>(j).ok());
        let Some(call) = parsed else {
            warn!("simple-task tool selection response was unparsable JSON");
            return StepResult::failure(1, "could not determine a tool selection from the model's response", start.elapsed());
        };

        let params = normalize_params(&call.tool, call.params);
        match self.tools.execute(&call.tool, &params).await {
            Ok(output) => StepResult::success(1, output, start.elapsed()),
            Err(e) => StepResult::failure(1, e, start.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::safety::SafetyGuard;
    use crate::worker::MetaSearchClient;

    fn make_operator(kind: AgentKind) -> Operator {
        let config = Arc::new(Config::from_env());
        let inference = Arc::new(InferenceClient::new(config));
        let tools = Arc::new(ToolRegistry::new(
            "/tmp",
            Arc::new(SafetyGuard::new()),
            Arc::new(MetaSearchClient::new("http://localhost:8888")),
        ));
        let events = Arc::new(EventBus::new(64));
        Operator::new(kind, tools, inference, events)
    }

    #[tokio::test]
    async fn plan_with_all_successful_steps_exits_on_first_pass() {
        let operator = make_operator(AgentKind::Shell);
        let mut params = HashMap::new();
        params.insert("cmd".to_string(), Value::String("true".to_string()));
        let plan = Plan {
            understanding: "run true".to_string(),
            complexity: 1,
            confidence: 1.0,
            steps: vec![PlanStep {
                step_number: 1,
                action: "run_command".to_string(),
                params,
                description: None,
                fallback_action: None,
                timeout: Duration::from_secs(5),
                capture_output: true,
            }],
            agent_kind: AgentKind::Shell,
            model_tier: "fast".to_string(),
            operator_prompt: "run true".to_string(),
            total_timeout: Duration::from_secs(30),
            max_retries: 2,
        };

        let outcome = operator.execute_plan(&plan).await;
        assert!(outcome.success);
        assert_eq!(outcome.steps_completed, 1);
    }

    #[tokio::test]
    async fn plan_step_invariant_holds_under_failure() {
        let operator = make_operator(AgentKind::Shell);
        let mut params = HashMap::new();
        params.insert("cmd".to_string(), Value::String("false".to_string()));
        let plan = Plan {
            understanding: "run false".to_string(),
            complexity: 1,
            confidence: 1.0,
            steps: vec![PlanStep {
                step_number: 1,
                action: "run_command".to_string(),
                params,
                description: None,
                fallback_action: None,
                timeout: Duration::from_secs(5),
                capture_output: true,
            }],
            agent_kind: AgentKind::Shell,
            model_tier: "fast".to_string(),
            operator_prompt: "run false".to_string(),
            total_timeout: Duration::from_secs(30),
            max_retries: 0,
        };

        let outcome = operator.execute_plan(&plan).await;
        assert!(!outcome.success);
        assert!(outcome.step_results.iter().all(|r| r.satisfies_invariant()));
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn steps_completed_never_exceeds_plan_length() {
        let operator = make_operator(AgentKind::Shell);
        let mut p1 = HashMap::new();
        p1.insert("cmd".to_string(), Value::String("true".to_string()));
        let mut p2 = HashMap::new();
        p2.insert("cmd".to_string(), Value::String("false".to_string()));
        let plan = Plan {
            understanding: "two steps".to_string(),
            complexity: 2,
            confidence: 0.8,
            steps: vec![
                PlanStep {
                    step_number: 1,
                    action: "run_command".to_string(),
                    params: p1,
                    description: None,
                    fallback_action: None,
                    timeout: Duration::from_secs(5),
                    capture_output: true,
                },
                PlanStep {
                    step_number: 2,
                    action: "run_command".to_string(),
                    params: p2,
                    description: None,
                    fallback_action: None,
                    timeout: Duration::from_secs(5),
                    capture_output: true,
                },
            ],
            agent_kind: AgentKind::Shell,
            model_tier: "fast".to_string(),
            operator_prompt: "two steps".to_string(),
            total_timeout: Duration::from_secs(30),
            max_retries: 1,
        };

        let outcome = operator.execute_plan(&plan).await;
        assert!(outcome.steps_completed as usize <= plan.steps.len());
    }
}
