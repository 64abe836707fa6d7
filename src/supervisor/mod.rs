//! Supervisor (§4.5): drives a large model to produce structured plans, and performs
//! rescue after the Operator exhausts its retry budget. Never executes a step itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::gate::AgentKind;
use crate::inference::InferenceClient;
use crate::plan::{Plan, PlanStep};
use crate::utils::extract_json_object;

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
struct PlanStepWire {
    action: String,
    #[serde(default)]
    params: HashMap<String, Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fallback_action: Option<String>,
}

/// Wire format for the planning model's JSON output; schema is published in the
/// planning prompt itself via `schemars::schema_for!` rather than hand-kept in sync.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
struct PlanWire {
    understanding: String,
    complexity: u8,
    confidence: f32,
    steps: Vec<PlanStepWire>,
    agent_type: String,
    model_size: String,
    operator_prompt: String,
}

fn parse_agent_kind(s: &str) -> AgentKind {
    match s.to_lowercase().as_str() {
        "code" => AgentKind::Code,
        "web" => AgentKind::Web,
        "shell" => AgentKind::Shell,
        "rag" => AgentKind::Rag,
        _ => AgentKind::File,
    }
}

fn wire_to_plan(wire: PlanWire) -> Plan {
    let steps = wire
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| PlanStep {
            step_number: (i + 1) as u32,
            action: s.action,
            params: s.params,
            description: s.description,
            fallback_action: s.fallback_action,
            timeout: Duration::from_secs(30),
            capture_output: true,
        })
        .collect();

    Plan {
        understanding: wire.understanding,
        complexity: wire.complexity.clamp(1, 5),
        confidence: wire.confidence.clamp(0.0, 1.0),
        steps,
        agent_kind: parse_agent_kind(&wire.agent_type),
        model_tier: wire.model_size,
        operator_prompt: wire.operator_prompt,
        total_timeout: Duration::from_secs(300),
        max_retries: 2,
    }
}

#[derive(Debug, Clone)]
pub enum RescueAction {
    AdjustPlan(Plan),
    ChangeAgent(Plan),
    Takeover(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
struct RescueWire {
    action: String,
    #[serde(default)]
    plan: Option<PlanWire>,
    #[serde(default)]
    direct_result: Option<String>,
}

pub struct Supervisor {
    inference: Arc<InferenceClient>,
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(inference: Arc<InferenceClient>, config: Arc<Config>) -> Self {
        Self { inference, config }
    }

    fn planning_prompt(&self, query: &str, ctx: &crate::plan::Context) -> String {
        let schema = schemars::schema_for!(PlanWire);
        format!(
            "You are the planning supervisor of a local agentic system.\n\
             Working directory: {}\n\
             Recent commands: {:?}\n\
             Last result (truncated): {}\n\
             Language: {}\n\
             User query: {}\n\n\
             Respond with a single JSON object matching this schema (agent_type is one of \
             \"file\"|\"code\"|\"web\"|\"shell\"|\"rag\"):\n{}",
            ctx.working_dir,
            ctx.recent_history.iter().rev().take(3).collect::<Vec<_>>(),
            ctx.last_output.clone().unwrap_or_default(),
            ctx.language,
            query,
            serde_json::to_string(&schema).unwrap_or_default(),
        )
    }

    /// Drives the planning model and parses its JSON via the shared brace-balance
    /// extractor. On any parse error, degrades to a canned single-step plan with
    /// confidence 0.3 rather than propagating.
    #[instrument(skip(self, ctx))]
    pub async fn plan(&self, query: &str, ctx: &crate::plan::Context, default_agent: AgentKind) -> Plan {
        let prompt = self.planning_prompt(query, ctx);
        let resp = self
            .inference
            .generate(&prompt, Some("Respond with JSON only, no prose."), "default")
            .await;

        if !resp.is_success() {
            warn!(error = ?resp.error, "supervisor planning call failed; using canned plan");
            return Plan::canned_fallback(query, default_agent, "default");
        }

        match extract_json_object(&resp.content).and_then(|j| serde_json::from_str::<PlanWire>(j).ok()) {
            Some(wire) => {
                let plan = wire_to_plan(wire);
                match plan.validate() {
                    Ok(()) => plan,
                    Err(e) => {
                        warn!(error = %e, "supervisor plan failed validation; using canned plan");
                        Plan::canned_fallback(query, default_agent, "default")
                    }
                }
            }
            None => {
                warn!("supervisor planning response was unparsable JSON; using canned plan");
                Plan::canned_fallback(query, default_agent, "default")
            }
        }
    }

    fn rescue_prompt(&self, query: &str, failed_plan: &Plan, errors: &[String]) -> String {
        let schema = schemars::schema_for!(RescueWire);
        format!(
            "The following plan failed after exhausting retries.\n\
             Original query: {}\n\
             Failed plan: {}\n\
             Errors: {:?}\n\n\
             Respond with a single JSON object matching this schema. `action` is one of \
             ADJUST_PLAN (include a new `plan`), CHANGE_AGENT (include a `plan` targeting a \
             different agent_type), or TAKEOVER (include `direct_result`):\n{}",
            query,
            serde_json::to_string(failed_plan).unwrap_or_default(),
            errors,
            serde_json::to_string(&schema).unwrap_or_default(),
        )
    }

    /// Rescue failure (unparsable response) defaults to TAKEOVER with a generic message.
    #[instrument(skip(self, failed_plan, errors))]
    pub async fn rescue(&self, query: &str, failed_plan: &Plan, errors: &[String]) -> RescueAction {
        let prompt = self.rescue_prompt(query, failed_plan, errors);
        let resp = self
            .inference
            .generate(&prompt, Some("Respond with JSON only, no prose."), "default")
            .await;

        if !resp.is_success() {
            warn!(error = ?resp.error, "supervisor rescue call failed; defaulting to takeover");
            return RescueAction::Takeover(
                "I was unable to complete this task after multiple attempts.".to_string(),
            );
        }

        match extract_json_object(&resp.content).and_then(|j| serde_json::from_str::<RescueWire>(j).ok()) {
            Some(wire) => match wire.action.as_str() {
                "ADJUST_PLAN" => match wire.plan.map(wire_to_plan) {
                    Some(p) if p.validate().is_ok() => RescueAction::AdjustPlan(p),
                    _ => RescueAction::Takeover("Rescue plan was invalid.".to_string()),
                },
                "CHANGE_AGENT" => match wire.plan.map(wire_to_plan) {
                    Some(p) if p.validate().is_ok() => RescueAction::ChangeAgent(p),
                    _ => RescueAction::Takeover("Rescue plan was invalid.".to_string()),
                },
                "TAKEOVER" => {
                    RescueAction::Takeover(wire.direct_result.unwrap_or_else(|| "No answer available.".to_string()))
                }
                _ => RescueAction::Takeover("Unrecognized rescue action.".to_string()),
            },
            None => {
                warn!("supervisor rescue response was unparsable JSON; defaulting to takeover");
                RescueAction::Takeover("I was unable to complete this task after multiple attempts.".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_falls_back_to_canned_plan() {
        let mut config = Config::from_env();
        config.vllm_base_url = "http://127.0.0.1:1".to_string();
        let config = Arc::new(config);
        let inference = Arc::new(InferenceClient::new(config.clone()));
        let supervisor = Supervisor::new(inference, config);
        let ctx = crate::plan::Context::new("/tmp", "s1");
        let plan = supervisor.plan("open the hyprland config", &ctx, AgentKind::File).await;
        assert_eq!(plan.confidence, 0.3);
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_rescue_defaults_to_takeover() {
        let mut config = Config::from_env();
        config.vllm_base_url = "http://127.0.0.1:1".to_string();
        let config = Arc::new(config);
        let inference = Arc::new(InferenceClient::new(config.clone()));
        let supervisor = Supervisor::new(inference, config);
        let failed_plan = Plan::canned_fallback("q", AgentKind::File, "default");
        let action = supervisor.rescue("q", &failed_plan, &["boom".to_string()]).await;
        assert!(matches!(action, RescueAction::Takeover(_)));
    }
}
