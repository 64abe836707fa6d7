//! Core data model shared by the Supervisor, Operator, and Task Executor (§3).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::AgentKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub action: String,
    pub params: HashMap<String, Value>,
    pub description: Option<String>,
    pub fallback_action: Option<String>,
    pub timeout: Duration,
    pub capture_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub understanding: String,
    pub complexity: u8,
    pub confidence: f32,
    pub steps: Vec<PlanStep>,
    pub agent_kind: AgentKind,
    pub model_tier: String,
    pub operator_prompt: String,
    pub total_timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub enum PlanError {
    EmptySteps,
    NonContiguousSteps,
    DuplicateStepNumbers,
    ComplexityOutOfRange(u8),
    ConfidenceOutOfRange(f32),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::EmptySteps => write!(f, "plan has no steps"),
            PlanError::NonContiguousSteps => write!(f, "step numbers are not contiguous from 1"),
            PlanError::DuplicateStepNumbers => write!(f, "step numbers are not unique"),
            PlanError::ComplexityOutOfRange(c) => write!(f, "complexity {c} out of range 1-5"),
            PlanError::ConfidenceOutOfRange(c) => write!(f, "confidence {c} out of range 0.0-1.0"),
        }
    }
}

impl Plan {
    /// Validate the invariants from §3: contiguous step numbers from 1, at least one
    /// step, complexity/confidence within range.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptySteps);
        }
        if !(1..=5).contains(&self.complexity) {
            return Err(PlanError::ComplexityOutOfRange(self.complexity));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PlanError::ConfidenceOutOfRange(self.confidence));
        }
        let mut numbers: Vec<u32> = self.steps.iter().map(|s| s.step_number).collect();
        numbers.sort_unstable();
        let unique_count = {
            let mut set = numbers.clone();
            set.dedup();
            set.len()
        };
        if unique_count != numbers.len() {
            return Err(PlanError::DuplicateStepNumbers);
        }
        let contiguous = numbers.iter().enumerate().all(|(i, &n)| n == (i as u32 + 1));
        if !contiguous {
            return Err(PlanError::NonContiguousSteps);
        }
        Ok(())
    }

    /// Canned single-step fallback plan used when the Supervisor cannot parse its own
    /// model's output (§4.5).
    pub fn canned_fallback(query: &str, agent_kind: AgentKind, model_tier: &str) -> Self {
        let mut params = HashMap::new();
        params.insert("cmd".to_string(), Value::String(query.to_string()));
        Plan {
            understanding: format!("Fallback plan for: {query}"),
            complexity: 3,
            confidence: 0.3,
            steps: vec![PlanStep {
                step_number: 1,
                action: "run_command".to_string(),
                params,
                description: Some("Best-effort direct execution of the raw query".to_string()),
                fallback_action: None,
                timeout: Duration::from_secs(30),
                capture_output: true,
            }],
            agent_kind,
            model_tier: model_tier.to_string(),
            operator_prompt: query.to_string(),
            total_timeout: Duration::from_secs(120),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: u32,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepResult {
    pub fn success(step_number: u32, output: impl Into<String>, duration: Duration) -> Self {
        Self { step_number, success: true, output: Some(output.into()), error: None, duration }
    }

    pub fn failure(step_number: u32, error: impl Into<String>, duration: Duration) -> Self {
        Self { step_number, success: false, output: None, error: Some(error.into()), duration }
    }

    /// §8 P2: success XOR error present.
    pub fn satisfies_invariant(&self) -> bool {
        self.success != self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    pub plan_used: Option<Plan>,
    /// Counts only the steps that succeeded in the final (accepted) pass — see
    /// SPEC_FULL.md §9's resolved open question.
    pub steps_completed: u32,
    pub total_duration: Duration,
    pub supervisor_calls: u32,
    pub operator_calls: u32,
    pub errors: Vec<String>,
}

impl TaskResult {
    /// §8 P1: steps_completed <= len(plan.steps), or 0 with no plan.
    pub fn satisfies_invariant(&self) -> bool {
        match &self.plan_used {
            Some(plan) => self.steps_completed as usize <= plan.steps.len(),
            None => self.steps_completed == 0,
        }
    }
}

/// Caller-provided execution context, passed by value and never mutated by callees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub working_dir: String,
    pub last_output: Option<String>,
    pub recent_history: Vec<String>,
    pub language: String,
    pub session_id: String,
    pub turn: u32,
    pub enabled_tools: HashMap<String, bool>,
}

impl Context {
    pub fn new(working_dir: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            last_output: None,
            recent_history: Vec::new(),
            language: "en".to_string(),
            session_id: session_id.into(),
            turn: 0,
            enabled_tools: HashMap::new(),
        }
    }

    /// Push a command into the ring of the last 5, trimming the oldest.
    pub fn push_history(&mut self, cmd: impl Into<String>) {
        self.recent_history.push(cmd.into());
        if self.recent_history.len() > 5 {
            let excess = self.recent_history.len() - 5;
            self.recent_history.drain(..excess);
        }
    }

    /// Sliding-window trim of the running transcript once it exceeds a byte budget —
    /// concrete mechanism behind "last command output (truncated)" (SPEC_FULL.md §10.5).
    pub fn set_last_output(&mut self, output: impl Into<String>, budget: crate::utils::TruncationPolicy) {
        self.last_output = Some(crate::utils::truncate_text(&output.into(), budget));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_plan_passes() {
        let plan = Plan::canned_fallback("do something", AgentKind::Shell, "default");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn empty_steps_rejected() {
        let mut plan = Plan::canned_fallback("x", AgentKind::Shell, "default");
        plan.steps.clear();
        assert!(matches!(plan.validate(), Err(PlanError::EmptySteps)));
    }

    #[test]
    fn non_contiguous_steps_rejected() {
        let mut plan = Plan::canned_fallback("x", AgentKind::Shell, "default");
        plan.steps.push(plan.steps[0].clone());
        plan.steps[1].step_number = 5;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn step_result_invariant_holds_for_success_and_failure() {
        let ok = StepResult::success(1, "done", Duration::from_millis(10));
        let err = StepResult::failure(1, "boom", Duration::from_millis(10));
        assert!(ok.satisfies_invariant());
        assert!(err.satisfies_invariant());
    }

    #[test]
    fn history_ring_keeps_last_five() {
        let mut ctx = Context::new("/tmp", "s1");
        for i in 0..8 {
            ctx.push_history(format!("cmd{i}"));
        }
        assert_eq!(ctx.recent_history.len(), 5);
        assert_eq!(ctx.recent_history[0], "cmd3");
    }
}
