//! Problem/result data model (§3, §4.11).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkCategory {
    Coding,
    Fixing,
    Planning,
    ToolUse,
    Reasoning,
    SelfHealing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Exact,
    Contains,
    Regex,
    /// Write generated code to a temp file, run a fixed assertion battery, parse
    /// `RESULT: passed/total` from the subprocess output.
    TestRunner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub problem_id: String,
    pub category: BenchmarkCategory,
    pub statement: String,
    pub expected_output: String,
    #[serde(default = "default_validation")]
    pub validation_type: ValidationKind,
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_validation() -> ValidationKind {
    ValidationKind::Exact
}
fn default_difficulty() -> u8 {
    1
}
fn default_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemResult {
    pub problem_id: String,
    pub timestamp: DateTime<Utc>,
    pub score: Option<f64>,
    pub passed: bool,
    pub tokens_used: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub wall_time_seconds: f64,
    pub timed_out: bool,
    pub error: Option<String>,
    pub actual_output: Option<String>,
}

impl ProblemResult {
    pub fn new(problem_id: impl Into<String>) -> Self {
        Self {
            problem_id: problem_id.into(),
            timestamp: Utc::now(),
            score: None,
            passed: false,
            tokens_used: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            wall_time_seconds: 0.0,
            timed_out: false,
            error: None,
            actual_output: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.score.is_some() || self.error.is_some()
    }
}

/// Validates a raw response against a Problem's expected output per its
/// validation kind. Exact/contains/regex are the deterministic kinds; TestRunner
/// validation happens out-of-band (the executor runs the test battery itself and
/// reports pass/fail through the response text as `RESULT: passed/total`).
pub fn validate(problem: &Problem, response: &str) -> (f64, bool) {
    match problem.validation_type {
        ValidationKind::Exact => {
            let passed = response.trim() == problem.expected_output.trim();
            (if passed { 1.0 } else { 0.0 }, passed)
        }
        ValidationKind::Contains => {
            let passed = response.contains(problem.expected_output.trim());
            (if passed { 1.0 } else { 0.0 }, passed)
        }
        ValidationKind::Regex => match regex::Regex::new(&problem.expected_output) {
            Ok(re) => {
                let passed = re.is_match(response);
                (if passed { 1.0 } else { 0.0 }, passed)
            }
            Err(_) => (0.0, false),
        },
        ValidationKind::TestRunner => parse_test_runner_result(response),
    }
}

fn parse_test_runner_result(response: &str) -> (f64, bool) {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"(?i)RESULT:\s*(\d+)\s*/\s*(\d+)").unwrap());
    match re.captures(response) {
        Some(caps) => {
            let passed: u32 = caps[1].parse().unwrap_or(0);
            let total: u32 = caps[2].parse().unwrap_or(0);
            if total == 0 {
                (0.0, false)
            } else {
                let score = passed as f64 / total as f64;
                (score, passed == total)
            }
        }
        None => (0.0, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(kind: ValidationKind, expected: &str) -> Problem {
        Problem {
            problem_id: "p1".to_string(),
            category: BenchmarkCategory::Coding,
            statement: "do the thing".to_string(),
            expected_output: expected.to_string(),
            validation_type: kind,
            difficulty: 1,
            timeout_seconds: 60,
            tags: Vec::new(),
        }
    }

    #[test]
    fn exact_validation_requires_trimmed_equality() {
        let p = problem(ValidationKind::Exact, "42");
        assert_eq!(validate(&p, "  42  "), (1.0, true));
        assert_eq!(validate(&p, "43"), (0.0, false));
    }

    #[test]
    fn contains_validation_checks_substring() {
        let p = problem(ValidationKind::Contains, "hello");
        assert_eq!(validate(&p, "well hello there"), (1.0, true));
    }

    #[test]
    fn test_runner_result_parses_fraction() {
        let p = problem(ValidationKind::TestRunner, "");
        let (score, passed) = validate(&p, "ran suite\nRESULT: 3/4\n");
        assert_eq!(score, 0.75);
        assert!(!passed);
    }

    #[test]
    fn test_runner_full_pass_is_passed() {
        let p = problem(ValidationKind::TestRunner, "");
        let (score, passed) = validate(&p, "RESULT: 5/5");
        assert_eq!(score, 1.0);
        assert!(passed);
    }
}
