//! Council Engine (§4.9): fan-out of one prompt to N heterogeneous workers, with
//! weighted consensus and rating-based agreement scoring.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell_regex::rating_regexes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::inference::{ChatMessage, InferenceClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilPreset {
    CodeReview,
    FactCheck,
    CreativeWriting,
    BugAnalysis,
    SecurityAudit,
}

impl CouncilPreset {
    fn system_prompt(&self) -> &'static str {
        match self {
            CouncilPreset::CodeReview => {
                "You are a senior code reviewer. Evaluate correctness, style, and risk. End with a rating out of 10."
            }
            CouncilPreset::FactCheck => {
                "You are a fact-checker. Evaluate the claim's accuracy and cite your reasoning. End with a rating out of 10."
            }
            CouncilPreset::CreativeWriting => {
                "You are a creative writing critic. Evaluate originality, voice, and craft. End with a rating out of 10."
            }
            CouncilPreset::BugAnalysis => {
                "You are debugging an issue. Identify the likely root cause. End with a confidence rating out of 10."
            }
            CouncilPreset::SecurityAudit => {
                "You are a security auditor. Identify vulnerabilities and their severity. End with a risk rating out of 10."
            }
        }
    }
}

fn generic_system_prompt() -> &'static str {
    "You are one member of a council of reviewers. Respond concisely and end with a rating out of 10."
}

#[derive(Debug, Clone)]
pub struct CouncilMember {
    pub name: String,
    pub model: String,
    pub weight: f64,
    pub specialization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CouncilResponse {
    pub member: String,
    pub response: String,
    pub rating: Option<f64>,
    pub latency: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CouncilResult {
    pub responses: Vec<CouncilResponse>,
    pub consensus: String,
    pub average_rating: Option<f64>,
    pub agreement: f64,
    pub total_duration: Duration,
}

mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn rating_regexes() -> &'static [Regex; 4] {
        static CELL: OnceLock<[Regex; 4]> = OnceLock::new();
        CELL.get_or_init(|| {
            [
                Regex::new(r"(?i)(\d{1,2}(?:\.\d)?)\s*/\s*10").unwrap(),
                Regex::new(r"(?i)rating\s*[:=]\s*(\d{1,2}(?:\.\d)?)").unwrap(),
                Regex::new(r"(?i)score\s*[:=]\s*(\d{1,2}(?:\.\d)?)").unwrap(),
                Regex::new(r"(?i)(\d{1,2}(?:\.\d)?)\s*out of\s*10").unwrap(),
            ]
        })
    }
}

/// Extracts a numeric rating from free text, constrained to [0, 10].
pub fn extract_rating(text: &str) -> Option<f64> {
    for re in rating_regexes() {
        if let Some(caps) = re.captures(text) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Some(value.clamp(0.0, 10.0));
            }
        }
    }
    None
}

pub struct CouncilEngine {
    inference: Arc<InferenceClient>,
}

impl CouncilEngine {
    pub fn new(inference: Arc<InferenceClient>) -> Self {
        Self { inference }
    }

    #[instrument(skip(self, prompt, members), fields(n_members = members.len()))]
    pub async fn query(&self, prompt: &str, preset: Option<CouncilPreset>, members: &[CouncilMember]) -> CouncilResult {
        let start = Instant::now();
        let system = preset.map(|p| p.system_prompt()).unwrap_or_else(generic_system_prompt);

        let futures = members.iter().map(|member| {
            let inference = self.inference.clone();
            let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
            let model = member.model.clone();
            let name = member.name.clone();
            async move {
                let member_start = Instant::now();
                let resp = inference.chat(messages, &model, 0.7, 1024).await;
                let latency = member_start.elapsed();
                if resp.is_success() {
                    CouncilResponse {
                        member: name,
                        rating: extract_rating(&resp.content),
                        response: resp.content,
                        latency,
                        error: None,
                    }
                } else {
                    CouncilResponse {
                        member: name,
                        response: String::new(),
                        rating: None,
                        latency,
                        error: Some(format!("{:?}", resp.error)),
                    }
                }
            }
        });

        let responses: Vec<CouncilResponse> = futures::future::join_all(futures).await;

        let consensus = self.consensus(&responses, members);
        let ratings: Vec<f64> = responses.iter().filter_map(|r| r.rating).collect();
        let average_rating = if ratings.is_empty() { None } else { Some(ratings.iter().sum::<f64>() / ratings.len() as f64) };
        let agreement = compute_agreement(&ratings);

        CouncilResult { responses, consensus, average_rating, agreement, total_duration: start.elapsed() }
    }

    /// The response from the highest-weighted non-errored member; it does not vote.
    fn consensus(&self, responses: &[CouncilResponse], members: &[CouncilMember]) -> String {
        let best = responses
            .iter()
            .zip(members.iter())
            .filter(|(r, _)| r.error.is_none())
            .max_by(|(_, a), (_, b)| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((r, _)) => r.response.clone(),
            None if responses.is_empty() => "no responses".to_string(),
            None => "all members failed".to_string(),
        }
    }
}

/// ≥2 ratings: max(0, 1 - variance/10). Exactly 1 rating: 1.0. 0 ratings: 0.5.
fn compute_agreement(ratings: &[f64]) -> f64 {
    match ratings.len() {
        0 => 0.5,
        1 => 1.0,
        _ => {
            let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
            let variance = ratings.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratings.len() as f64;
            (1.0 - variance / 10.0).max(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_rating_handles_all_formats() {
        assert_eq!(extract_rating("Overall, 7.5/10"), Some(7.5));
        assert_eq!(extract_rating("rating: 8"), Some(8.0));
        assert_eq!(extract_rating("score=6.5"), Some(6.5));
        assert_eq!(extract_rating("I'd say 9 out of 10"), Some(9.0));
        assert_eq!(extract_rating("no numeric verdict here"), None);
    }

    #[test]
    fn single_member_agreement_is_one() {
        assert_eq!(compute_agreement(&[8.0]), 1.0);
    }

    #[test]
    fn no_ratings_agreement_is_uncertainty_default() {
        assert_eq!(compute_agreement(&[]), 0.5);
    }

    #[test]
    fn identical_ratings_have_zero_variance() {
        assert_eq!(compute_agreement(&[8.0, 8.0]), 1.0);
    }

    #[test]
    fn wide_spread_ratings_clamp_to_zero() {
        assert_eq!(compute_agreement(&[2.0, 10.0]), 0.0);
    }

    #[tokio::test]
    async fn unreachable_members_yield_all_members_failed_consensus() {
        let mut config = crate::config::Config::from_env();
        config.vllm_base_url = "http://127.0.0.1:1".to_string();
        let inference = Arc::new(InferenceClient::new(Arc::new(config)));
        let engine = CouncilEngine::new(inference);
        let members = vec![
            CouncilMember { name: "Coder".to_string(), model: "coder".to_string(), weight: 1.5, specialization: None },
            CouncilMember { name: "General".to_string(), model: "default".to_string(), weight: 1.0, specialization: None },
        ];
        let result = engine.query("review this diff", Some(CouncilPreset::CodeReview), &members).await;
        assert_eq!(result.consensus, "all members failed");
        assert!((0.0..=1.0).contains(&result.agreement));
    }
}
