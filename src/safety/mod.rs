//! Safety guard composing command heuristics, rate limiting, and content filtering
//! around the Operator's tool-execution path (§4.6).

pub mod command;
pub mod content_filter;
pub mod rate_limiter;

use std::sync::Mutex;

use content_filter::{ContentFilter, ContentFilterResult};
use rate_limiter::RateLimiter;

/// Outcome of a pre-execution safety check on a shell command.
#[derive(Debug, Clone)]
pub enum CommandVerdict {
    Allow,
    Deny(String),
    RateLimited,
}

pub struct SafetyGuard {
    content_filter: ContentFilter,
    rate_limiter: Mutex<RateLimiter>,
}

impl SafetyGuard {
    pub fn new() -> Self {
        Self { content_filter: ContentFilter::new(), rate_limiter: Mutex::new(RateLimiter::new()) }
    }

    /// Checked before the Operator's shell-command fallback executes a tokenized
    /// command line. Known-safe commands always pass; known-dangerous ones are denied
    /// outright; everything else is subject to the rate limiter only.
    pub fn check_command(&self, argv: &[String]) -> CommandVerdict {
        if command::is_dangerous_command(argv) {
            return CommandVerdict::Deny(format!("refusing to run a recognized dangerous command: {}", argv.join(" ")));
        }
        if !command::is_known_safe_command(argv) {
            let mut limiter = self.rate_limiter.lock().unwrap();
            if !limiter.check_tool("code_exec") {
                return CommandVerdict::RateLimited;
            }
        }
        CommandVerdict::Allow
    }

    pub fn check_input(&self, input: &str) -> ContentFilterResult {
        self.content_filter.check_input(input)
    }

    pub fn check_output(&self, output: &str) -> ContentFilterResult {
        self.content_filter.check_output(output)
    }

    pub fn check_web_search_allowed(&self) -> bool {
        self.rate_limiter.lock().unwrap().check_web_search()
    }

    pub fn check_llm_call_allowed(&self) -> bool {
        self.rate_limiter.lock().unwrap().check_tool("llm_call")
    }
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new()
    }
}
