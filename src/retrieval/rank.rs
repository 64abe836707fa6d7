//! Context ranking and budgeted selection (§3.2), grounded in
//! `original_source/ryx_pkg/rag/context_ranker.py`.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::utils::{approx_token_count, truncate_text, TruncationPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ContextType {
    Code,
    Doc,
    Text,
}

impl ContextType {
    fn as_str(&self) -> &'static str {
        match self {
            ContextType::Code => "code",
            ContextType::Doc => "doc",
            ContextType::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedContext {
    pub content: String,
    pub source: String,
    pub relevance: f64,
    pub tokens: usize,
    /// 1 = highest priority, 10 = lowest.
    pub priority: u8,
    pub context_type: ContextType,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub content: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub score: f64,
}

/// Selects and formats context for an LLM prompt within a token budget, reserving
/// headroom for the system prompt and response.
pub struct ContextRanker {
    max_tokens: usize,
    reserve_tokens: usize,
    contexts: Vec<RankedContext>,
}

impl ContextRanker {
    pub fn new(max_tokens: usize, reserve_tokens: usize) -> Self {
        Self { max_tokens, reserve_tokens, contexts: Vec::new() }
    }

    pub fn add_search_results(&mut self, results: &[SearchResult], priority: u8, context_type: ContextType) {
        for r in results {
            let tokens = approx_token_count(&r.content);
            let mut metadata = HashMap::new();
            metadata.insert("start_line".to_string(), Value::from(r.start_line));
            metadata.insert("end_line".to_string(), Value::from(r.end_line));
            metadata.insert("language".to_string(), Value::from(r.language.clone()));
            self.contexts.push(RankedContext {
                content: r.content.clone(),
                source: r.file_path.clone(),
                relevance: r.score,
                tokens,
                priority,
                context_type,
                metadata,
            });
        }
    }

    pub fn add_file(&mut self, path: &Path, priority: u8, max_lines: Option<usize>, relevance: f64) {
        let Ok(raw) = std::fs::read_to_string(path) else { return };
        let content = match max_lines {
            Some(n) => raw.lines().take(n).collect::<Vec<_>>().join("\n"),
            None => raw,
        };
        let tokens = approx_token_count(&content);
        let context_type = if is_code_file(path) { ContextType::Code } else { ContextType::Doc };
        let mut metadata = HashMap::new();
        metadata.insert("full_file".to_string(), Value::from(max_lines.is_none()));
        self.contexts.push(RankedContext {
            content,
            source: path.to_string_lossy().to_string(),
            relevance,
            tokens,
            priority,
            context_type,
            metadata,
        });
    }

    pub fn add_text(&mut self, text: &str, source: &str, priority: u8, relevance: f64, context_type: ContextType) {
        self.contexts.push(RankedContext {
            content: text.to_string(),
            source: source.to_string(),
            relevance,
            tokens: approx_token_count(text),
            priority,
            context_type,
            metadata: HashMap::new(),
        });
    }

    /// Sorts by (priority asc, relevance desc), greedily fills the budget, and lets
    /// priority-1/2 items spill into a truncated tail slot instead of being dropped.
    pub fn build_context(&self) -> (String, Vec<RankedContext>) {
        let available = self.max_tokens.saturating_sub(self.reserve_tokens);

        let mut sorted = self.contexts.clone();
        sorted.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then_with(|| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut selected = Vec::new();
        let mut used = 0usize;

        for mut ctx in sorted {
            if used + ctx.tokens <= available {
                used += ctx.tokens;
                selected.push(ctx);
            } else if ctx.priority <= 2 {
                let remaining = available.saturating_sub(used);
                if remaining > 100 {
                    ctx.content = truncate_text(&ctx.content, TruncationPolicy::Tokens(remaining));
                    ctx.tokens = remaining;
                    used += remaining;
                    selected.push(ctx);
                }
                break;
            }
        }

        (format_markdown(&selected), selected)
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    pub fn stats(&self) -> RankerStats {
        let total_tokens: usize = self.contexts.iter().map(|c| c.tokens).sum();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for c in &self.contexts {
            *by_type.entry(c.context_type.as_str().to_string()).or_insert(0) += 1;
        }
        let avg_relevance = if self.contexts.is_empty() {
            0.0
        } else {
            self.contexts.iter().map(|c| c.relevance).sum::<f64>() / self.contexts.len() as f64
        };
        RankerStats { total_contexts: self.contexts.len(), total_tokens, by_type, avg_relevance }
    }
}

#[derive(Debug, Clone)]
pub struct RankerStats {
    pub total_contexts: usize,
    pub total_tokens: usize,
    pub by_type: HashMap<String, usize>,
    pub avg_relevance: f64,
}

fn is_code_file(path: &Path) -> bool {
    const CODE_EXTENSIONS: &[&str] = &["py", "js", "ts", "tsx", "jsx", "go", "rs", "java", "cpp", "c", "rb", "php", "sh"];
    path.extension().and_then(|e| e.to_str()).map(|e| CODE_EXTENSIONS.contains(&e)).unwrap_or(false)
}

fn format_markdown(contexts: &[RankedContext]) -> String {
    let mut parts = Vec::new();
    for ctx in contexts {
        parts.push(format!("### {}", ctx.source));
        if let (Some(start), Some(end)) = (ctx.metadata.get("start_line"), ctx.metadata.get("end_line")) {
            parts.push(format!("Lines {start}-{end}"));
        }
        if matches!(ctx.context_type, ContextType::Code) {
            let language = ctx.metadata.get("language").and_then(|v| v.as_str()).unwrap_or("");
            parts.push(format!("```{language}"));
            parts.push(ctx.content.clone());
            parts.push("```".to_string());
        } else {
            parts.push(ctx.content.clone());
        }
        parts.push(String::new());
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(content: &str, score: f64) -> SearchResult {
        SearchResult {
            content: content.to_string(),
            file_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 3,
            language: "rust".to_string(),
            score,
        }
    }

    #[test]
    fn selects_within_budget_and_drops_overflow() {
        let mut ranker = ContextRanker::new(50, 0);
        ranker.add_search_results(&[result(&"x".repeat(400), 0.9)], 5, ContextType::Code);
        ranker.add_search_results(&[result(&"y".repeat(400), 0.5)], 5, ContextType::Code);
        let (_, selected) = ranker.build_context();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].content.starts_with('x'));
    }

    #[test]
    fn higher_priority_sorts_before_lower_relevance() {
        let mut ranker = ContextRanker::new(4000, 500);
        ranker.add_text("low priority but relevant", "a", 8, 0.99, ContextType::Text);
        ranker.add_text("high priority", "b", 1, 0.1, ContextType::Text);
        let (_, selected) = ranker.build_context();
        assert_eq!(selected[0].source, "b");
    }

    #[test]
    fn priority_one_item_gets_truncated_instead_of_dropped_when_over_budget() {
        let mut ranker = ContextRanker::new(60, 0);
        ranker.add_text(&"a".repeat(1000), "critical", 1, 1.0, ContextType::Text);
        let (_, selected) = ranker.build_context();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].content.len() < 1000);
    }

    #[test]
    fn stats_report_counts_by_type() {
        let mut ranker = ContextRanker::new(4000, 0);
        ranker.add_text("a", "s1", 5, 0.5, ContextType::Code);
        ranker.add_text("b", "s2", 5, 0.5, ContextType::Doc);
        let stats = ranker.stats();
        assert_eq!(stats.total_contexts, 2);
        assert_eq!(stats.by_type.get("code"), Some(&1));
        assert_eq!(stats.by_type.get("doc"), Some(&1));
    }
}
