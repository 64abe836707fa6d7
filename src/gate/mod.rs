//! Complexity Gate (§4.4): pure rule-based classifier, no LLM involved.

use once_cell_lite::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Agent kinds an Operator can specialize into (§4.6, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    File,
    Code,
    Web,
    Shell,
    Rag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub complexity: Complexity,
    pub suggested_agent: Option<AgentKind>,
}

/// Minimal `Lazy`-alike without pulling in `once_cell` as a crate: since we only need
/// process-lifetime regex tables, a small local module suffices.
mod once_cell_lite {
    use std::sync::OnceLock;

    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self { cell: OnceLock::new(), init }
        }
    }

    impl<T> std::ops::Deref for Lazy<T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

static TRIVIAL_SET: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^\s*(open youtube|open spotify|open browser)\s*$",
        r"(?i)what time is it",
        r"(?i)^\s*(quit|exit|goodbye|bye)\s*$",
        r"(?i)what('?s| is) the date",
        r"(?i)^\s*(hi|hello|hey)\s*$",
    ])
    .unwrap()
});

static COMPLEX_SET: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\brefactor\b",
        r"(?i)\brewrite\b",
        r"(?i)explain how",
        r"(?i)\banalyze\b",
        r"(?i)create (a )?new file",
        r"(?i)\bdesign\b.*\barchitecture\b",
        r"(?i)\bmigrate\b",
    ])
    .unwrap()
});

static SIMPLE_SET: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^\s*find\s+\S+",
        r"(?i)git status",
        r"(?i)^\s*(list|show)\s+files",
        r"(?i)what is in",
        r"(?i)^\s*cat\s+\S+",
    ])
    .unwrap()
});

static FILE_EXT_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"\.\w{1,8}\b").unwrap());
static CONJUNCTION_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?i)\b(and|then|also|und|dann)\b").unwrap());
static ENUMERATION_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"(?i)\b\d\.\s|\n\s*-\s").unwrap());

/// Classify `query` without invoking an LLM.
pub fn classify(query: &str) -> GateDecision {
    if query.trim().is_empty() {
        return GateDecision { complexity: Complexity::Moderate, suggested_agent: None };
    }

    if TRIVIAL_SET.is_match(query) {
        return GateDecision { complexity: Complexity::Trivial, suggested_agent: None };
    }
    if COMPLEX_SET.is_match(query) {
        return GateDecision { complexity: Complexity::Complex, suggested_agent: Some(AgentKind::Code) };
    }
    if SIMPLE_SET.is_match(query) {
        return GateDecision { complexity: Complexity::Simple, suggested_agent: Some(AgentKind::File) };
    }

    let ext_count = FILE_EXT_RE.find_iter(query).count();
    let has_conjunction = CONJUNCTION_RE.is_match(query);
    let has_enumeration = ENUMERATION_RE.is_match(query);

    if ext_count >= 2 || has_conjunction || has_enumeration {
        return GateDecision { complexity: Complexity::Moderate, suggested_agent: None };
    }

    GateDecision { complexity: Complexity::Moderate, suggested_agent: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_query_bypasses_llm() {
        let d = classify("what time is it?");
        assert_eq!(d.complexity, Complexity::Trivial);
        assert!(d.suggested_agent.is_none());
    }

    #[test]
    fn simple_find_routes_to_file_agent() {
        let d = classify("find foo.py");
        assert_eq!(d.complexity, Complexity::Simple);
        assert_eq!(d.suggested_agent, Some(AgentKind::File));
    }

    #[test]
    fn complex_refactor_routes_to_code_agent() {
        let d = classify("please refactor this module");
        assert_eq!(d.complexity, Complexity::Complex);
        assert_eq!(d.suggested_agent, Some(AgentKind::Code));
    }

    #[test]
    fn empty_query_is_moderate_with_no_suggestion() {
        let d = classify("");
        assert_eq!(d.complexity, Complexity::Moderate);
        assert!(d.suggested_agent.is_none());
    }

    #[test]
    fn multi_target_conjunction_is_moderate() {
        let d = classify("open main.rs and then run the tests");
        assert_eq!(d.complexity, Complexity::Moderate);
    }

    #[test]
    fn two_file_extensions_is_moderate() {
        let d = classify("compare config.yaml with config.json");
        assert_eq!(d.complexity, Complexity::Moderate);
    }
}
