//! Data model for the Persistent Store (§3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Preference,
    Session,
    Skill,
    Error,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Session => "session",
            MemoryType::Skill => "skill",
            MemoryType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(MemoryType::Fact),
            "preference" => Some(MemoryType::Preference),
            "session" => Some(MemoryType::Session),
            "skill" => Some(MemoryType::Skill),
            "error" => Some(MemoryType::Error),
            _ => None,
        }
    }
}

/// id is content-derived: `sha256(type:key)` truncated to a hex string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub memory_type: MemoryType,
    pub key: String,
    pub value: String,
    pub importance: f32,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    pub fn content_id(memory_type: MemoryType, key: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(memory_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub language: String,
    pub device_label: String,
    pub vram_capacity_mb: u64,
    pub vram_safe_percent: f64,
    pub sidebar_autoload: bool,
    pub preferred_models: std::collections::HashMap<String, String>,
    pub concise_responses: bool,
    pub theme: String,
    pub keyboard_first: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            device_label: "default".to_string(),
            vram_capacity_mb: 24_000,
            vram_safe_percent: 90.0,
            sidebar_autoload: true,
            preferred_models: std::collections::HashMap::new(),
            concise_responses: false,
            theme: "dark".to_string(),
            keyboard_first: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub summary: String,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub error_signature: String,
    pub fix_pattern: String,
    pub success_count: u32,
    pub fail_count: u32,
    pub last_seen: DateTime<Utc>,
}

/// Normalize a raw error string into a signature key: lowercase, collapse whitespace,
/// strip anything that looks like a path, line number, or hex address (too specific
/// to generalize across occurrences of "the same" error).
pub fn normalize_error_signature(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let no_paths = regex::Regex::new(r"(/[\w./-]+|\b0x[0-9a-f]+\b|:\d+(:\d+)?)")
        .unwrap()
        .replace_all(&lower, "");
    let collapsed = no_paths.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_stable_for_same_type_and_key() {
        let a = MemoryEntry::content_id(MemoryType::Fact, "favorite_color");
        let b = MemoryEntry::content_id(MemoryType::Fact, "favorite_color");
        assert_eq!(a, b);
    }

    #[test]
    fn content_id_differs_across_types() {
        let a = MemoryEntry::content_id(MemoryType::Fact, "k");
        let b = MemoryEntry::content_id(MemoryType::Preference, "k");
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_strips_paths_and_line_numbers() {
        let raw = "Error in /home/user/src/main.rs:42:5 0xdeadbeef NullPointer";
        let sig = normalize_error_signature(raw);
        assert!(!sig.contains("/home"));
        assert!(!sig.contains("42"));
        assert!(!sig.contains("0xdeadbeef"));
        assert!(sig.contains("nullpointer"));
    }
}
