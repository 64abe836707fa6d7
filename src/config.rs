//! Process-wide configuration, read once at startup (§10.2).
//!
//! Every component that needs a setting takes a `&Config` or `Arc<Config>` from
//! its constructor rather than re-reading the environment; `main` is the only
//! place `Config::from_env` is called.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Model-alias table: `default` / `coder` / `fast` / `tiny` -> concrete model identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAliases {
    pub aliases: HashMap<String, String>,
}

impl Default for ModelAliases {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("default".to_string(), "qwen2.5:14b".to_string());
        aliases.insert("coder".to_string(), "qwen2.5-coder:7b".to_string());
        aliases.insert("fast".to_string(), "llama3.2:3b".to_string());
        aliases.insert("tiny".to_string(), "llama3.2:1b".to_string());
        Self { aliases }
    }
}

impl ModelAliases {
    /// Resolve an alias to a concrete model identity. An unknown alias passes through unchanged.
    pub fn resolve<'a>(&'a self, alias: &'a str) -> &'a str {
        self.aliases.get(alias).map(|s| s.as_str()).unwrap_or(alias)
    }

    fn load_overrides(&mut self, path: &std::path::Path) {
        if let Ok(contents) = std::fs::read_to_string(path) {
            match serde_yaml::from_str::<HashMap<String, String>>(&contents) {
                Ok(overrides) => self.aliases.extend(overrides),
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to parse model alias overrides"),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub vllm_base_url: String,
    pub searxng_url: String,
    pub vllm_default_model: String,
    pub data_dir: PathBuf,
    pub vram_safe_percent: f64,
    pub event_queue_size: usize,
    pub model_aliases: ModelAliases,
    /// Bind address for the optional HTTP/WebSocket facade (§10.5); unset disables it.
    pub http_bind: Option<String>,
    /// Directory for the rolling file log (§10.1); unset means stdout-only logging.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Build configuration from the environment. Called exactly once, in `main`.
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("AGENCY_DATA_DIR", "./agency-data"));
        let mut model_aliases = ModelAliases::default();
        model_aliases.load_overrides(&data_dir.join("model_aliases.yaml"));

        Self {
            vllm_base_url: env_or("VLLM_BASE_URL", "http://localhost:8001"),
            searxng_url: env_or("SEARXNG_URL", "http://localhost:8888"),
            vllm_default_model: env_or("VLLM_DEFAULT_MODEL", "qwen2.5:14b"),
            data_dir,
            vram_safe_percent: env_or_parse("AGENCY_VRAM_SAFE_PERCENT", 90.0),
            event_queue_size: env_or_parse("AGENCY_EVENT_QUEUE_SIZE", 1000),
            model_aliases,
            http_bind: std::env::var("AGENCY_HTTP_BIND").ok(),
            log_dir: std::env::var("AGENCY_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("agency.sqlite3")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }

    pub fn benchmark_dir(&self) -> PathBuf {
        self.data_dir.join("benchmarks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_alias_passes_through() {
        let aliases = ModelAliases::default();
        assert_eq!(aliases.resolve("some-exotic-model"), "some-exotic-model");
    }

    #[test]
    fn known_alias_resolves() {
        let aliases = ModelAliases::default();
        assert_eq!(aliases.resolve("fast"), "llama3.2:3b");
    }
}
