//! Tool registry backing the Operator's step execution (§4.6).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::safety::{CommandVerdict, SafetyGuard};
use crate::worker::SearchClient;

#[async_trait]
pub trait OperatorTool: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String>;
}

fn param_str<'a>(params: &'a HashMap<String, Value>, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required string parameter '{key}'"))
}

struct FindFiles {
    root: String,
}

#[async_trait]
impl OperatorTool for FindFiles {
    fn name(&self) -> &str {
        "find_files"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let pattern = param_str(params, "pattern")?.to_lowercase();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            walk(Path::new(&root), 0, &mut |path| {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.to_lowercase().contains(&pattern) {
                        matches.push(path.display().to_string());
                    }
                }
            });
            matches
        })
        .await
        .map_err(|e| e.to_string())
        .map(|matches| {
            if matches.is_empty() {
                "no matches found".to_string()
            } else {
                matches.join("\n")
            }
        })
    }
}

fn walk(dir: &Path, depth: u32, visit: &mut dyn FnMut(&Path)) {
    if depth > 8 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            walk(&path, depth + 1, visit);
        } else {
            visit(&path);
        }
    }
}

struct ReadFile;

#[async_trait]
impl OperatorTool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let path = param_str(params, "path")?.to_string();
        tokio::fs::read_to_string(&path).await.map_err(|e| format!("could not read {path}: {e}"))
    }
}

struct WriteFile;

#[async_trait]
impl OperatorTool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let path = param_str(params, "path")?.to_string();
        let content = param_str(params, "content").unwrap_or("").to_string();
        tokio::fs::write(&path, &content)
            .await
            .map(|_| format!("wrote {} bytes to {path}", content.len()))
            .map_err(|e| format!("could not write {path}: {e}"))
    }
}

struct ListFiles {
    root: String,
}

#[async_trait]
impl OperatorTool for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let dir = params.get("dir").and_then(|v| v.as_str()).unwrap_or(&self.root).to_string();
        let entries = tokio::fs::read_dir(&dir).await;
        let mut entries = entries.map_err(|e| format!("could not list {dir}: {e}"))?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

/// Runs an arbitrary shell command, gated by the safety guard, with stdout/stderr
/// captured (stdout truncated) and exit code reported.
struct RunCommand {
    safety: Arc<SafetyGuard>,
}

#[async_trait]
impl OperatorTool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let cmd = param_str(params, "cmd")?.to_string();
        let argv: Vec<String> = cmd.split_whitespace().map(|s| s.to_string()).collect();
        if argv.is_empty() {
            return Err("empty command".to_string());
        }
        match self.safety.check_command(&argv) {
            CommandVerdict::Deny(reason) => return Err(reason),
            CommandVerdict::RateLimited => return Err("rate limit exceeded for code execution".to_string()),
            CommandVerdict::Allow => {}
        }

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .await
            .map_err(|e| format!("failed to spawn command: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = crate::utils::truncate_text(&stdout, crate::utils::TruncationPolicy::Bytes(4096));
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()))
        }
    }
}

struct GitStatus;

#[async_trait]
impl OperatorTool for GitStatus {
    fn name(&self) -> &str {
        "git_status"
    }

    async fn execute(&self, _params: &HashMap<String, Value>) -> Result<String, String> {
        let output = tokio::process::Command::new("git")
            .args(["status", "--short"])
            .output()
            .await
            .map_err(|e| format!("failed to run git status: {e}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

struct WebSearch {
    search: Arc<dyn SearchClient>,
}

#[async_trait]
impl OperatorTool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn execute(&self, params: &HashMap<String, Value>) -> Result<String, String> {
        let query = param_str(params, "query")?;
        let hits = tokio::time::timeout(Duration::from_secs(15), self.search.search(query))
            .await
            .map_err(|_| "web search timed out".to_string())?
            .map_err(|e| e.to_string())?;
        Ok(hits.join("\n"))
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn OperatorTool>>,
}

impl ToolRegistry {
    pub fn new(root: impl Into<String>, safety: Arc<SafetyGuard>, search: Arc<dyn SearchClient>) -> Self {
        let root = root.into();
        let mut tools: HashMap<String, Box<dyn OperatorTool>> = HashMap::new();
        tools.insert("find_files".to_string(), Box::new(FindFiles { root: root.clone() }));
        tools.insert("read_file".to_string(), Box::new(ReadFile));
        tools.insert("write_file".to_string(), Box::new(WriteFile));
        tools.insert("list_files".to_string(), Box::new(ListFiles { root }));
        tools.insert("run_command".to_string(), Box::new(RunCommand { safety }));
        tools.insert("git_status".to_string(), Box::new(GitStatus));
        tools.insert("web_search".to_string(), Box::new(WebSearch { search }));
        Self { tools }
    }

    pub fn has(&self, action: &str) -> bool {
        self.tools.contains_key(action)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Resolves `action` against the registry; unknown actions fall back to
    /// `run_command` with `action` folded into the `cmd` parameter.
    pub async fn execute(&self, action: &str, params: &HashMap<String, Value>) -> Result<String, String> {
        if let Some(tool) = self.tools.get(action) {
            return tool.execute(params).await;
        }
        warn!(action = %action, "unknown tool action, falling back to shell command");
        let mut fallback_params = HashMap::new();
        fallback_params.insert("cmd".to_string(), Value::String(action.to_string()));
        self.tools.get("run_command").unwrap().execute(&fallback_params).await
    }

    /// Subset of tool names relevant to a given agent kind's system-prompt prefix.
    pub fn catalogue_for(&self, kind: crate::gate::AgentKind) -> Vec<&str> {
        use crate::gate::AgentKind::*;
        let allowed: &[&str] = match kind {
            File => &["find_files", "read_file", "write_file", "list_files"],
            Code => &["find_files", "read_file", "write_file", "run_command", "git_status"],
            Web => &["web_search"],
            Shell => &["run_command", "git_status", "list_files"],
            Rag => &["find_files", "read_file", "web_search"],
        };
        allowed.iter().copied().filter(|n| self.has(n)).collect()
    }
}

/// Normalizes common parameter-name mistakes from LLM tool selection output, e.g.
/// `search_pattern`/`query`/`name` -> `pattern` for `find_files`.
pub fn normalize_params(action: &str, mut params: HashMap<String, Value>) -> HashMap<String, Value> {
    if action == "find_files" && !params.contains_key("pattern") {
        for alias in ["search_pattern", "query", "name", "filename"] {
            if let Some(v) = params.remove(alias) {
                params.insert("pattern".to_string(), v);
                break;
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::MetaSearchClient;

    fn registry() -> ToolRegistry {
        ToolRegistry::new("/tmp", Arc::new(SafetyGuard::new()), Arc::new(MetaSearchClient::new("http://localhost:8888")))
    }

    #[test]
    fn normalize_params_maps_search_pattern_alias() {
        let mut params = HashMap::new();
        params.insert("search_pattern".to_string(), Value::String("foo.py".to_string()));
        let normalized = normalize_params("find_files", params);
        assert_eq!(normalized.get("pattern").and_then(|v| v.as_str()), Some("foo.py"));
    }

    #[tokio::test]
    async fn unknown_action_falls_back_to_shell() {
        let registry = registry();
        let mut params = HashMap::new();
        params.insert("cmd".to_string(), Value::String("true".to_string()));
        let result = registry.execute("not_a_real_tool", &params).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dangerous_run_command_is_rejected() {
        let registry = registry();
        let mut params = HashMap::new();
        params.insert("cmd".to_string(), Value::String("rm -rf /".to_string()));
        let result = registry.execute("run_command", &params).await;
        assert!(result.is_err());
    }

    #[test]
    fn catalogue_narrows_by_agent_kind() {
        let registry = registry();
        let shell_tools = registry.catalogue_for(crate::gate::AgentKind::Shell);
        assert!(shell_tools.contains(&"run_command"));
        assert!(!shell_tools.contains(&"web_search"));
    }
}
