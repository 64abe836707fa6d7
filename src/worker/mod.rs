//! Worker (§4.8): single-purpose executor bound to one model identity.

pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::inference::{ChatMessage, InferenceClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTaskKind {
    Search,
    Summarize,
    Extract,
    Validate,
    General,
}

#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: String,
    pub kind: WorkerTaskKind,
    pub prompt: String,
    pub params: HashMap<String, Value>,
    pub timeout: Duration,
    pub priority: u8,
}

impl WorkerTask {
    pub fn new(kind: WorkerTaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            prompt: prompt.into(),
            params: HashMap::new(),
            timeout: Duration::from_secs(30),
            priority: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub task_id: String,
    pub success: bool,
    pub result: String,
    pub error: Option<String>,
    pub latency: Duration,
    pub model_used: String,
    pub quality: Option<f64>,
}

/// Abstraction over the meta-search endpoint, so the Worker's search path can be
/// exercised in tests without a live SearXNG instance.
#[async_trait::async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<String>>;
}

pub struct MetaSearchClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetaSearchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }

    /// Best-effort health probe: `/healthz`, falling back to a throwaway query
    /// against `/search` for metasearch backends that don't expose the former.
    pub async fn health(&self) -> bool {
        let healthz = self.http.get(format!("{}/healthz", self.base_url)).timeout(Duration::from_secs(5)).send().await;
        if matches!(&healthz, Ok(r) if r.status().is_success()) {
            return true;
        }
        self.search("test").await.is_ok()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Deserialize)]
struct SearchResultItem {
    title: String,
    url: String,
    content: String,
}

#[async_trait::async_trait]
impl SearchClient for MetaSearchClient {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<String>> {
        // The query traverses a raw URL even though `reqwest::RequestBuilder::query`
        // encodes its own pairs; percent-encode it ourselves so the SearXNG request
        // log line (built from the same query string elsewhere) stays consistent.
        let encoded = urlencoding::encode(query);
        let url = format!("{}/search?q={encoded}&format=json", self.base_url);
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .json::<SearchResponse>()
            .await?;
        Ok(resp
            .results
            .into_iter()
            .map(|r| format!("{} ({}): {}", r.title, r.url, html_escape::decode_html_entities(&r.content)))
            .collect())
    }
}

/// A Worker never retries on its own; it runs exactly one external call per task.
pub struct Worker {
    pub id: String,
    pub model: String,
    busy: AtomicBool,
    inference: Arc<InferenceClient>,
    search: Arc<dyn SearchClient>,
}

impl Worker {
    pub fn new(model: impl Into<String>, inference: Arc<InferenceClient>, search: Arc<dyn SearchClient>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            busy: AtomicBool::new(false),
            inference,
            search,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    #[instrument(skip(self, task), fields(worker_id = %self.id, model = %self.model, task_id = %task.id))]
    pub async fn run(&self, task: WorkerTask) -> WorkerResult {
        self.busy.store(true, Ordering::Release);
        let start = Instant::now();

        let outcome = match task.kind {
            WorkerTaskKind::Search => self.run_search(&task).await,
            _ => self.run_chat(&task).await,
        };

        self.busy.store(false, Ordering::Release);
        let latency = start.elapsed();

        match outcome {
            Ok(text) => WorkerResult {
                task_id: task.id,
                success: true,
                result: text,
                error: None,
                latency,
                model_used: self.model.clone(),
                quality: None,
            },
            Err(e) => WorkerResult {
                task_id: task.id,
                success: false,
                result: String::new(),
                error: Some(e.to_string()),
                latency,
                model_used: self.model.clone(),
                quality: None,
            },
        }
    }

    async fn run_search(&self, task: &WorkerTask) -> anyhow::Result<String> {
        let hits = tokio::time::timeout(task.timeout, self.search.search(&task.prompt))
            .await
            .map_err(|_| anyhow::anyhow!("search timed out after {:?}", task.timeout))??;
        Ok(hits.join("\n"))
    }

    async fn run_chat(&self, task: &WorkerTask) -> anyhow::Result<String> {
        let system = match task.kind {
            WorkerTaskKind::Summarize => Some("Summarize the following content concisely."),
            WorkerTaskKind::Extract => Some("Extract the requested structured information."),
            WorkerTaskKind::Validate => Some("Validate the following and report whether it is correct."),
            _ => None,
        };
        let messages = match system {
            Some(s) => vec![ChatMessage::system(s), ChatMessage::user(&task.prompt)],
            None => vec![ChatMessage::user(&task.prompt)],
        };
        let fut = self.inference.chat(messages, &self.model, 0.7, 1024);
        let resp = tokio::time::timeout(task.timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("worker task timed out after {:?}", task.timeout))?;
        if resp.is_success() {
            Ok(resp.content)
        } else {
            Err(anyhow::anyhow!("{}", resp.error.unwrap_or_else(|| "inference failed".to_string())))
        }
    }
}

#[cfg(test)]
pub(crate) struct StubSearch(pub Vec<String>);

#[cfg(test)]
#[async_trait::async_trait]
impl SearchClient for StubSearch {
    async fn search(&self, _query: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn worker_never_retries_and_clears_busy_flag() {
        let config = Arc::new(Config::from_env());
        let inference = Arc::new(InferenceClient::new(config));
        let search = Arc::new(StubSearch(vec!["hit one".to_string()]));
        let worker = Worker::new("fast", inference, search);

        let task = WorkerTask::new(WorkerTaskKind::Search, "rust ownership");
        let result = worker.run(task).await;
        assert!(result.success);
        assert_eq!(result.result, "hit one");
        assert!(!worker.is_busy());
    }
}
