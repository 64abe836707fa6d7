//! Worker Pool (§4.8): bounded fleet with availability scheduling, parallel fan-out,
//! and clone-on-fire replacement driven by the Metrics Registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{instrument, warn};

use super::{SearchClient, Worker, WorkerResult, WorkerTask, WorkerTaskKind};
use crate::inference::InferenceClient;
use crate::metrics::MetricsRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerPool {
    workers: RwLock<Vec<Arc<Worker>>>,
    inference: Arc<InferenceClient>,
    search: Arc<dyn SearchClient>,
    metrics: Arc<MetricsRegistry>,
    round_robin: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        small_model_catalogue: &[String],
        inference: Arc<InferenceClient>,
        search: Arc<dyn SearchClient>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let model = small_model_catalogue
                .get(i % small_model_catalogue.len().max(1))
                .cloned()
                .unwrap_or_else(|| "fast".to_string());
            workers.push(Arc::new(Worker::new(model, inference.clone(), search.clone())));
        }
        Self {
            workers: RwLock::new(workers),
            inference,
            search,
            metrics,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub async fn size(&self) -> usize {
        self.workers.read().await.len()
    }

    async fn find_idle(&self) -> Option<Arc<Worker>> {
        let workers = self.workers.read().await;
        workers.iter().find(|w| !w.is_busy()).cloned()
    }

    /// Picks the first idle worker, or polls every 100ms for up to 10s; on exhaustion
    /// returns a "no workers available" failure without invoking any external service.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn submit(&self, task: WorkerTask) -> WorkerResult {
        let deadline = tokio::time::Instant::now() + AVAILABILITY_TIMEOUT;
        loop {
            if let Some(worker) = self.find_idle().await {
                let result = worker.run(task).await;
                self.metrics.record_task(&worker.model, result.success, result.latency.as_millis() as u64, result.quality);
                if !result.success {
                    self.maybe_replace_fired_worker().await;
                }
                return result;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("worker pool exhausted after {:?}", AVAILABILITY_TIMEOUT);
                return WorkerResult {
                    task_id: task.id,
                    success: false,
                    result: String::new(),
                    error: Some("No workers available".to_string()),
                    latency: AVAILABILITY_TIMEOUT,
                    model_used: String::new(),
                    quality: None,
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Issues all submits concurrently; §8 P7 — result[i] corresponds to input[i].
    pub async fn submit_parallel(&self, prompts: Vec<String>, kind: WorkerTaskKind) -> Vec<WorkerResult> {
        let futures: Vec<_> = prompts
            .into_iter()
            .map(|p| self.submit(WorkerTask::new(kind, p)))
            .collect();
        futures::future::join_all(futures).await
    }

    /// Synthesizes N query variants and runs them as search tasks.
    pub async fn parallel_search(&self, query: &str, n: usize) -> Vec<WorkerResult> {
        let mut variants = vec![query.to_string()];
        let templates = [
            |q: &str| format!("what is {q}"),
            |q: &str| format!("{q} explained"),
            |q: &str| format!("{q} overview"),
            |q: &str| format!("{q} examples"),
        ];
        for t in templates.iter() {
            if variants.len() >= n {
                break;
            }
            variants.push(t(query));
        }
        variants.truncate(n.max(1));
        self.submit_parallel(variants, WorkerTaskKind::Search).await
    }

    /// After a failed task, check whether the worker's bound model should be fired and
    /// replaced with a fresh Worker bound to the current best-composite model.
    async fn maybe_replace_fired_worker(&self) {
        let Some(worst_model) = self.metrics.worst_fireable() else {
            return;
        };
        let mut workers = self.workers.write().await;
        let Some(idx) = workers.iter().position(|w| w.model == worst_model && !w.is_busy()) else {
            return;
        };
        let best = self.metrics.get_best_models(1, true);
        let Some(replacement_model) = best.into_iter().next() else {
            return;
        };
        if replacement_model == worst_model {
            return;
        }
        workers[idx] = Arc::new(Worker::new(replacement_model.clone(), self.inference.clone(), self.search.clone()));
        tracing::info!(fired = %worst_model, replacement = %replacement_model, "replaced fired worker");
    }

    pub async fn model_of_next(&self) -> Option<String> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return None;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[idx].model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::worker::StubSearch;

    fn make_pool(size: usize) -> WorkerPool {
        let config = Arc::new(Config::from_env());
        let inference = Arc::new(InferenceClient::new(config));
        let search = Arc::new(StubSearch(vec!["hit".to_string()]));
        let metrics = Arc::new(MetricsRegistry::in_memory());
        WorkerPool::new(size, &["fast".to_string()], inference, search, metrics)
    }

    #[tokio::test]
    async fn submit_parallel_preserves_order() {
        let pool = make_pool(4);
        let prompts: Vec<String> = (0..4).map(|i| format!("query {i}")).collect();
        let results = pool.submit_parallel(prompts.clone(), WorkerTaskKind::Search).await;
        assert_eq!(results.len(), 4);
        // All succeed against the stub search client regardless of dispatch order.
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn pool_exhaustion_is_first_class_failure() {
        // A pool of size 0 can never find an idle worker.
        let pool = make_pool(0);
        let result = pool.submit(WorkerTask::new(WorkerTaskKind::Search, "q")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No workers available"));
    }
}
