//! Metrics Registry (§4.10): per-model quality/latency/success tracking and fleet adjustment.
//!
//! State is persisted to a JSON file guarded by a single-writer lock (`fs2`), with
//! quality history truncated to the last 50 samples.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::instrument;

const QUALITY_RETAIN: usize = 50;
const QUALITY_AVG_WINDOW: usize = 20;
const FIRE_MIN_TASKS: u32 = 10;
const FIRE_SUCCESS_RATE: f64 = 0.5;
const FIRE_QUALITY: f64 = 3.0;
const PROMOTE_MIN_TASKS: u32 = 20;
const PROMOTE_SUCCESS_RATE: f64 = 0.9;
const PROMOTE_QUALITY: f64 = 7.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelStats {
    pub total_tasks: u32,
    pub successful_tasks: u32,
    pub failed_tasks: u32,
    pub total_latency_ms: u64,
    pub quality_scores: Vec<f64>,
    pub last_used: Option<DateTime<Utc>>,
    pub fired: bool,
    pub promoted: bool,
}

impl ModelStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / self.total_tasks as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.total_tasks as f64
    }

    /// Average over the most recent `QUALITY_AVG_WINDOW` samples.
    pub fn avg_quality(&self) -> f64 {
        if self.quality_scores.is_empty() {
            return 0.0;
        }
        let window_start = self.quality_scores.len().saturating_sub(QUALITY_AVG_WINDOW);
        let window = &self.quality_scores[window_start..];
        window.iter().sum::<f64>() / window.len() as f64
    }

    pub fn composite_score(&self) -> f64 {
        let latency_penalty = (self.avg_latency_ms() / 5000.0).clamp(0.0, 1.0);
        0.6 * self.avg_quality() + 0.3 * self.success_rate() + 0.1 * (1.0 - latency_penalty)
    }

    fn record(&mut self, success: bool, latency_ms: u64, quality: Option<f64>) {
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        self.total_latency_ms += latency_ms;
        if let Some(q) = quality {
            self.quality_scores.push(q);
            if self.quality_scores.len() > QUALITY_RETAIN {
                let excess = self.quality_scores.len() - QUALITY_RETAIN;
                self.quality_scores.drain(..excess);
            }
        }
        self.last_used = Some(Utc::now());
    }

    fn apply_eviction_rules(&mut self) {
        if self.total_tasks >= FIRE_MIN_TASKS
            && (self.success_rate() < FIRE_SUCCESS_RATE || self.avg_quality() < FIRE_QUALITY)
        {
            self.fired = true;
        }
        if self.total_tasks >= PROMOTE_MIN_TASKS
            && self.success_rate() > PROMOTE_SUCCESS_RATE
            && self.avg_quality() > PROMOTE_QUALITY
        {
            self.promoted = true;
        }
    }
}

pub struct MetricsRegistry {
    path: PathBuf,
    state: Mutex<HashMap<String, ModelStats>>,
}

impl MetricsRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let file = std::fs::File::open(path)?;
            file.lock_shared()?;
            let contents = std::fs::read_to_string(path)?;
            FileExt::unlock(&file)?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path: path.to_path_buf(), state: Mutex::new(state) })
    }

    pub fn in_memory() -> Self {
        Self { path: PathBuf::from("/dev/null"), state: Mutex::new(HashMap::new()) }
    }

    #[instrument(skip(self))]
    pub fn record_task(&self, model: &str, success: bool, latency_ms: u64, quality: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        let stats = state.entry(model.to_string()).or_default();
        stats.record(success, latency_ms, quality);
        stats.apply_eviction_rules();
        drop(state);
        self.persist();
    }

    pub fn get(&self, model: &str) -> Option<ModelStats> {
        self.state.lock().unwrap().get(model).cloned()
    }

    pub fn all(&self) -> HashMap<String, ModelStats> {
        self.state.lock().unwrap().clone()
    }

    /// Models ranked by composite score, best first.
    pub fn get_best_models(&self, count: usize, exclude_fired: bool) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut models: Vec<(&String, &ModelStats)> = state
            .iter()
            .filter(|(_, s)| !exclude_fired || !s.fired)
            .collect();
        models.sort_by(|a, b| b.1.composite_score().partial_cmp(&a.1.composite_score()).unwrap());
        models.into_iter().take(count).map(|(name, _)| name.clone()).collect()
    }

    /// The worst performer by (success rate, avg quality) ascending, if it has
    /// enough samples and fails the fire threshold.
    pub fn worst_fireable(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .iter()
            .filter(|(_, s)| s.total_tasks >= FIRE_MIN_TASKS && s.fired)
            .min_by(|a, b| {
                (a.1.success_rate(), a.1.avg_quality())
                    .partial_cmp(&(b.1.success_rate(), b.1.avg_quality()))
                    .unwrap()
            })
            .map(|(name, _)| name.clone())
    }

    fn persist(&self) {
        if self.path == Path::new("/dev/null") {
            return;
        }
        let state = self.state.lock().unwrap();
        if let Ok(json) = serde_json::to_string_pretty(&*state) {
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(file) = std::fs::File::create(&self.path) {
                if file.lock_exclusive().is_ok() {
                    use std::io::Write;
                    let mut f = &file;
                    let _ = f.write_all(json.as_bytes());
                    let _ = FileExt::unlock(&file);
                }
            }
        }
    }
}
