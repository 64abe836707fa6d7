//! VRAM Guard (§4.2): admission controller for GPU memory.
//!
//! Observes GPU memory via a platform probe and caches the observation until the
//! next explicit [`VramGuard::refresh`]. On a host with no discoverable GPU, the
//! guard degrades to treating system RAM as the ceiling, logging the degradation
//! once rather than panicking for lack of a GPU.

use std::collections::HashMap;
use std::process::Command;
use std::sync::RwLock;

use regex::Regex;
use sysinfo::System;
use tracing::{instrument, warn};

use crate::error::VramDecisionKind;

#[derive(Debug, Clone, Copy)]
pub struct VramObservation {
    pub total_mb: u64,
    pub used_mb: u64,
    /// True when this observation came from a real GPU probe, false when it
    /// degraded to treating system RAM as the ceiling.
    pub is_gpu: bool,
}

impl VramObservation {
    pub fn available_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }
}

#[derive(Debug, Clone)]
pub enum LoadDecision {
    Load,
    UnloadFirst { candidates: Vec<String> },
    OffloadCpu,
    Refuse,
}

impl LoadDecision {
    pub fn kind(&self) -> VramDecisionKind {
        match self {
            LoadDecision::Load => VramDecisionKind::Load,
            LoadDecision::UnloadFirst { .. } => VramDecisionKind::UnloadFirst,
            LoadDecision::OffloadCpu => VramDecisionKind::OffloadCpu,
            LoadDecision::Refuse => VramDecisionKind::Refuse,
        }
    }
}

/// A currently-loaded model, as reported by the inference server's own bookkeeping.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub name: String,
    pub estimated_mb: u64,
}

pub struct VramGuard {
    safe_percent: f64,
    cached: RwLock<Option<VramObservation>>,
    exact_sizes: HashMap<String, u64>,
    size_regex: Regex,
    degraded_logged: std::sync::atomic::AtomicBool,
}

impl VramGuard {
    pub fn new(safe_percent: f64) -> Self {
        Self {
            safe_percent,
            cached: RwLock::new(None),
            exact_sizes: HashMap::new(),
            // Tight match against model-name parameter markers like "-7b", ":13.5b", "_70b".
            size_regex: Regex::new(r"(?i)[:\-_](\d+(?:\.\d+)?)b\b").unwrap(),
            degraded_logged: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_exact_size(mut self, model: impl Into<String>, mb: u64) -> Self {
        self.exact_sizes.insert(model.into(), mb);
        self
    }

    /// Force a fresh observation, replacing the cache.
    #[instrument(skip(self))]
    pub fn refresh(&self) -> VramObservation {
        let obs = self.probe();
        *self.cached.write().unwrap() = Some(obs);
        obs
    }

    /// The cached observation, probing for the first time if none exists yet.
    pub fn observation(&self) -> VramObservation {
        if let Some(obs) = *self.cached.read().unwrap() {
            return obs;
        }
        self.refresh()
    }

    fn probe(&self) -> VramObservation {
        if let Some(obs) = self.probe_nvidia_smi() {
            return obs;
        }
        if let Some(obs) = self.probe_sysfs() {
            return obs;
        }
        if !self.degraded_logged.swap(true, std::sync::atomic::Ordering::Relaxed) {
            warn!("no GPU discoverable via sysfs or external tool; degrading to system RAM as the VRAM ceiling");
        }
        let mut sys = System::new_all();
        sys.refresh_memory();
        VramObservation {
            total_mb: sys.total_memory() / 1024 / 1024,
            used_mb: sys.used_memory() / 1024 / 1024,
            is_gpu: false,
        }
    }

    fn probe_nvidia_smi(&self) -> Option<VramObservation> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=memory.total,memory.used", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let first_line = text.lines().next()?;
        let mut parts = first_line.split(',').map(|s| s.trim());
        let total: u64 = parts.next()?.parse().ok()?;
        let used: u64 = parts.next()?.parse().ok()?;
        Some(VramObservation { total_mb: total, used_mb: used, is_gpu: true })
    }

    fn probe_sysfs(&self) -> Option<VramObservation> {
        // AMDGPU-style sysfs layout: /sys/class/drm/card0/device/mem_info_vram_{total,used}
        let base = std::path::Path::new("/sys/class/drm/card0/device");
        let total = std::fs::read_to_string(base.join("mem_info_vram_total")).ok()?;
        let used = std::fs::read_to_string(base.join("mem_info_vram_used")).ok()?;
        let total: u64 = total.trim().parse().ok()?;
        let used: u64 = used.trim().parse().ok()?;
        Some(VramObservation {
            total_mb: total / 1024 / 1024,
            used_mb: used / 1024 / 1024,
            is_gpu: true,
        })
    }

    /// Estimate a model's footprint in MB: exact table, then regex-derived tier, then a flat default.
    pub fn estimate_footprint_mb(&self, model: &str) -> u64 {
        if let Some(&mb) = self.exact_sizes.get(model) {
            return mb;
        }
        if let Some(caps) = self.size_regex.captures(model) {
            if let Ok(b) = caps[1].parse::<f64>() {
                return tier_for_params(b);
            }
        }
        5000
    }

    /// Decide whether `model` can be loaded given currently-loaded models.
    #[instrument(skip(self, loaded))]
    pub fn can_load(&self, model: &str, loaded: &[LoadedModel]) -> LoadDecision {
        if loaded.iter().any(|m| m.name == model) {
            return LoadDecision::Load;
        }

        let obs = self.observation();
        let safe_ceiling = (obs.total_mb as f64 * self.safe_percent / 100.0) as u64;
        let used_by_loaded: u64 = loaded.iter().map(|m| m.estimated_mb).sum();
        let estimate = self.estimate_footprint_mb(model);

        let safe_available = safe_ceiling.saturating_sub(used_by_loaded);
        if estimate <= safe_available {
            return LoadDecision::Load;
        }

        // Can we free enough by unloading the smallest currently-loaded models first?
        let mut sorted: Vec<&LoadedModel> = loaded.iter().collect();
        sorted.sort_by_key(|m| m.estimated_mb);
        let mut freed = 0u64;
        let mut candidates = Vec::new();
        for m in sorted {
            if safe_available + freed >= estimate {
                break;
            }
            freed += m.estimated_mb;
            candidates.push(m.name.clone());
        }
        if safe_available + freed >= estimate {
            return LoadDecision::UnloadFirst { candidates };
        }

        if estimate <= obs.total_mb.saturating_sub(used_by_loaded) {
            return LoadDecision::OffloadCpu;
        }

        LoadDecision::Refuse
    }
}

fn tier_for_params(b: f64) -> u64 {
    if b >= 13.0 {
        10_000
    } else if b >= 10.0 {
        8_000
    } else if b >= 6.0 {
        5_000
    } else if b >= 2.5 {
        3_000
    } else if b >= 1.0 {
        1_500
    } else {
        1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_tiers_from_model_name() {
        let guard = VramGuard::new(90.0);
        assert_eq!(guard.estimate_footprint_mb("llama3:70b"), 10_000);
        assert_eq!(guard.estimate_footprint_mb("qwen2.5:14b"), 10_000);
        assert_eq!(guard.estimate_footprint_mb("qwen2.5:7b"), 5_000);
        assert_eq!(guard.estimate_footprint_mb("llama3.2:3b"), 3_000);
        assert_eq!(guard.estimate_footprint_mb("llama3.2:1b"), 1_500);
        assert_eq!(guard.estimate_footprint_mb("some-custom-name"), 5000);
    }

    #[test]
    fn exact_table_beats_regex() {
        let guard = VramGuard::new(90.0).with_exact_size("qwen2.5:7b", 4096);
        assert_eq!(guard.estimate_footprint_mb("qwen2.5:7b"), 4096);
    }

    #[test]
    fn already_loaded_model_returns_load_immediately() {
        let guard = VramGuard::new(0.0); // zero ceiling would otherwise refuse everything
        let loaded = vec![LoadedModel { name: "qwen2.5:7b".into(), estimated_mb: 5000 }];
        assert!(matches!(guard.can_load("qwen2.5:7b", &loaded), LoadDecision::Load));
    }

    #[test]
    fn refuses_when_nothing_fits() {
        // Force a deterministic tiny ceiling via an exact size and a 0% safe percent.
        let guard = VramGuard::new(0.0);
        // total_mb could be anything; 0% safe ceiling means safe_available is ~0 for any host.
        let decision = guard.can_load("impossible:900b", &[]);
        assert!(matches!(decision, LoadDecision::Refuse | LoadDecision::OffloadCpu));
    }
}
