//! Service Registry (§4.12): lifecycle tracking for in-process services, with a
//! periodic health monitor that demotes unresponsive services to UNHEALTHY.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: ServiceStatus,
    pub version: String,
    pub description: String,
    pub started_at: Option<String>,
    pub last_health_check: Option<String>,
    pub error: Option<String>,
    pub request_count: u64,
    pub error_count: u64,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, capabilities: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            status: ServiceStatus::Stopped,
            version: "1.0.0".to_string(),
            description: description.into(),
            started_at: None,
            last_health_check: None,
            error: None,
            request_count: 0,
            error_count: 0,
        }
    }
}

/// A registered service. Implementors own their own internal state; the Registry
/// only ever touches their lifecycle status through this trait.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct Registration {
    info: ServiceInfo,
    service: Arc<dyn Service>,
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Registration>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()) }
    }

    /// Registering an already-present name is a no-op; it does not overwrite.
    pub async fn register(&self, info: ServiceInfo, service: Arc<dyn Service>) -> bool {
        let mut services = self.services.write().await;
        if services.contains_key(&info.name) {
            return false;
        }
        let name = info.name.clone();
        services.insert(name, Registration { info, service });
        true
    }

    /// Refuses to start a service already starting or running.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        {
            let mut services = self.services.write().await;
            let reg = services
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("no such service: {name}"))?;
            if matches!(reg.info.status, ServiceStatus::Starting | ServiceStatus::Running) {
                anyhow::bail!("service {name} is already starting or running");
            }
            reg.info.status = ServiceStatus::Starting;
        }

        let service = {
            let services = self.services.read().await;
            services.get(name).unwrap().service.clone()
        };

        let result = service.start().await;

        let mut services = self.services.write().await;
        let reg = services.get_mut(name).unwrap();
        match result {
            Ok(()) => {
                reg.info.status = ServiceStatus::Running;
                reg.info.started_at = Some(chrono::Utc::now().to_rfc3339());
                reg.info.error = None;
                Ok(())
            }
            Err(e) => {
                reg.info.status = ServiceStatus::Error;
                reg.info.error = Some(e.to_string());
                warn!(service = %name, error = %e, "service failed to start");
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> anyhow::Result<()> {
        {
            let mut services = self.services.write().await;
            let reg = services
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("no such service: {name}"))?;
            reg.info.status = ServiceStatus::Stopping;
        }

        let service = {
            let services = self.services.read().await;
            services.get(name).unwrap().service.clone()
        };

        let result = service.stop().await;

        let mut services = self.services.write().await;
        let reg = services.get_mut(name).unwrap();
        match result {
            Ok(()) => {
                reg.info.status = ServiceStatus::Stopped;
                Ok(())
            }
            Err(e) => {
                reg.info.status = ServiceStatus::Error;
                reg.info.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn status(&self, name: &str) -> Option<ServiceInfo> {
        self.services.read().await.get(name).map(|r| r.info.clone())
    }

    pub async fn list(&self) -> Vec<ServiceInfo> {
        self.services.read().await.values().map(|r| r.info.clone()).collect()
    }

    pub async fn record_request(&self, name: &str, failed: bool) {
        if let Some(reg) = self.services.write().await.get_mut(name) {
            reg.info.request_count += 1;
            if failed {
                reg.info.error_count += 1;
            }
        }
    }

    /// Calls every running service's health check under a 5s timeout; demotes to
    /// UNHEALTHY on timeout or a negative result. Does not tear the service down.
    #[instrument(skip(self))]
    pub async fn run_health_sweep(&self) {
        let running: Vec<(String, Arc<dyn Service>)> = {
            let services = self.services.read().await;
            services
                .iter()
                .filter(|(_, r)| matches!(r.info.status, ServiceStatus::Running | ServiceStatus::Unhealthy))
                .map(|(name, r)| (name.clone(), r.service.clone()))
                .collect()
        };

        for (name, service) in running {
            let outcome = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, service.health_check()).await;
            let mut services = self.services.write().await;
            let Some(reg) = services.get_mut(&name) else { continue };
            reg.info.last_health_check = Some(chrono::Utc::now().to_rfc3339());
            match outcome {
                Ok(Ok(true)) => {
                    if reg.info.status == ServiceStatus::Unhealthy {
                        reg.info.status = ServiceStatus::Running;
                    }
                }
                Ok(Ok(false)) => {
                    reg.info.status = ServiceStatus::Unhealthy;
                    warn!(service = %name, "health check returned unhealthy");
                }
                Ok(Err(e)) => {
                    reg.info.status = ServiceStatus::Unhealthy;
                    reg.info.error = Some(e.to_string());
                    warn!(service = %name, error = %e, "health check errored");
                }
                Err(_) => {
                    reg.info.status = ServiceStatus::Unhealthy;
                    warn!(service = %name, "health check timed out after {:?}", HEALTH_CHECK_TIMEOUT);
                }
            }
        }
    }

    /// Spawns a periodic health-monitor loop. Returns the task handle so the caller
    /// can hold or abort it.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.run_health_sweep().await;
            }
        })
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyService {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Service for FlakyService {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> anyhow::Result<bool> {
            Ok(self.healthy.load(Ordering::Relaxed))
        }
    }

    #[tokio::test]
    async fn register_does_not_overwrite_existing() {
        let registry = ServiceRegistry::new();
        let svc = Arc::new(FlakyService { healthy: AtomicBool::new(true) });
        let first = registry.register(ServiceInfo::new("brain", vec![], "desc"), svc.clone()).await;
        let second = registry.register(ServiceInfo::new("brain", vec![], "different desc"), svc).await;
        assert!(first);
        assert!(!second);
        assert_eq!(registry.status("brain").await.unwrap().description, "desc");
    }

    #[tokio::test]
    async fn concurrent_start_is_refused() {
        let registry = Arc::new(ServiceRegistry::new());
        let svc = Arc::new(FlakyService { healthy: AtomicBool::new(true) });
        registry.register(ServiceInfo::new("brain", vec![], "desc"), svc).await;
        registry.start("brain").await.unwrap();
        let second = registry.start("brain").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn health_sweep_demotes_unhealthy_service() {
        let registry = Arc::new(ServiceRegistry::new());
        let svc = Arc::new(FlakyService { healthy: AtomicBool::new(false) });
        registry.register(ServiceInfo::new("vision", vec![], "desc"), svc).await;
        registry.start("vision").await.unwrap();
        registry.run_health_sweep().await;
        let status = registry.status("vision").await.unwrap();
        assert_eq!(status.status, ServiceStatus::Unhealthy);
    }
}
