use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use local_agency::config::Config;
use local_agency::eventbus::EventBus;
use local_agency::gate::AgentKind;
use local_agency::inference::InferenceClient;
use local_agency::metrics::MetricsRegistry;
use local_agency::operator::tools::ToolRegistry;
use local_agency::operator::Operator;
use local_agency::plan::Context;
use local_agency::registry::{Service, ServiceInfo, ServiceRegistry};
use local_agency::safety::SafetyGuard;
use local_agency::store::PersistentStore;
use local_agency::supervisor::Supervisor;
use local_agency::vram::VramGuard;
use local_agency::worker::MetaSearchClient;
use local_agency::TaskExecutor;

/// Registers the inference server as a monitored service: "starting" it is a
/// no-op (the server is external), health is a single chat-completions probe.
struct InferenceService {
    client: Arc<InferenceClient>,
}

#[async_trait]
impl Service for InferenceService {
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> Result<bool> {
        Ok(self.client.health().await)
    }
}

/// Registers the meta-search backend the same way.
struct SearchService {
    client: Arc<MetaSearchClient>,
}

#[async_trait]
impl Service for SearchService {
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> Result<bool> {
        Ok(self.client.health().await)
    }
}

fn build_operators(
    tools: Arc<ToolRegistry>,
    inference: Arc<InferenceClient>,
    events: Arc<EventBus>,
) -> HashMap<AgentKind, Arc<Operator>> {
    let mut operators = HashMap::new();
    for kind in [AgentKind::File, AgentKind::Code, AgentKind::Web, AgentKind::Shell, AgentKind::Rag] {
        operators.insert(kind, Arc::new(Operator::new(kind, tools.clone(), inference.clone(), events.clone())));
    }
    operators
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env());
    std::fs::create_dir_all(&config.data_dir)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry().with(env_filter).with(stdout_layer);

    // Kept alive for the process lifetime: dropping it stops the non-blocking writer thread.
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "local-agency.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
            registry.with(file_layer).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    };

    let inference = Arc::new(InferenceClient::new(config.clone()));
    let events = Arc::new(EventBus::new(config.event_queue_size));

    let store = match PersistentStore::open(&config.store_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "failed to open persistent store on disk; falling back to an in-memory store");
            Arc::new(PersistentStore::open_in_memory()?)
        }
    };

    let metrics = match MetricsRegistry::load(&config.metrics_path()) {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load metrics registry; starting fresh in-memory");
            Arc::new(MetricsRegistry::in_memory())
        }
    };

    let vram = Arc::new(VramGuard::new(config.vram_safe_percent));
    let observation = vram.refresh();
    info!(available_mb = observation.available_mb(), "VRAM guard initialized");

    let search = Arc::new(MetaSearchClient::new(&config.searxng_url));
    let safety = Arc::new(SafetyGuard::new());
    let tools = Arc::new(ToolRegistry::new(
        config.data_dir.to_string_lossy().to_string(),
        safety.clone(),
        search.clone(),
    ));

    let registry = Arc::new(ServiceRegistry::new());
    registry
        .register(
            ServiceInfo::new("inference", vec!["chat".to_string(), "generate".to_string()], "OpenAI-compatible local inference server"),
            Arc::new(InferenceService { client: inference.clone() }),
        )
        .await;
    registry
        .register(
            ServiceInfo::new("search", vec!["search".to_string()], "SearXNG-style meta-search backend"),
            Arc::new(SearchService { client: search.clone() }),
        )
        .await;
    let _ = registry.start("inference").await;
    let _ = registry.start("search").await;
    let _health_monitor = registry.spawn_health_monitor(Duration::from_secs(60));

    let operators = build_operators(tools, inference.clone(), events.clone());
    let supervisor = Arc::new(Supervisor::new(inference.clone(), config.clone()));
    let default_model = config.model_aliases.resolve("fast").to_string();
    let executor = Arc::new(TaskExecutor::new(supervisor, operators, default_model.clone()));

    if let Some(bind_addr) = config.http_bind.clone() {
        let facade_state = local_agency::server::AppState { executor: executor.clone(), events: events.clone() };
        tokio::spawn(async move {
            if let Err(e) = local_agency::server::serve(facade_state, &bind_addr).await {
                tracing::error!(error = %e, "HTTP facade stopped");
            }
        });
    }

    println!("\n{}", "=".repeat(60));
    println!("local-agency");
    println!("{}", "=".repeat(60));
    println!("Complexity Gate | Supervisor | Operators | Metrics | VRAM Guard");
    println!("{}\n", "=".repeat(60));
    println!("Commands: 'quit' | 'clear'\n");

    let session_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = store.start_session(&session_id) {
        tracing::warn!(error = %e, "failed to record session start");
    }
    let mut ctx = Context::new(std::env::current_dir()?.to_string_lossy().to_string(), session_id.clone());
    let mut completed: u32 = 0;
    let mut failed: u32 = 0;

    loop {
        print!("You: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let query = input.trim();
        if query.is_empty() {
            continue;
        }

        match query.to_lowercase().as_str() {
            "quit" | "exit" => {
                println!("\nGoodbye.\n");
                break;
            }
            "clear" => {
                ctx = Context::new(ctx.working_dir.clone(), ctx.session_id.clone());
                println!("\nContext cleared.\n");
                continue;
            }
            _ => {}
        }

        let filter_result = safety.check_input(query);
        if !filter_result.is_safe {
            println!("\nInput rejected: {}\n", filter_result.reasons.join("; "));
            continue;
        }

        let result = executor.execute(query, &ctx).await;
        ctx.push_history(query);
        ctx.set_last_output(result.output.clone(), local_agency::utils::TruncationPolicy::Tokens(500));

        let model = result.plan_used.as_ref().map(|p| p.model_tier.as_str()).unwrap_or(default_model.as_str());
        metrics.record_task(model, result.success, result.total_duration.as_millis() as u64, None);
        if result.success {
            completed += 1;
        } else {
            failed += 1;
            for error in &result.errors {
                let _ = store.learn_error_fix(error, "no known fix recorded yet", false);
            }
        }

        println!("\n{}\n", result.output);
        if !result.success {
            println!("(completed with errors: {:?})\n", result.errors);
        }
    }

    if let Err(e) = store.end_session(&session_id, "interactive session", completed, failed) {
        tracing::warn!(error = %e, "failed to record session end");
    }

    Ok(())
}
