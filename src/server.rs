//! HTTP/WebSocket facade (§10.5 supplementary feature): an external collaborator
//! that lets a browser or another process drive the Task Executor the same way the
//! REPL in `main` does, plus a live feed of the Event Bus. Not part of the core
//! request path — `main` only binds this when `AGENCY_HTTP_BIND` is set.
//!
//! Grounded in `examples/ProdByBuddha-rust_agency/src/server.rs`'s `AppState` /
//! `ws_handler` / `chat_completions` shape, re-pointed at the Task Executor instead
//! of a raw LLM provider.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::eventbus::EventBus;
use crate::plan::Context;
use crate::TaskExecutor;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<TaskExecutor>,
    pub events: Arc<EventBus>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessageWire>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessageWire {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    steps_completed: u32,
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Choice {
    message: ChatMessageWire,
}

struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// Builds the router; binding and serving is left to the caller so tests can
/// exercise routes without opening a socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/events", get(events_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "HTTP facade listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[instrument(skip(state, req))]
async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatCompletionRequest>) -> Result<impl IntoResponse, ApiError> {
    let query = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
    let session_id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ctx = Context::new(".", session_id);

    let result = state.executor.execute(&query, &ctx).await;
    Ok(Json(ChatCompletionResponse {
        choices: vec![Choice { message: ChatMessageWire { role: "assistant".to_string(), content: result.output } }],
        steps_completed: result.steps_completed,
        errors: result.errors,
    }))
}

/// Streams every Event Bus event matching `*` to the socket as JSON text frames.
async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let rx = state.events.subscribe("*", None).await;
        let mut events = tokio_stream::wrappers::BroadcastStream::new(rx);
        let (mut sender, mut receiver) = socket.split();

        let forward = tokio::spawn(async move {
            while let Some(item) = events.next().await {
                let Ok(event) = item else { continue }; // lagged: drop and keep streaming
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Drain the client's side; this facade is read-only from its perspective.
        while let Some(Ok(_)) = receiver.next().await {}
        forward.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gate::AgentKind;
    use crate::inference::InferenceClient;
    use crate::operator::tools::ToolRegistry;
    use crate::operator::Operator;
    use crate::safety::SafetyGuard;
    use crate::supervisor::Supervisor;
    use crate::worker::MetaSearchClient;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Arc::new(Config::from_env());
        let inference = Arc::new(InferenceClient::new(config.clone()));
        let events = Arc::new(EventBus::new(64));
        let tools = Arc::new(ToolRegistry::new(
            "/tmp",
            Arc::new(SafetyGuard::new()),
            Arc::new(MetaSearchClient::new("http://localhost:8888")),
        ));
        let mut operators = HashMap::new();
        for kind in [AgentKind::File, AgentKind::Code, AgentKind::Web, AgentKind::Shell, AgentKind::Rag] {
            operators.insert(kind, Arc::new(Operator::new(kind, tools.clone(), inference.clone(), events.clone())));
        }
        let supervisor = Arc::new(Supervisor::new(inference, config));
        let executor = Arc::new(TaskExecutor::new(supervisor, operators, "fast"));
        AppState { executor, events }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = router(test_state());
        let req = axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completions_returns_trivial_answer_without_a_live_model() {
        let app = router(test_state());
        let body = serde_json::json!({ "messages": [{ "role": "user", "content": "hello" }] });
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
