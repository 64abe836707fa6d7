//! Event Bus (§4.12): typed pub/sub with fnmatch-style pattern subscriptions and a
//! request/response layer correlated by `reply_to`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    System,
    Service,
    Request,
    Response,
    Error,
    Log,
    Metric,
    Custom,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::System => "system",
            EventType::Service => "service",
            EventType::Request => "request",
            EventType::Response => "response",
            EventType::Error => "error",
            EventType::Log => "log",
            EventType::Metric => "metric",
            EventType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub source: String,
    pub data: HashMap<String, Value>,
    pub timestamp: String,
    pub target: Option<String>,
    pub reply_to: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            source: source.into(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
            target: None,
            reply_to: None,
        }
    }
}

/// A segment-wise fnmatch: `*` matches everything, `prefix.*` / `*.suffix` match on
/// dot-split segments, falling back to exact string equality otherwise.
fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value.split('.').next() == Some(prefix) || value.starts_with(&format!("{prefix}."));
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return value.ends_with(&format!(".{suffix}"));
    }
    false
}

struct Subscription {
    source_pattern: String,
    type_pattern: Option<String>,
    sender: broadcast::Sender<Event>,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EMIT_TIMEOUT: Duration = Duration::from_millis(200);

pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Event>>>,
    queue_capacity: usize,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to events whose source matches `source_pattern` and (if given) whose
    /// type matches `type_pattern`. Both support `*` wildcards with fnmatch semantics.
    pub async fn subscribe(
        &self,
        source_pattern: impl Into<String>,
        type_pattern: Option<String>,
    ) -> broadcast::Receiver<Event> {
        let (tx, rx) = broadcast::channel(self.queue_capacity);
        let mut subs = self.subscriptions.lock().await;
        subs.push(Subscription { source_pattern: source_pattern.into(), type_pattern, sender: tx });
        rx
    }

    /// Emit an event to every matching subscriber. A RESPONSE carrying a `reply_to`
    /// that matches a pending request resolves that request directly and is not
    /// additionally fanned out to pattern subscribers.
    #[instrument(skip(self, event), fields(event_id = %event.id, source = %event.source))]
    pub async fn emit(&self, event: Event) {
        self.emitted.fetch_add(1, Ordering::Relaxed);

        if event.event_type == EventType::Response {
            if let Some(reply_to) = event.reply_to.clone() {
                let mut pending = self.pending.lock().await;
                if let Some(sender) = pending.remove(&reply_to) {
                    let _ = sender.send(event);
                    return;
                }
            }
        }

        let subs = self.subscriptions.lock().await;
        let type_str = event.event_type.as_str();
        for sub in subs.iter() {
            if !glob_match(&sub.source_pattern, &event.source) {
                continue;
            }
            if let Some(tp) = &sub.type_pattern {
                if !glob_match(tp, type_str) {
                    continue;
                }
            }
            if sub.sender.receiver_count() == 0 {
                continue;
            }
            // broadcast::Sender::send is non-blocking; model the "full queue" case by
            // timing out a yield so a saturated channel doesn't stall the emitter.
            match tokio::time::timeout(EMIT_TIMEOUT, async { sub.sender.send(event.clone()) }).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {}
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(pattern = %sub.source_pattern, "event bus queue full, dropping delivery");
                }
            }
        }
    }

    /// Emit a REQUEST and await a correlated RESPONSE, with a per-call timeout.
    #[instrument(skip(self, data), fields(target = %target))]
    pub async fn request(&self, target: &str, data: HashMap<String, Value>) -> Result<Event, String> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut event = Event::new(EventType::Request, "bus", data);
        event.target = Some(target.to_string());
        event.reply_to = Some(correlation_id.clone());

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(correlation_id.clone(), tx);
        }

        self.emit(event).await;

        match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err("request sender dropped".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(format!("request to {target} timed out after {DEFAULT_REQUEST_TIMEOUT:?}"))
            }
        }
    }

    /// Respond to a pending request by correlation id.
    pub async fn respond(&self, reply_to: impl Into<String>, source: impl Into<String>, data: HashMap<String, Value>) {
        let mut event = Event::new(EventType::Response, source, data);
        event.reply_to = Some(reply_to.into());
        self.emit(event).await;
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_handles_wildcards() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("brain.*", "brain.vision"));
        assert!(glob_match("*.error", "brain.error"));
        assert!(!glob_match("brain.*", "vision.brain"));
        assert!(glob_match("exact", "exact"));
    }

    #[tokio::test]
    async fn fifo_delivery_per_source_type_pair() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("worker", Some("metric".to_string())).await;

        for i in 0..5 {
            let mut data = HashMap::new();
            data.insert("seq".to_string(), Value::from(i));
            bus.emit(Event::new(EventType::Metric, "worker", data)).await;
        }

        for i in 0..5 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.data.get("seq").and_then(|v| v.as_i64()), Some(i));
        }
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let bus = Arc::new(EventBus::new(16));
        let mut requests = bus.subscribe("bus", Some("request".to_string())).await;

        let bus_clone = bus.clone();
        let responder = tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            let reply_to = req.reply_to.clone().unwrap();
            let mut data = HashMap::new();
            data.insert("answer".to_string(), Value::from("42"));
            bus_clone.respond(reply_to, "responder", data).await;
        });

        let mut params = HashMap::new();
        params.insert("question".to_string(), Value::from("life"));
        let result = bus.request("responder", params).await;
        responder.await.unwrap();

        let resp = result.unwrap();
        assert_eq!(resp.data.get("answer").and_then(|v| v.as_str()), Some("42"));
    }

    #[tokio::test]
    async fn response_matching_pending_request_skips_pattern_fanout() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe("*", Some("response".to_string())).await;

        let mut data = HashMap::new();
        data.insert("seq".to_string(), Value::from(0));
        bus.emit(Event::new(EventType::Metric, "other", data)).await;

        let (tx, _rx) = oneshot::channel();
        bus.pending.lock().await.insert("corr-1".to_string(), tx);
        let mut event = Event::new(EventType::Response, "responder", HashMap::new());
        event.reply_to = Some("corr-1".to_string());
        bus.emit(event).await;

        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "response correlated to a pending request must not reach pattern subscribers");
    }

    #[tokio::test]
    async fn unmatched_response_reply_to_falls_back_to_pattern_fanout() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("*", None).await;
        let mut event = Event::new(EventType::Response, "ghost", HashMap::new());
        event.reply_to = Some("no-such-request".to_string());
        bus.emit(event).await;
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_ok(), "a response with no matching pending request is just a normal event");
    }
}
