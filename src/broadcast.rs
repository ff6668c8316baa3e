//! State-change fan-out with timed batching.
//!
//! Producers publish [`Message`]s; a single batching task coalesces the
//! high-frequency kinds and pushes serialized [`Envelope`]s to every
//! subscriber through a `tokio::sync::broadcast` channel.
//!
//! | Kind           | Delivery                                   |
//! |----------------|--------------------------------------------|
//! | `metrics`      | latest value per 500ms window              |
//! | `log`          | appended, flushed 500ms after the first    |
//! | `logs`         | appended in order, flushed per 1s window   |
//! | `llama_status` | immediately                                |
//! | `model_status` | immediately                                |
//!
//! Shutdown flushes whatever is still buffered before the task exits.

use crate::types::{LlamaServiceState, LogEntry, now_millis};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const METRICS_DEBOUNCE: Duration = Duration::from_millis(500);
pub const LOG_DEBOUNCE: Duration = Duration::from_millis(500);
pub const LOGS_BATCH_WINDOW: Duration = Duration::from_secs(1);

const INPUT_CAPACITY: usize = 1024;
const OUTPUT_CAPACITY: usize = 256;

/// Everything that can travel over the broadcast layer
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Metrics(Value),
    Logs(Vec<LogEntry>),
    Log(LogEntry),
    LlamaStatus(LlamaServiceState),
    ModelStatus(Value),
    /// Anything that did not parse as one of the above
    Unknown,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Metrics(_) => "metrics",
            Message::Logs(_) => "logs",
            Message::Log(_) => "log",
            Message::LlamaStatus(_) => "llama_status",
            Message::ModelStatus(_) => "model_status",
            Message::Unknown => "unknown",
        }
    }

    /// Parse a `{type, data}` object. Malformed input becomes [`Message::Unknown`].
    #[cfg(test)]
    pub fn from_value(value: &Value) -> Message {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Message::Unknown;
        };
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let parsed = match kind {
            "metrics" => Some(Message::Metrics(data)),
            "logs" => serde_json::from_value(data).ok().map(Message::Logs),
            "log" => serde_json::from_value(data).ok().map(Message::Log),
            "llama_status" => serde_json::from_value(data).ok().map(Message::LlamaStatus),
            "model_status" => Some(Message::ModelStatus(data)),
            _ => None,
        };
        parsed.unwrap_or(Message::Unknown)
    }
}

/// Wire shape of every pushed payload
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: &str, data: impl Serialize) -> Self {
        Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            timestamp: now_millis(),
        }
    }
}

/// Coalescing buffers, driven by explicit instants.
#[derive(Debug, Default)]
pub struct Batcher {
    metrics: Option<Value>,
    metrics_deadline: Option<Instant>,
    log: Vec<LogEntry>,
    log_deadline: Option<Instant>,
    logs: Vec<LogEntry>,
    logs_deadline: Option<Instant>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a message. Returns an envelope for kinds that are not batched.
    pub fn push(&mut self, message: Message, now: Instant) -> Option<Envelope> {
        match message {
            Message::Metrics(value) => {
                self.metrics = Some(value);
                self.metrics_deadline.get_or_insert(now + METRICS_DEBOUNCE);
                None
            }
            Message::Log(entry) => {
                self.log.push(entry);
                self.log_deadline.get_or_insert(now + LOG_DEBOUNCE);
                None
            }
            Message::Logs(entries) => {
                if entries.is_empty() {
                    return None;
                }
                self.logs.extend(entries);
                self.logs_deadline.get_or_insert(now + LOGS_BATCH_WINDOW);
                None
            }
            Message::LlamaStatus(state) => Some(Envelope::new("llama_status", state)),
            Message::ModelStatus(value) => Some(Envelope::new("model_status", value)),
            Message::Unknown => {
                trace!("Ignoring unknown broadcast message");
                None
            }
        }
    }

    /// Earliest pending flush
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.metrics_deadline, self.log_deadline, self.logs_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Envelopes whose window has elapsed at `now`
    pub fn due(&mut self, now: Instant) -> Vec<Envelope> {
        let mut out = Vec::new();
        if self.metrics_deadline.is_some_and(|d| d <= now) {
            out.extend(self.take_metrics());
        }
        if self.log_deadline.is_some_and(|d| d <= now) {
            out.extend(self.take_log());
        }
        if self.logs_deadline.is_some_and(|d| d <= now) {
            out.extend(self.take_logs());
        }
        out
    }

    /// Everything still buffered, regardless of windows
    pub fn flush_all(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        out.extend(self.take_metrics());
        out.extend(self.take_log());
        out.extend(self.take_logs());
        out
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_none() && self.log.is_empty() && self.logs.is_empty()
    }

    fn take_metrics(&mut self) -> Option<Envelope> {
        self.metrics_deadline = None;
        self.metrics
            .take()
            .map(|value| Envelope::new("metrics", value))
    }

    fn take_log(&mut self) -> Option<Envelope> {
        self.log_deadline = None;
        let log = std::mem::take(&mut self.log);
        match log.as_slice() {
            [] => None,
            [single] => Some(Envelope::new("log", single)),
            many => Some(Envelope::new("logs", many)),
        }
    }

    fn take_logs(&mut self) -> Option<Envelope> {
        self.logs_deadline = None;
        if self.logs.is_empty() {
            return None;
        }
        Some(Envelope::new("logs", std::mem::take(&mut self.logs)))
    }
}

struct BroadcasterInner {
    input: mpsc::Sender<Message>,
    output: broadcast::Sender<Arc<str>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

/// Handle to the batching task. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    /// Spawn the batching task. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (input, rx) = mpsc::channel(INPUT_CAPACITY);
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_batcher(rx, output.clone(), cancel.clone()));

        Self {
            inner: Arc::new(BroadcasterInner {
                input,
                output,
                cancel,
                task: Mutex::new(Some(task)),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a message. Dropped (and counted) if the input queue is full.
    pub fn publish(&self, message: Message) {
        match self.inner.input.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                metrics::counter!("llama_supervisor_broadcast_dropped_total").increment(1);
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Rate-limit logging: only log every 100th drop
                if dropped % 100 == 1 {
                    warn!(dropped, kind = message.kind(), "Broadcast queue full, dropping messages");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Broadcaster closed, message discarded");
            }
        }
    }

    /// Receive every envelope published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.inner.output.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.output.receiver_count()
    }

    /// Resolves once shutdown has started
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.inner.cancel.clone().cancelled_owned()
    }

    /// Flush pending batches and stop the batching task.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Broadcast task ended abnormally");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn send(output: &broadcast::Sender<Arc<str>>, envelope: Envelope) {
    match serde_json::to_string(&envelope) {
        // No subscribers is not an error
        Ok(json) => {
            let _ = output.send(Arc::from(json));
        }
        Err(e) => warn!(kind = %envelope.kind, error = %e, "Failed to serialize envelope"),
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<Message>,
    output: broadcast::Sender<Arc<str>>,
    cancel: CancellationToken,
) {
    let mut batcher = Batcher::new();

    loop {
        let deadline = batcher.next_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Some(envelope) = batcher.push(message, Instant::now()) {
                    send(&output, envelope);
                }
            }
            _ = sleep_until_opt(deadline) => {
                for envelope in batcher.due(Instant::now()) {
                    send(&output, envelope);
                }
            }
        }
    }

    // Messages published before shutdown still count
    while let Ok(message) = rx.try_recv() {
        if let Some(envelope) = batcher.push(message, Instant::now()) {
            send(&output, envelope);
        }
    }
    let pending = batcher.flush_all();
    debug!(flushed = pending.len(), "Broadcaster shutting down");
    for envelope in pending {
        send(&output, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new("info", "test", message)
    }

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_from_value_ignores_malformed() {
        assert_eq!(Message::from_value(&Value::Null), Message::Unknown);
        assert_eq!(Message::from_value(&json!({"data": 1})), Message::Unknown);
        assert_eq!(Message::from_value(&json!({"type": 7})), Message::Unknown);
        assert_eq!(Message::from_value(&json!({"type": "bogus"})), Message::Unknown);
        assert_eq!(
            Message::from_value(&json!({"type": "logs", "data": "not a list"})),
            Message::Unknown
        );
        assert_eq!(
            Message::from_value(&json!({"type": "metrics", "data": {"cpu": 1}})),
            Message::Metrics(json!({"cpu": 1}))
        );
    }

    #[test]
    fn test_batcher_metrics_latest_wins() {
        let start = Instant::now();
        let mut batcher = Batcher::new();
        assert!(batcher.push(Message::Metrics(json!(1)), start).is_none());
        assert!(
            batcher
                .push(Message::Metrics(json!(2)), start + Duration::from_millis(200))
                .is_none()
        );

        assert!(batcher.due(start + Duration::from_millis(499)).is_empty());
        let out = batcher.due(start + METRICS_DEBOUNCE);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "metrics");
        assert_eq!(out[0].data, json!(2));
        assert!(batcher.is_empty());
        assert!(batcher.next_deadline().is_none());
    }

    #[test]
    fn test_batcher_logs_ordered_append() {
        let start = Instant::now();
        let mut batcher = Batcher::new();
        batcher.push(Message::Logs(vec![entry("a"), entry("b")]), start);
        batcher.push(
            Message::Logs(vec![entry("c")]),
            start + Duration::from_millis(300),
        );

        assert!(batcher.due(start + Duration::from_millis(900)).is_empty());
        let out = batcher.due(start + LOGS_BATCH_WINDOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "logs");
        let messages: Vec<_> = out[0]
            .data
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["message"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_batcher_single_log_flushes_before_bulk() {
        let start = Instant::now();
        let mut batcher = Batcher::new();
        batcher.push(Message::Logs(vec![entry("bulk")]), start);
        batcher.push(Message::Log(entry("single")), start);

        assert_eq!(batcher.next_deadline(), Some(start + LOG_DEBOUNCE));
        let out = batcher.due(start + LOG_DEBOUNCE);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "log");
        assert_eq!(out[0].data["message"], "single");
    }

    #[test]
    fn test_batcher_status_is_immediate() {
        let mut batcher = Batcher::new();
        let out = batcher.push(
            Message::LlamaStatus(LlamaServiceState::default()),
            Instant::now(),
        );
        let envelope = out.unwrap();
        assert_eq!(envelope.kind, "llama_status");
        assert_eq!(envelope.data["status"], "initial");
        assert!(batcher.push(Message::Unknown, Instant::now()).is_none());
        assert!(batcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_metrics_within_window_deliver_latest() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(Message::Metrics(json!({"cpu": 10})));
        tokio::time::sleep(Duration::from_millis(200)).await;
        broadcaster.publish(Message::Metrics(json!({"cpu": 20})));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let envelope = parse(&rx.try_recv().unwrap());
        assert_eq!(envelope["type"], "metrics");
        assert_eq!(envelope["data"]["cpu"], 20);
        assert!(envelope["timestamp"].is_i64());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_logs_once() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(Message::Logs(vec![entry("one"), entry("two")]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        broadcaster.shutdown().await;

        let envelope = parse(&rx.try_recv().unwrap());
        assert_eq!(envelope["type"], "logs");
        assert_eq!(envelope["data"].as_array().unwrap().len(), 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // A second shutdown has nothing left to flush
        broadcaster.shutdown().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reaches_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.publish(Message::ModelStatus(json!({"model": "m", "status": "loaded"})));

        let first = parse(&a.recv().await.unwrap());
        let second = parse(&b.recv().await.unwrap());
        assert_eq!(first["type"], "model_status");
        assert_eq!(first, second);

        broadcaster.shutdown().await;
    }
}
