//! Call timeline: Fire-and-forget observability for the proxy path.
//!
//! Proxied calls, discovery passes and connection changes are pushed onto a
//! bounded queue with `try_send`; a dedicated worker thread drains it into
//! one or more [`TimelineSink`]s. When the queue is full the newest event is
//! dropped and counted. Nothing here can fail a tool call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod sqlite;

pub use sqlite::SqliteTimelineSink;

/// Default queue depth between the proxy path and the worker.
pub const QUEUE_CAPACITY: usize = 1024;

/// Upper bound on how long `flush` waits for the worker.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Failures inside a sink. Logged by the worker, never surfaced to callers.
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("timeline database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("timeline serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeline io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Started,
    Succeeded,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Started => "started",
            CallStatus::Succeeded => "succeeded",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => CallStatus::Succeeded,
            "failed" => CallStatus::Failed,
            _ => CallStatus::Started,
        }
    }
}

/// Lifecycle record for one proxied call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCallEvent {
    pub call_id: String,
    pub tool_name: String,
    pub server_name: String,
    pub original_name: String,
    pub parameters: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: CallStatus,
}

impl ProxyCallEvent {
    fn finish(
        &mut self,
        end_time: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let elapsed = end_time.signed_duration_since(self.start_time);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
        self.end_time = Some(end_time);
        self.status = if error.is_some() {
            CallStatus::Failed
        } else {
            CallStatus::Succeeded
        };
        self.result = result;
        self.error = error;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub server_name: String,
    pub tools_discovered: usize,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub server_name: String,
    /// `connect`, `reconnect`, `disconnect`, `health_check`, ...
    pub event_type: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What sinks receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEvent {
    CallStarted(ProxyCallEvent),
    CallFinished(ProxyCallEvent),
    Discovery(DiscoveryEvent),
    Connection(ConnectionEvent),
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Destination for timeline events. Runs on the worker thread.
pub trait TimelineSink: Send {
    fn name(&self) -> &str;

    fn record(&mut self, event: &TimelineEvent) -> Result<(), TimelineError>;
}

/// Writes every event to `tracing` under the `mcp_proxy::timeline` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TimelineSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&mut self, event: &TimelineEvent) -> Result<(), TimelineError> {
        match event {
            TimelineEvent::CallStarted(call) => tracing::debug!(
                target: "mcp_proxy::timeline",
                call_id = %call.call_id,
                tool = %call.tool_name,
                server = %call.server_name,
                "tool call started"
            ),
            TimelineEvent::CallFinished(call) => tracing::info!(
                target: "mcp_proxy::timeline",
                call_id = %call.call_id,
                tool = %call.tool_name,
                server = %call.server_name,
                status = call.status.as_str(),
                duration_ms = call.duration_ms.unwrap_or_default(),
                error = call.error.as_deref().unwrap_or(""),
                "tool call finished"
            ),
            TimelineEvent::Discovery(d) => tracing::info!(
                target: "mcp_proxy::timeline",
                server = %d.server_name,
                tools = d.tools_discovered,
                success = d.success,
                error = d.error.as_deref().unwrap_or(""),
                "discovery"
            ),
            TimelineEvent::Connection(c) => tracing::info!(
                target: "mcp_proxy::timeline",
                server = %c.server_name,
                event = %c.event_type,
                success = c.success,
                error = c.error.as_deref().unwrap_or(""),
                "connection"
            ),
        }
        Ok(())
    }
}

/// Keeps events in memory; handy for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TimelineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TimelineSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn record(&mut self, event: &TimelineEvent) -> Result<(), TimelineError> {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

// ─── Logger ──────────────────────────────────────────────────────────────────

enum Command {
    Start(ProxyCallEvent),
    End {
        call_id: String,
        end_time: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    Record(TimelineEvent),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front end to the timeline worker.
///
/// A disabled logger accepts every call and does nothing.
pub struct TimelineLogger {
    sender: RwLock<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl TimelineLogger {
    /// Start a worker thread feeding `sinks`.
    pub fn new(sinks: Vec<Box<dyn TimelineSink>>) -> Self {
        Self::with_capacity(sinks, QUEUE_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn TimelineSink>>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("mcp-proxy-timeline".into())
            .spawn(move || run_worker(rx, sinks));

        match worker {
            Ok(handle) => Self {
                sender: RwLock::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                dropped: AtomicU64::new(0),
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to start timeline worker; timeline disabled");
                Self::disabled()
            }
        }
    }

    /// Logger for the given settings: disabled, or tracing plus an optional
    /// SQLite database.
    pub fn from_settings(
        enabled: bool,
        database: Option<&std::path::Path>,
    ) -> Result<Self, TimelineError> {
        if !enabled {
            return Ok(Self::disabled());
        }
        let mut sinks: Vec<Box<dyn TimelineSink>> = vec![Box::new(TracingSink)];
        if let Some(path) = database {
            sinks.push(Box::new(SqliteTimelineSink::open(path)?));
            tracing::info!(path = %path.display(), "timeline database opened");
        }
        Ok(Self::new(sinks))
    }

    pub fn disabled() -> Self {
        Self {
            sender: RwLock::new(None),
            worker: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender_clone().is_some()
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn sender_clone(&self) -> Option<mpsc::Sender<Command>> {
        match self.sender.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn enqueue(&self, command: Command) {
        let Some(sender) = self.sender_clone() else {
            return;
        };
        match sender.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "timeline queue full, dropping events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("timeline worker gone, event discarded");
            }
        }
    }

    /// Record the start of a call; returns the id to pass to [`Self::log_call_end`].
    pub fn log_call_start(
        &self,
        tool_name: &str,
        server_name: &str,
        original_name: &str,
        parameters: &serde_json::Value,
    ) -> String {
        let call_id = uuid::Uuid::new_v4().to_string();
        if self.is_enabled() {
            self.enqueue(Command::Start(ProxyCallEvent {
                call_id: call_id.clone(),
                tool_name: tool_name.to_string(),
                server_name: server_name.to_string(),
                original_name: original_name.to_string(),
                parameters: parameters.clone(),
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                result: None,
                error: None,
                status: CallStatus::Started,
            }));
        }
        call_id
    }

    pub fn log_call_end(
        &self,
        call_id: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) {
        self.enqueue(Command::End {
            call_id: call_id.to_string(),
            end_time: Utc::now(),
            result: result.cloned(),
            error: error.map(String::from),
        });
    }

    pub fn log_discovery_event(
        &self,
        server_name: &str,
        tools_discovered: usize,
        success: bool,
        error: Option<&str>,
    ) {
        self.enqueue(Command::Record(TimelineEvent::Discovery(DiscoveryEvent {
            server_name: server_name.to_string(),
            tools_discovered,
            success,
            error: error.map(String::from),
            timestamp: Utc::now(),
        })));
    }

    pub fn log_connection_event(
        &self,
        server_name: &str,
        event_type: &str,
        success: bool,
        error: Option<&str>,
    ) {
        self.enqueue(Command::Record(TimelineEvent::Connection(ConnectionEvent {
            server_name: server_name.to_string(),
            event_type: event_type.to_string(),
            success,
            error: error.map(String::from),
            timestamp: Utc::now(),
        })));
    }

    /// Wait until everything queued so far has reached the sinks.
    pub async fn flush(&self) {
        let Some(sender) = self.sender_clone() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(Command::Flush(tx)).await.is_ok()
            && tokio::time::timeout(FLUSH_TIMEOUT, rx).await.is_err()
        {
            tracing::warn!("timeline flush timed out");
        }
    }

    /// Drain the queue, stop the worker and disable the logger.
    pub async fn shutdown(&self) {
        self.flush().await;
        let sender = match self.sender.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("timeline worker did not shut down cleanly");
            }
        }
    }
}

impl Default for TimelineLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn run_worker(mut rx: mpsc::Receiver<Command>, mut sinks: Vec<Box<dyn TimelineSink>>) {
    let mut in_flight: HashMap<String, ProxyCallEvent> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Start(call) => {
                emit(&mut sinks, &TimelineEvent::CallStarted(call.clone()));
                in_flight.insert(call.call_id.clone(), call);
            }
            Command::End {
                call_id,
                end_time,
                result,
                error,
            } => {
                let Some(mut call) = in_flight.remove(&call_id) else {
                    tracing::debug!(call_id = %call_id, "call end without a recorded start");
                    continue;
                };
                call.finish(end_time, result, error);
                emit(&mut sinks, &TimelineEvent::CallFinished(call));
            }
            Command::Record(event) => emit(&mut sinks, &event),
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(open_calls = in_flight.len(), "timeline worker stopped");
}

fn emit(sinks: &mut [Box<dyn TimelineSink>], event: &TimelineEvent) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.record(event) {
            tracing::warn!(sink = sink.name(), error = %e, "timeline sink failed");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    struct FailingSink;

    impl TimelineSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        fn record(&mut self, _event: &TimelineEvent) -> Result<(), TimelineError> {
            Err(TimelineError::Io(std::io::Error::other("disk full")))
        }
    }

    /// Blocks on the first event until released.
    struct GateSink {
        entered: std_mpsc::Sender<()>,
        release: std_mpsc::Receiver<()>,
        first: bool,
    }

    impl TimelineSink for GateSink {
        fn name(&self) -> &str {
            "gate"
        }
        fn record(&mut self, _event: &TimelineEvent) -> Result<(), TimelineError> {
            if self.first {
                self.first = false;
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_call_lifecycle_reaches_sink() {
        let sink = MemorySink::new();
        let logger = TimelineLogger::new(vec![Box::new(sink.clone())]);

        let id = logger.log_call_start("a.echo", "a", "echo", &serde_json::json!({"x": 1}));
        logger.log_call_end(&id, Some(&serde_json::json!("ok")), None);
        logger.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        match &events[1] {
            TimelineEvent::CallFinished(call) => {
                assert_eq!(call.call_id, id);
                assert_eq!(call.status, CallStatus::Succeeded);
                assert_eq!(call.result, Some(serde_json::json!("ok")));
                assert!(call.end_time.is_some());
                assert!(call.duration_ms.is_some());
            }
            other => panic!("expected CallFinished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_call_status() {
        let sink = MemorySink::new();
        let logger = TimelineLogger::new(vec![Box::new(sink.clone())]);
        let id = logger.log_call_start("t", "s", "t", &serde_json::json!({}));
        logger.log_call_end(&id, None, Some("boom"));
        logger.flush().await;

        let TimelineEvent::CallFinished(call) = &sink.events()[1] else {
            panic!("expected CallFinished");
        };
        assert_eq!(call.status, CallStatus::Failed);
        assert_eq!(call.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_disabled_logger_is_noop() {
        let logger = TimelineLogger::disabled();
        assert!(!logger.is_enabled());
        let id = logger.log_call_start("t", "s", "t", &serde_json::json!({}));
        assert!(!id.is_empty());
        logger.log_call_end(&id, None, None);
        logger.log_discovery_event("s", 1, true, None);
        logger.flush().await;
        assert_eq!(logger.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let sink = MemorySink::new();
        let logger = TimelineLogger::new(vec![Box::new(FailingSink), Box::new(sink.clone())]);
        logger.log_connection_event("s", "connect", false, Some("refused"));
        logger.flush().await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let gate = GateSink {
            entered: entered_tx,
            release: release_rx,
            first: true,
        };
        let logger = TimelineLogger::with_capacity(vec![Box::new(gate)], 1);

        logger.log_discovery_event("s", 0, true, None);
        entered_rx.recv().unwrap();

        // Worker is parked inside the sink: one event fits, the next is dropped.
        logger.log_discovery_event("s", 1, true, None);
        logger.log_discovery_event("s", 2, true, None);
        assert_eq!(logger.dropped_events(), 1);

        release_tx.send(()).unwrap();
        logger.shutdown().await;
        assert!(!logger.is_enabled());
    }

    #[tokio::test]
    async fn test_from_settings() {
        assert!(!TimelineLogger::from_settings(false, None).unwrap().is_enabled());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.db");
        let logger = TimelineLogger::from_settings(true, Some(&path)).unwrap();
        assert!(logger.is_enabled());
        logger.log_discovery_event("s", 2, true, None);
        logger.shutdown().await;

        let sink = SqliteTimelineSink::open(&path).unwrap();
        assert_eq!(sink.counts().unwrap(), (0, 1, 0));
    }

    #[test]
    fn test_event_serialization_tagged() {
        let event = TimelineEvent::Connection(ConnectionEvent {
            server_name: "s".into(),
            event_type: "reconnect".into(),
            success: true,
            error: None,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "connection");
        assert_eq!(json["event_type"], "reconnect");
    }
}
