use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.cancellable")]
    TaskCancellable,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "task.cancel.failed")]
    TaskCancelFailed,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.replayed")]
    TaskReplayed,
    #[serde(rename = "boundary.armed")]
    BoundaryArmed,
    #[serde(rename = "boundary.fired")]
    BoundaryFired,
    #[serde(rename = "token.spawned")]
    TokenSpawned,
    #[serde(rename = "token.joined")]
    TokenJoined,
    #[serde(rename = "token.retired")]
    TokenRetired,
    #[serde(rename = "session.fault")]
    SessionFault,
    #[serde(rename = "session.completed")]
    SessionCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCancellable => "task.cancellable",
            EventKind::TaskProgress => "task.progress",
            EventKind::TaskCancelled => "task.cancelled",
            EventKind::TaskCancelFailed => "task.cancel.failed",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskReplayed => "task.replayed",
            EventKind::BoundaryArmed => "boundary.armed",
            EventKind::BoundaryFired => "boundary.fired",
            EventKind::TokenSpawned => "token.spawned",
            EventKind::TokenJoined => "token.joined",
            EventKind::TokenRetired => "token.retired",
            EventKind::SessionFault => "session.fault",
            EventKind::SessionCompleted => "session.completed",
        }
    }

    /// Events after which a task no longer shows a cancel affordance.
    pub fn ends_task(&self) -> bool {
        matches!(
            self,
            EventKind::TaskCompleted | EventKind::TaskCancelled | EventKind::TaskFailed | EventKind::TaskReplayed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub execution_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub payload: Value,
}

/// Event under construction; the publisher stamps sequence and time.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub execution_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
    pub payload: Value,
}

impl EventRecord {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, node_id: None, execution_id: None, token_id: None, payload: Value::Null }
    }

    pub fn node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn token(mut self, token_id: Uuid) -> Self {
        self.token_id = Some(token_id);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Ordered event log plus a live broadcast feed. Only the scheduler writes.
pub struct EventPublisher {
    session_id: Uuid,
    next_sequence: u64,
    log: Vec<ProcessEvent>,
    live: broadcast::Sender<ProcessEvent>,
}

impl EventPublisher {
    pub fn new(session_id: Uuid, live: broadcast::Sender<ProcessEvent>) -> Self {
        Self { session_id, next_sequence: 0, log: Vec::new(), live }
    }

    pub fn publish(&mut self, record: EventRecord) {
        let event = ProcessEvent {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            session_id: self.session_id,
            kind: record.kind,
            node_id: record.node_id,
            execution_id: record.execution_id,
            token_id: record.token_id,
            payload: record.payload,
        };
        self.next_sequence += 1;
        // no live subscribers is fine; the log keeps everything
        let _ = self.live.send(event.clone());
        self.log.push(event);
    }

    pub fn into_log(self) -> Vec<ProcessEvent> {
        self.log
    }
}
