use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;
use crate::compiler::core::Compiler;
use crate::dsl::Process;
use crate::handlers::HandlerRegistry;
use crate::runtime::config::EngineConfig;
use crate::runtime::context::Context;
use crate::runtime::event::{EventKind, ProcessEvent};
use crate::runtime::execution::ExecutionStatus;
use crate::runtime::graph::{GraphError, NodeKind, ProcessGraph};
use crate::runtime::replay::ReplayJournal;
use crate::runtime::runner::CancelDisposition;
use crate::runtime::scheduler::TokenScheduler;
use crate::runtime::token::{Token, TokenState};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("task '{task}' uses unregistered handler '{handler}'")]
    UnknownHandler { task: String, handler: String },
    #[error("task '{task}' has invalid parameters: {reason}")]
    InvalidParams { task: String, reason: String },
    #[error("session {0} is no longer running")]
    SessionClosed(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// At least one token reached an end event.
    Completed,
    /// No end was reached and a branch ended through failure.
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenView {
    pub id: Uuid,
    pub node_id: String,
    pub state: TokenState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    pub id: Uuid,
    pub task_id: String,
    pub token_id: Uuid,
    pub status: ExecutionStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tokens: Vec<TokenView>,
    pub executions: Vec<ExecutionView>,
    /// Executions currently offering a cancel affordance.
    pub cancellable: Vec<Uuid>,
}

impl SessionSnapshot {
    pub fn execution_for(&self, task_id: &str) -> Option<&ExecutionView> {
        self.executions.iter().find(|e| e.task_id == task_id)
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    CancelTask {
        execution_id: Uuid,
        reply: oneshot::Sender<CancelDisposition>,
    },
    BroadcastSignal {
        name: String,
        reply: oneshot::Sender<usize>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Cloneable remote control for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    live: broadcast::Sender<ProcessEvent>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Requesting cancellation of an already-resolved execution is not an
    /// error; it resolves to `CancelDisposition::Ignored`. Once the session
    /// has finished every execution is resolved, so the same holds.
    pub async fn cancel_task(&self, execution_id: Uuid) -> Result<CancelDisposition, EngineError> {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::CancelTask { execution_id, reply }).is_err() {
            debug!(session_id = %self.session_id, execution_id = %execution_id, "Cancel after session end ignored");
            return Ok(CancelDisposition::Ignored);
        }
        Ok(rx.await.unwrap_or(CancelDisposition::Ignored))
    }

    /// Returns how many boundaries the signal fired.
    pub async fn broadcast_signal(&self, name: &str) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::BroadcastSignal { name: name.to_string(), reply })?;
        rx.await.map_err(|_| EngineError::SessionClosed(self.session_id))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply))?;
        rx.await.map_err(|_| EngineError::SessionClosed(self.session_id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.live.subscribe()
    }

    fn send(&self, command: SessionCommand) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::SessionClosed(self.session_id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub events: Vec<ProcessEvent>,
    pub variables: HashMap<String, Value>,
    pub tokens: Vec<Token>,
}

impl SessionReport {
    pub fn events_of(&self, kind: EventKind) -> Vec<&ProcessEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    /// Events of one kind emitted for a given node.
    pub fn events_for(&self, kind: EventKind, node_id: &str) -> Vec<&ProcessEvent> {
        self.events.iter()
            .filter(|e| e.kind == kind && e.node_id.as_deref() == Some(node_id))
            .collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.iter().map(|e| e.kind).collect()
    }
}

/// One process instance: a graph, its variables and a scheduler loop.
pub struct ExecutionSession {
    id: Uuid,
    graph: Arc<ProcessGraph>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    variables: HashMap<String, Value>,
    replay: ReplayJournal,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    live: broadcast::Sender<ProcessEvent>,
}

impl ExecutionSession {
    /// Checks every task's handler and parameters before anything runs.
    pub fn new(graph: Arc<ProcessGraph>, registry: Arc<HandlerRegistry>, config: EngineConfig) -> Result<Self, EngineError> {
        for node in graph.nodes() {
            let NodeKind::Task(spec) = &node.kind else { continue };
            let handler = registry.get(&spec.handler).ok_or_else(|| EngineError::UnknownHandler {
                task: node.id.clone(),
                handler: spec.handler.clone(),
            })?;
            handler.validate(&spec.params).map_err(|e| EngineError::InvalidParams {
                task: node.id.clone(),
                reason: e.to_string(),
            })?;
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(config.event_buffer.max(1));
        Ok(Self {
            id: Uuid::new_v4(),
            variables: graph.variables.clone(),
            graph,
            registry,
            config,
            replay: ReplayJournal::new(),
            commands_tx,
            commands,
            live,
        })
    }

    pub fn from_process(process: Process, registry: Arc<HandlerRegistry>, config: EngineConfig) -> Result<Self, EngineError> {
        let graph = Compiler::new().compile(process)?;
        Self::new(Arc::new(graph), registry, config)
    }

    /// Overrides process defaults.
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_replay(mut self, journal: ReplayJournal) -> Self {
        self.replay = journal;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.id,
            commands: self.commands_tx.clone(),
            live: self.live.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.live.subscribe()
    }

    /// Drives the instance until no token is live.
    pub async fn run(self) -> SessionReport {
        let Self { id, graph, registry, config, variables, replay, commands_tx, mut commands, live } = self;
        // handles keep the command channel open; the session itself does not
        drop(commands_tx);

        info!(session_id = %id, process = %graph.id, "Session started");
        let ctx = Context::new(id, graph.id.clone(), variables);
        let mut scheduler = TokenScheduler::new(id, graph, registry, &config, ctx, replay, live);
        scheduler.start();

        while !scheduler.is_finished() {
            tokio::select! {
                notice = scheduler.next_notice() => match notice {
                    Some(notice) => scheduler.handle_notice(notice),
                    None => break,
                },
                Some(command) = commands.recv() => apply_command(&mut scheduler, command),
            }
        }

        let variables = scheduler.context().snapshot();
        let (status, events, tokens) = scheduler.finish();
        debug!(session_id = %id, events = events.len(), "Session report ready");
        SessionReport { session_id: id, status, events, variables, tokens }
    }
}

fn apply_command(scheduler: &mut TokenScheduler, command: SessionCommand) {
    match command {
        SessionCommand::CancelTask { execution_id, reply } => {
            let _ = reply.send(scheduler.cancel_task(execution_id));
        }
        SessionCommand::BroadcastSignal { name, reply } => {
            let _ = reply.send(scheduler.broadcast_signal(&name));
        }
        SessionCommand::Snapshot(reply) => {
            let _ = reply.send(scheduler.snapshot());
        }
    }
}
