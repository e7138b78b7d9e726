use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;
use crate::runtime::context::Context;

pub mod builtin;
pub mod failure;
pub mod http;

pub use failure::{FailureKind, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs to completion; cancellation requests fail.
    Atomic,
    /// Safe to interrupt from the moment an attempt starts (timers, waits).
    Interruptible,
    /// Becomes cancellable at the first chunk or an explicit `Cancellable` marker.
    Streamed,
}

/// Items of a task's result stream. The stream ends with exactly one
/// `Completed` or `Failed`.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Chunk(Value),
    Cancellable,
    Escalation(String),
    Completed(Value),
    Failed(TaskFailure),
}

pub type TaskStream<'a> = BoxStream<'a, TaskEvent>;

/// Plugin interface for the work behind a task node.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Atomic
    }

    fn validate(&self, params: &Value) -> anyhow::Result<()>;

    fn execute<'a>(&'a self, params: Value, ctx: Context) -> TaskStream<'a>;

    /// Degraded non-streamed path used once the retry budget is spent.
    async fn fallback(&self, _params: Value, _ctx: Context) -> Option<Result<Value, TaskFailure>> {
        None
    }

    /// Called after the result stream has been dropped for a cancellation.
    async fn cancel(&self, _execution_id: Uuid) {}
}

#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log`, `assign`, `sleep`, `emit` and `http`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::LogHandler));
        registry.register(Arc::new(builtin::AssignHandler));
        registry.register(Arc::new(builtin::SleepHandler));
        registry.register(Arc::new(builtin::EmitHandler));
        registry.register(Arc::new(http::HttpHandler::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }
}
