#![allow(dead_code)]

use async_trait::async_trait;
use bpmnflow::dsl::Process;
use bpmnflow::handlers::{ExecutionMode, FailureKind, HandlerRegistry, TaskEvent, TaskFailure, TaskHandler, TaskStream};
use bpmnflow::runtime::context::Context;
use bpmnflow::runtime::event::{EventKind, ProcessEvent};
use bpmnflow::runtime::{EngineConfig, ExecutionSession, RetryPolicy, SessionReport};
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Short, deterministic backoff so retry tests stay quick.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::new(3).with_initial_backoff(10).with_jitter(false),
        ..EngineConfig::default()
    }
}

pub fn registry_with(handlers: Vec<Arc<dyn TaskHandler>>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::with_builtins();
    for handler in handlers {
        registry.register(handler);
    }
    Arc::new(registry)
}

pub async fn run(process: Process, registry: Arc<HandlerRegistry>) -> SessionReport {
    ExecutionSession::from_process(process, registry, test_config())
        .expect("Session setup failed")
        .run()
        .await
}

pub async fn run_builtin(process: Process) -> SessionReport {
    run(process, registry_with(Vec::new())).await
}

/// Waits on the live feed for `kind` at `node_id`.
pub async fn wait_for(rx: &mut broadcast::Receiver<ProcessEvent>, kind: EventKind, node_id: &str) -> ProcessEvent {
    loop {
        let event = rx.recv().await.expect("Event feed closed");
        if event.kind == kind && event.node_id.as_deref() == Some(node_id) {
            return event;
        }
    }
}

pub fn started_tasks(report: &SessionReport) -> Vec<String> {
    report.events_of(EventKind::TaskStarted)
        .into_iter()
        .filter_map(|e| e.node_id.clone())
        .collect()
}

pub fn faults(report: &SessionReport) -> Vec<String> {
    report.events_of(EventKind::SessionFault)
        .into_iter()
        .filter_map(|e| e.payload["error"].as_str().map(str::to_string))
        .collect()
}

// --- test handlers ---

/// Plays back one scripted result per attempt; failures stream a partial
/// chunk first.
#[derive(Debug)]
pub struct ScriptedHandler {
    name: String,
    script: Mutex<VecDeque<Result<Value, TaskFailure>>>,
    pub calls: AtomicU32,
}

impl ScriptedHandler {
    pub fn new(name: &str, script: Vec<Result<Value, TaskFailure>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let next = self.script.lock().unwrap().pop_front();
        let items = match next {
            Some(Ok(value)) => vec![TaskEvent::Completed(value)],
            Some(Err(failure)) => vec![
                TaskEvent::Chunk(json!(format!("partial-{}", call))),
                TaskEvent::Failed(failure),
            ],
            None => vec![TaskEvent::Failed(TaskFailure::new(FailureKind::Unknown, "script exhausted"))],
        };
        stream::iter(items).boxed()
    }
}

/// Always fails with a network error; its fallback serves a cached value.
#[derive(Debug)]
pub struct CachedFallbackHandler;

#[async_trait]
impl TaskHandler for CachedFallbackHandler {
    fn name(&self) -> &str {
        "cached"
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        stream::once(async { TaskEvent::Failed(TaskFailure::new(FailureKind::Network, "upstream unreachable")) }).boxed()
    }

    async fn fallback(&self, _params: Value, _ctx: Context) -> Option<Result<Value, TaskFailure>> {
        Some(Ok(json!("cached-result")))
    }
}

/// Atomic work taking `delay`; never cancellable.
#[derive(Debug)]
pub struct SlowAtomicHandler {
    pub delay: Duration,
}

#[async_trait]
impl TaskHandler for SlowAtomicHandler {
    fn name(&self) -> &str {
        "slow_atomic"
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        let delay = self.delay;
        stream::once(async move {
            tokio::time::sleep(delay).await;
            TaskEvent::Completed(json!("atomic-done"))
        }).boxed()
    }
}

/// Streams a first chunk after `first_chunk`, then completes after `total`.
#[derive(Debug)]
pub struct TrickleHandler {
    pub first_chunk: Duration,
    pub total: Duration,
}

#[async_trait]
impl TaskHandler for TrickleHandler {
    fn name(&self) -> &str {
        "trickle"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Streamed
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        let (first, rest) = (self.first_chunk, self.total.saturating_sub(self.first_chunk));
        async_stream::stream! {
            tokio::time::sleep(first).await;
            yield TaskEvent::Chunk(json!("first"));
            tokio::time::sleep(rest).await;
            yield TaskEvent::Completed(json!("trickled"));
        }.boxed()
    }
}

/// Interruptible task raising the `codes` escalations one second apart,
/// then completing.
#[derive(Debug)]
pub struct EscalatingHandler {
    pub codes: Vec<String>,
}

#[async_trait]
impl TaskHandler for EscalatingHandler {
    fn name(&self) -> &str {
        "escalating"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Interruptible
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        let codes = self.codes.clone();
        async_stream::stream! {
            for code in codes {
                tokio::time::sleep(Duration::from_secs(1)).await;
                yield TaskEvent::Escalation(code);
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            yield TaskEvent::Completed(json!("handled"));
        }.boxed()
    }
}

/// Interruptible work whose cleanup after a cancel takes `cancel_delay`.
#[derive(Debug)]
pub struct SlowCleanupHandler {
    pub work: Duration,
    pub cancel_delay: Duration,
}

#[async_trait]
impl TaskHandler for SlowCleanupHandler {
    fn name(&self) -> &str {
        "slow_cleanup"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Interruptible
    }

    fn validate(&self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, _params: Value, _ctx: Context) -> TaskStream<'a> {
        let work = self.work;
        stream::once(async move {
            tokio::time::sleep(work).await;
            TaskEvent::Completed(json!("worked"))
        }).boxed()
    }

    async fn cancel(&self, _execution_id: uuid::Uuid) {
        tokio::time::sleep(self.cancel_delay).await;
    }
}
