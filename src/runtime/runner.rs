use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::handlers::{ExecutionMode, FailureKind, HandlerRegistry, TaskEvent, TaskFailure, TaskHandler};
use crate::runtime::config::RetryPolicy;
use crate::runtime::context::Context;
use crate::runtime::execution::{ExecutionStatus, InvalidTransition, TaskExecution};
use crate::runtime::graph::{NodeIndex, TaskSpec};
use crate::runtime::notice::{Notice, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Execution already resolved (a cancellation race); nothing to do.
    Ignored,
    /// A previous request is still in effect.
    AlreadyRequested,
    /// Applied once the task reports it is cancellable.
    Queued,
    Signalled,
}

/// Starts task work on the runtime and relays cancellation to it. The
/// `TaskExecution` records themselves stay with the scheduler.
pub struct TaskRunner {
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
    notices: mpsc::UnboundedSender<Notice>,
    cancels: HashMap<Uuid, watch::Sender<bool>>,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        attempt_timeout: Option<Duration>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self { registry, policy, attempt_timeout, notices, cancels: HashMap::new() }
    }

    pub fn start(&mut self, task: NodeIndex, spec: &TaskSpec, token_id: Uuid, ctx: &Context) -> TaskExecution {
        let execution = TaskExecution::new(task, token_id);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.insert(execution.id, cancel_tx);

        let worker = Worker {
            execution_id: execution.id,
            handler_name: spec.handler.clone(),
            handler: self.registry.get(&spec.handler),
            params: ctx.resolve_params(&spec.params),
            ctx: ctx.clone(),
            policy: self.policy.clone(),
            attempt_timeout: self.attempt_timeout,
            notices: self.notices.clone(),
            cancellable_sent: false,
        };

        tokio::spawn(async move {
            let execution_id = worker.execution_id;
            let notices = worker.notices.clone();
            let outcome = worker.await_outcome(cancel_rx).await;
            // scheduler gone means the session was dropped
            let _ = notices.send(Notice::Outcome { execution_id, outcome });
        });

        execution
    }

    /// Idempotent. Only signals the worker once the execution is cancellable.
    pub fn request_cancel(&mut self, execution: &mut TaskExecution) -> CancelDisposition {
        if execution.status().is_terminal() {
            return CancelDisposition::Ignored;
        }
        if !execution.request_cancel() {
            return CancelDisposition::AlreadyRequested;
        }
        if execution.status() == ExecutionStatus::Cancellable {
            self.signal(execution.id);
            CancelDisposition::Signalled
        } else {
            debug!(execution_id = %execution.id, "Cancellation queued until task is cancellable");
            CancelDisposition::Queued
        }
    }

    /// Moves the execution to `Cancellable`; returns `true` if a queued
    /// cancellation was applied.
    pub fn mark_cancellable(&mut self, execution: &mut TaskExecution) -> Result<bool, InvalidTransition> {
        execution.transition(ExecutionStatus::Cancellable)?;
        if execution.cancel_requested() {
            self.signal(execution.id);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn release(&mut self, execution_id: Uuid) {
        self.cancels.remove(&execution_id);
    }

    fn signal(&self, execution_id: Uuid) {
        if let Some(tx) = self.cancels.get(&execution_id) {
            let _ = tx.send(true);
        }
    }
}

enum AttemptResult {
    Completed(Value),
    Cancelled,
    Failed(TaskFailure, Vec<Value>),
}

struct Worker {
    execution_id: Uuid,
    handler_name: String,
    handler: Option<Arc<dyn TaskHandler>>,
    params: Value,
    ctx: Context,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
    notices: mpsc::UnboundedSender<Notice>,
    cancellable_sent: bool,
}

impl Worker {
    async fn await_outcome(mut self, mut cancel: watch::Receiver<bool>) -> TaskOutcome {
        let Some(handler) = self.handler.clone() else {
            return TaskOutcome::Failed(TaskFailure::new(
                FailureKind::MalformedRequest,
                format!("no handler registered for '{}'", self.handler_name),
            ));
        };
        let mode = handler.execution_mode();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut retained = Vec::new();
        let mut last_failure = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            let delay = self.policy.backoff_delay(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => return self.cancel(handler.as_ref()).await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempts = attempt;
            if mode == ExecutionMode::Interruptible {
                self.announce_cancellable();
            }

            match self.run_attempt(handler.as_ref(), mode, &mut cancel).await {
                AttemptResult::Completed(result) => {
                    if attempt > 1 {
                        info!(execution_id = %self.execution_id, handler = %self.handler_name, attempt, "Task succeeded after retry");
                    }
                    return TaskOutcome::Completed { result, attempts, degraded: false };
                }
                AttemptResult::Cancelled => return self.cancel(handler.as_ref()).await,
                AttemptResult::Failed(failure, partial) => {
                    retained.extend(partial);
                    let retryable = failure.kind.is_retryable();
                    warn!(
                        execution_id = %self.execution_id,
                        handler = %self.handler_name,
                        attempt,
                        max_attempts,
                        kind = %failure.kind,
                        error = %failure.message,
                        will_retry = retryable && attempt < max_attempts,
                        "Task attempt failed"
                    );
                    last_failure = Some(failure);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let mut failure = last_failure
            .unwrap_or_else(|| TaskFailure::new(FailureKind::Unknown, "task made no attempts"));
        failure.attempts = attempts;
        failure.partial = retained;

        let fallback = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return self.cancel(handler.as_ref()).await,
            r = handler.fallback(self.params.clone(), self.ctx.clone()) => r,
        };

        match fallback {
            Some(Ok(result)) => {
                info!(execution_id = %self.execution_id, handler = %self.handler_name, kind = %failure.kind, "Retry budget spent, fallback path completed");
                TaskOutcome::Completed { result, attempts, degraded: true }
            }
            Some(Err(fallback_failure)) => {
                error!(execution_id = %self.execution_id, handler = %self.handler_name, kind = %fallback_failure.kind, error = %fallback_failure.message, "Fallback path failed");
                TaskOutcome::Failed(TaskFailure {
                    attempts,
                    partial: failure.partial,
                    ..fallback_failure
                })
            }
            None => {
                error!(execution_id = %self.execution_id, handler = %self.handler_name, kind = %failure.kind, error = %failure.message, attempts, "Task failed");
                TaskOutcome::Failed(failure)
            }
        }
    }

    async fn run_attempt(
        &mut self,
        handler: &dyn TaskHandler,
        mode: ExecutionMode,
        cancel: &mut watch::Receiver<bool>,
    ) -> AttemptResult {
        let mut partial = Vec::new();
        let mut stream = handler.execute(self.params.clone(), self.ctx.clone());

        let timeout = self.attempt_timeout;
        let deadline = async move {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return AttemptResult::Cancelled,
                _ = &mut deadline => {
                    let failure = TaskFailure::new(
                        FailureKind::Network,
                        format!("attempt timed out after {:?}", timeout.unwrap_or_default()),
                    );
                    return AttemptResult::Failed(failure, partial);
                }
                item = stream.next() => match item {
                    Some(TaskEvent::Chunk(chunk)) => {
                        if mode == ExecutionMode::Streamed {
                            self.announce_cancellable();
                        }
                        self.notify(Notice::Progress { execution_id: self.execution_id, chunk: chunk.clone() });
                        partial.push(chunk);
                    }
                    Some(TaskEvent::Cancellable) => {
                        if mode != ExecutionMode::Atomic {
                            self.announce_cancellable();
                        }
                    }
                    Some(TaskEvent::Escalation(code)) => {
                        self.notify(Notice::Escalation { execution_id: self.execution_id, code });
                    }
                    Some(TaskEvent::Completed(result)) => return AttemptResult::Completed(result),
                    Some(TaskEvent::Failed(failure)) => return AttemptResult::Failed(failure, partial),
                    None => {
                        let failure = TaskFailure::new(
                            FailureKind::Unknown,
                            "result stream ended without a terminal event",
                        );
                        return AttemptResult::Failed(failure, partial);
                    }
                }
            }
        }
    }

    fn announce_cancellable(&mut self) {
        if !self.cancellable_sent {
            self.cancellable_sent = true;
            self.notify(Notice::Cancellable { execution_id: self.execution_id });
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    async fn cancel(&self, handler: &dyn TaskHandler) -> TaskOutcome {
        handler.cancel(self.execution_id).await;
        info!(execution_id = %self.execution_id, handler = %self.handler_name, "Task cancelled");
        TaskOutcome::Cancelled
    }
}

/// Resolves once cancellation is signalled; never if the sender is dropped.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
