use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::handlers::{HandlerRegistry, TaskFailure};
use crate::nodes::flow::{FlowError, JoinArrival, JoinTable, select_exclusive};
use crate::runtime::boundary::BoundaryMonitor;
use crate::runtime::config::EngineConfig;
use crate::runtime::context::Context;
use crate::runtime::event::{EventKind, EventPublisher, EventRecord, ProcessEvent};
use crate::runtime::execution::{ExecutionStatus, TaskExecution};
use crate::runtime::graph::{NodeIndex, NodeKind, ProcessGraph, TaskSpec};
use crate::runtime::notice::{Notice, TaskOutcome};
use crate::runtime::replay::ReplayJournal;
use crate::runtime::runner::{CancelDisposition, TaskRunner};
use crate::runtime::session::{ExecutionView, SessionSnapshot, SessionStatus, TokenView};
use crate::runtime::token::{CancelCause, SplitFrame, Token, TokenState};

enum Step {
    /// Token reaches a node and the node's semantics apply.
    Arrive { token: Uuid, node: NodeIndex },
    /// Token leaves a node along its outgoing flows.
    Leave { token: Uuid, node: NodeIndex },
}

/// Sole owner of token, execution and arm state for one process instance.
/// Workers and timers only post `Notice`s, applied here one at a time.
pub struct TokenScheduler {
    graph: Arc<ProcessGraph>,
    ctx: Context,
    runner: TaskRunner,
    monitor: BoundaryMonitor,
    tokens: HashMap<Uuid, Token>,
    token_order: Vec<Uuid>,
    executions: HashMap<Uuid, TaskExecution>,
    joins: JoinTable,
    replay: ReplayJournal,
    agenda: VecDeque<Step>,
    notices: mpsc::UnboundedReceiver<Notice>,
    events: EventPublisher,
    reached_end: usize,
}

impl TokenScheduler {
    pub fn new(
        session_id: Uuid,
        graph: Arc<ProcessGraph>,
        registry: Arc<HandlerRegistry>,
        config: &EngineConfig,
        ctx: Context,
        replay: ReplayJournal,
        live: broadcast::Sender<ProcessEvent>,
    ) -> Self {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        Self {
            graph,
            ctx,
            runner: TaskRunner::new(registry, config.retry.clone(), config.attempt_timeout(), notice_tx.clone()),
            monitor: BoundaryMonitor::new(notice_tx),
            tokens: HashMap::new(),
            token_order: Vec::new(),
            executions: HashMap::new(),
            joins: JoinTable::new(),
            replay,
            agenda: VecDeque::new(),
            notices,
            events: EventPublisher::new(session_id, live),
            reached_end: 0,
        }
    }

    /// Places one token on every start event and advances until tasks are running.
    pub fn start(&mut self) {
        let starts = self.graph.start_nodes().to_vec();
        for start in starts {
            let token = self.spawn_token(start, Vec::new(), json!({ "origin": "start" }));
            self.agenda.push_back(Step::Arrive { token, node: start });
        }
        self.drain();
    }

    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    pub fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Cancellable { execution_id } => self.on_cancellable(execution_id),
            Notice::Progress { execution_id, chunk } => {
                if let Some(exec) = self.executions.get(&execution_id) {
                    let record = self.task_record(EventKind::TaskProgress, exec).payload(json!({ "chunk": chunk }));
                    self.events.publish(record);
                }
            }
            Notice::Escalation { execution_id, code } => self.on_escalation(execution_id, &code),
            Notice::TimerElapsed { execution_id, boundary } => {
                self.fire_boundary(execution_id, boundary);
            }
            Notice::Outcome { execution_id, outcome } => self.resolve(execution_id, outcome),
        }
        self.drain();
    }

    /// User-initiated cancellation; same path as an interrupting boundary.
    pub fn cancel_task(&mut self, execution_id: Uuid) -> CancelDisposition {
        let disposition = self.request_cancel(execution_id);
        self.drain();
        disposition
    }

    /// Fires every armed signal boundary listening for `name`.
    pub fn broadcast_signal(&mut self, name: &str) -> usize {
        let targets = self.monitor.signal_targets(&self.graph, name);
        let mut fired = 0;
        for (execution_id, boundary) in targets {
            if self.fire_boundary(execution_id, boundary) {
                fired += 1;
            }
        }
        debug!(signal = name, fired, "Signal broadcast");
        self.drain();
        fired
    }

    pub fn is_finished(&self) -> bool {
        self.agenda.is_empty() && !self.tokens.values().any(|t| t.state.is_live())
    }

    /// Derived view: executions currently showing a cancel affordance.
    pub fn cancellable_tasks(&self) -> Vec<Uuid> {
        let mut ids: Vec<_> = self.executions.values()
            .filter(|e| e.shows_cancel_affordance())
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let tokens = self.token_order.iter()
            .filter_map(|id| self.tokens.get(id))
            .map(|t| TokenView {
                id: t.id,
                node_id: self.graph.node(t.current_node).id.clone(),
                state: t.state,
            })
            .collect();
        let mut executions: Vec<_> = self.executions.values()
            .map(|e| ExecutionView {
                id: e.id,
                task_id: self.graph.node(e.task).id.clone(),
                token_id: e.token_id,
                status: e.status(),
                cancel_requested: e.cancel_requested(),
            })
            .collect();
        executions.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        SessionSnapshot {
            tokens,
            executions,
            cancellable: self.cancellable_tasks(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.reached_end > 0 {
            return SessionStatus::Completed;
        }
        let failed = self.tokens.values().any(|t| {
            matches!(t.cancel_cause, Some(CancelCause::Failure | CancelCause::JoinUnreachable))
        });
        if failed { SessionStatus::Failed } else { SessionStatus::Cancelled }
    }

    /// Publishes `session.completed` and hands back the log and final tokens.
    pub fn finish(mut self) -> (SessionStatus, Vec<ProcessEvent>, Vec<Token>) {
        let status = self.status();
        let cancelled = self.tokens.values().filter(|t| t.state == TokenState::Cancelled).count();
        self.events.publish(EventRecord::new(EventKind::SessionCompleted).payload(json!({
            "status": status,
            "reached_end": self.reached_end,
            "cancelled_tokens": cancelled,
        })));
        info!(process = %self.graph.id, status = ?status, "Session finished");

        let mut tokens = self.tokens;
        let ordered = self.token_order.iter().filter_map(|id| tokens.remove(id)).collect();
        (status, self.events.into_log(), ordered)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    // --- token movement ---

    fn drain(&mut self) {
        while let Some(step) = self.agenda.pop_front() {
            match step {
                Step::Arrive { token, node } => self.arrive(token, node),
                Step::Leave { token, node } => self.leave(token, node),
            }
        }
        self.resolve_stuck_joins();
    }

    fn arrive(&mut self, token_id: Uuid, node: NodeIndex) {
        let Some(token) = self.tokens.get_mut(&token_id) else { return };
        if !token.state.is_live() {
            return;
        }
        token.current_node = node;
        token.state = TokenState::Running;

        let graph = self.graph.clone();
        match &graph.node(node).kind {
            NodeKind::Start | NodeKind::Boundary(_) => self.leave(token_id, node),
            NodeKind::End => self.retire(token_id, "end"),
            NodeKind::Task(spec) => self.start_task(token_id, node, spec),
            NodeKind::ExclusiveGateway => match select_exclusive(&graph, node, &self.ctx) {
                Ok(target) => self.agenda.push_back(Step::Arrive { token: token_id, node: target }),
                Err(e) => self.fail_path(token_id, node, e),
            },
            NodeKind::ParallelGateway => {
                let incoming = graph.incoming_count(node);
                if incoming > 1 {
                    self.join(token_id, node, incoming);
                } else {
                    self.leave(token_id, node);
                }
            }
        }
    }

    fn leave(&mut self, token_id: Uuid, node: NodeIndex) {
        let targets: Vec<NodeIndex> = self.graph.outgoing(node).map(|e| e.target).collect();
        match targets.as_slice() {
            [] => self.retire(token_id, "implicit-end"),
            [target] => self.agenda.push_back(Step::Arrive { token: token_id, node: *target }),
            _ => self.split(token_id, node, targets),
        }
    }

    fn split(&mut self, token_id: Uuid, node: NodeIndex, targets: Vec<NodeIndex>) {
        let Some(parent) = self.tokens.get(&token_id) else { return };
        let lineage = parent.parent_lineage.clone();
        self.retire(token_id, "split");

        let of = targets.len();
        for (branch, target) in targets.into_iter().enumerate() {
            let mut child_lineage = lineage.clone();
            child_lineage.push(SplitFrame { split_token: token_id, gateway: node, branch, of });
            let child = self.spawn_token(node, child_lineage, json!({
                "origin": "split",
                "parent": token_id,
                "branch": branch,
                "of": of,
            }));
            self.agenda.push_back(Step::Arrive { token: child, node: target });
        }
    }

    fn join(&mut self, token_id: Uuid, node: NodeIndex, incoming: usize) {
        let Some(token) = self.tokens.get_mut(&token_id) else { return };
        token.state = TokenState::WaitingForJoin;
        let arrival = self.joins.arrive(node, incoming, token);
        let join_id = self.graph.node(node).id.clone();

        match arrival {
            JoinArrival::Waiting => debug!(token_id = %token_id, join = %join_id, "Token waiting for join"),
            JoinArrival::Duplicate => {
                warn!(token_id = %token_id, join = %join_id, "Second token for an already-arrived branch absorbed");
                self.absorb(token_id, &join_id, None, true);
            }
            JoinArrival::Resolved { absorbed, lineage } => {
                let onward = self.spawn_token(node, lineage, json!({
                    "origin": "join",
                    "joined": absorbed.len(),
                }));
                for id in absorbed {
                    self.absorb(id, &join_id, Some(onward), false);
                }
                self.agenda.push_back(Step::Leave { token: onward, node });
            }
        }
    }

    fn absorb(&mut self, token_id: Uuid, join_id: &str, into: Option<Uuid>, duplicate: bool) {
        if let Some(token) = self.tokens.get_mut(&token_id) {
            token.state = TokenState::Completed;
        }
        self.events.publish(EventRecord::new(EventKind::TokenJoined)
            .node(join_id)
            .token(token_id)
            .payload(json!({ "into": into, "duplicate": duplicate })));
    }

    /// Once nothing is running, tokens still waiting at joins can never be
    /// released.
    fn resolve_stuck_joins(&mut self) {
        if !self.executions.is_empty() || self.joins.is_empty() {
            return;
        }
        if self.tokens.values().any(|t| matches!(t.state, TokenState::Pending | TokenState::Running)) {
            return;
        }
        for (join, token_id) in self.joins.drain_waiting() {
            let join_id = self.graph.node(join).id.clone();
            warn!(join = %join_id, token_id = %token_id, "Join can no longer complete");
            self.events.publish(EventRecord::new(EventKind::SessionFault)
                .node(&join_id)
                .token(token_id)
                .payload(json!({
                    "error": "join-unreachable",
                    "message": format!("join '{}' is missing branches that can no longer arrive", join_id),
                })));
            self.cancel_token(token_id, CancelCause::JoinUnreachable);
        }
    }

    fn spawn_token(&mut self, node: NodeIndex, lineage: Vec<SplitFrame>, payload: Value) -> Uuid {
        let token = Token::new(node, lineage);
        let id = token.id;
        self.tokens.insert(id, token);
        self.token_order.push(id);
        self.events.publish(EventRecord::new(EventKind::TokenSpawned)
            .node(&self.graph.node(node).id)
            .token(id)
            .payload(payload));
        id
    }

    fn retire(&mut self, token_id: Uuid, reason: &str) {
        let Some(token) = self.tokens.get_mut(&token_id) else { return };
        token.state = TokenState::Completed;
        let node = token.current_node;
        if reason == "end" {
            self.reached_end += 1;
        }
        self.events.publish(EventRecord::new(EventKind::TokenRetired)
            .node(&self.graph.node(node).id)
            .token(token_id)
            .payload(json!({ "state": TokenState::Completed, "reason": reason })));
    }

    fn cancel_token(&mut self, token_id: Uuid, cause: CancelCause) {
        let Some(token) = self.tokens.get_mut(&token_id) else { return };
        token.state = TokenState::Cancelled;
        token.cancel_cause = Some(cause);
        let node = token.current_node;
        self.events.publish(EventRecord::new(EventKind::TokenRetired)
            .node(&self.graph.node(node).id)
            .token(token_id)
            .payload(json!({ "state": TokenState::Cancelled, "cause": cause })));
    }

    fn fail_path(&mut self, token_id: Uuid, node: NodeIndex, err: FlowError) {
        let node_id = self.graph.node(node).id.clone();
        warn!(token_id = %token_id, gateway = %node_id, error = %err, "Token has no viable path");
        self.events.publish(EventRecord::new(EventKind::SessionFault)
            .node(&node_id)
            .token(token_id)
            .payload(json!({ "error": "no-matching-path", "message": err.to_string() })));
        self.cancel_token(token_id, CancelCause::Failure);
    }

    // --- task lifecycle ---

    fn start_task(&mut self, token_id: Uuid, node: NodeIndex, spec: &TaskSpec) {
        let node_id = self.graph.node(node).id.clone();

        if let Some(result) = self.replay.take(&node_id) {
            if let Some(out) = &spec.output {
                self.ctx.set_var(out, result.clone());
            }
            self.events.publish(EventRecord::new(EventKind::TaskReplayed)
                .node(&node_id)
                .token(token_id)
                .payload(json!({ "result": result })));
            self.agenda.push_back(Step::Leave { token: token_id, node });
            return;
        }

        let execution = self.runner.start(node, spec, token_id, &self.ctx);
        info!(execution_id = %execution.id, task = %node_id, handler = %spec.handler, "Task started");
        let record = self.task_record(EventKind::TaskStarted, &execution)
            .payload(json!({ "handler": spec.handler }));
        self.events.publish(record);
        self.executions.insert(execution.id, execution);
    }

    fn on_cancellable(&mut self, execution_id: Uuid) {
        let Some(exec) = self.executions.get_mut(&execution_id) else { return };
        let applied_queued_cancel = match self.runner.mark_cancellable(exec) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Ignoring cancellable notice");
                return;
            }
        };

        let exec = &self.executions[&execution_id];
        let record = self.task_record(EventKind::TaskCancellable, exec).payload(json!({ "pending": exec.cancel_requested() }));
        self.events.publish(record);

        if applied_queued_cancel {
            debug!(execution_id = %execution_id, "Queued cancellation applied");
            return;
        }

        let armed = self.monitor.arm(&self.graph, exec);
        for boundary in armed {
            let spec = self.graph.boundary_spec(boundary).map(|s| (s.trigger.kind_str(), s.interrupting));
            let (trigger, interrupting) = spec.unwrap_or(("unknown", false));
            self.events.publish(EventRecord::new(EventKind::BoundaryArmed)
                .node(&self.graph.node(boundary).id)
                .execution(execution_id)
                .token(exec.token_id)
                .payload(json!({
                    "task": self.graph.node(exec.task).id,
                    "trigger": trigger,
                    "interrupting": interrupting,
                })));
        }
    }

    fn on_escalation(&mut self, execution_id: Uuid, code: &str) {
        let targets = self.monitor.escalation_targets(&self.graph, execution_id, code);
        if targets.is_empty() {
            debug!(execution_id = %execution_id, code, "Escalation not caught by any armed boundary");
        }
        for boundary in targets {
            self.fire_boundary(execution_id, boundary);
            let interrupted = self.executions.get(&execution_id).is_none_or(|e| e.interrupted_by.is_some());
            if interrupted {
                break;
            }
        }
    }

    fn fire_boundary(&mut self, execution_id: Uuid, boundary: NodeIndex) -> bool {
        let Some(interrupting) = self.monitor.fire(&self.graph, execution_id, boundary) else {
            return false;
        };
        let Some(exec) = self.executions.get(&execution_id) else { return false };
        let host_token = exec.token_id;
        let boundary_id = self.graph.node(boundary).id.clone();
        info!(execution_id = %execution_id, boundary = %boundary_id, interrupting, "Boundary fired");

        self.events.publish(EventRecord::new(EventKind::BoundaryFired)
            .node(&boundary_id)
            .execution(execution_id)
            .token(host_token)
            .payload(json!({
                "task": self.graph.node(exec.task).id,
                "interrupting": interrupting,
            })));

        if interrupting {
            if let Some(exec) = self.executions.get_mut(&execution_id) {
                exec.interrupted_by = Some(boundary);
            }
            self.request_cancel(execution_id);
        } else {
            let lineage = self.tokens.get(&host_token).map(|t| t.parent_lineage.clone()).unwrap_or_default();
            let token = self.spawn_token(boundary, lineage, json!({
                "origin": "boundary",
                "host": host_token,
            }));
            self.agenda.push_back(Step::Arrive { token, node: boundary });
        }
        true
    }

    fn request_cancel(&mut self, execution_id: Uuid) -> CancelDisposition {
        let Some(exec) = self.executions.get_mut(&execution_id) else {
            debug!(execution_id = %execution_id, "Cancel for resolved execution ignored");
            return CancelDisposition::Ignored;
        };
        let disposition = self.runner.request_cancel(exec);
        debug!(execution_id = %execution_id, disposition = ?disposition, "Cancel requested");
        match disposition {
            CancelDisposition::Signalled => {
                // a cancel on its way resolves the task; no boundary may fire after it
                self.monitor.disarm(execution_id);
            }
            CancelDisposition::Queued => {
                // affordance stays visible while the cancel waits for a safe point
                if let Some(exec) = self.executions.get(&execution_id) {
                    let record = self.task_record(EventKind::TaskCancellable, exec).payload(json!({ "pending": true }));
                    self.events.publish(record);
                }
            }
            CancelDisposition::AlreadyRequested | CancelDisposition::Ignored => {}
        }
        disposition
    }

    fn resolve(&mut self, execution_id: Uuid, outcome: TaskOutcome) {
        let Some(mut exec) = self.executions.remove(&execution_id) else {
            debug!(execution_id = %execution_id, "Outcome for unknown execution dropped");
            return;
        };
        self.runner.release(execution_id);
        self.monitor.disarm(execution_id);

        let graph = self.graph.clone();
        let task = graph.node(exec.task);

        match outcome {
            TaskOutcome::Completed { result, attempts, degraded } => {
                self.transition(&mut exec, ExecutionStatus::Completed);
                if let NodeKind::Task(TaskSpec { output: Some(out), .. }) = &task.kind {
                    self.ctx.set_var(out, result.clone());
                }
                let record = self.task_record(EventKind::TaskCompleted, &exec)
                    .payload(json!({ "result": result, "attempts": attempts, "degraded": degraded }));
                self.events.publish(record);
                self.cancel_failed(&exec, "task completed before the cancellation took effect");
                self.agenda.push_back(Step::Leave { token: exec.token_id, node: exec.task });
            }
            TaskOutcome::Cancelled => {
                self.transition(&mut exec, ExecutionStatus::Cancelled);
                let boundary_id = exec.interrupted_by.map(|b| graph.node(b).id.clone());
                let record = self.task_record(EventKind::TaskCancelled, &exec).payload(json!({
                    "cause": if boundary_id.is_some() { "boundary" } else { "user" },
                    "boundary": boundary_id,
                }));
                self.events.publish(record);
                match exec.interrupted_by {
                    Some(boundary) => self.agenda.push_back(Step::Arrive { token: exec.token_id, node: boundary }),
                    None => self.cancel_token(exec.token_id, CancelCause::User),
                }
            }
            TaskOutcome::Failed(failure) => {
                self.transition(&mut exec, ExecutionStatus::Failed);
                let record = self.task_record(EventKind::TaskFailed, &exec).payload(failure_payload(&failure));
                self.events.publish(record);
                self.cancel_failed(&exec, "task failed before the cancellation took effect");
                self.route_failure(&exec, &task.id, failure);
            }
        }
    }

    fn route_failure(&mut self, exec: &TaskExecution, task_id: &str, failure: TaskFailure) {
        match BoundaryMonitor::error_boundary_for(&self.graph, exec.task, &failure) {
            Some(boundary) => {
                let boundary_id = self.graph.node(boundary).id.clone();
                info!(execution_id = %exec.id, boundary = %boundary_id, code = failure.error_code(), "Error boundary caught task failure");
                self.events.publish(EventRecord::new(EventKind::BoundaryFired)
                    .node(&boundary_id)
                    .execution(exec.id)
                    .token(exec.token_id)
                    .payload(json!({
                        "task": task_id,
                        "interrupting": true,
                        "error": failure.error_code(),
                    })));
                self.ctx.set_var(&format!("{}_error", task_id), failure_payload(&failure));
                self.agenda.push_back(Step::Arrive { token: exec.token_id, node: boundary });
            }
            None => {
                warn!(execution_id = %exec.id, task = task_id, kind = %failure.kind, error = %failure.message, "Unhandled task failure cancels its branch");
                self.events.publish(EventRecord::new(EventKind::SessionFault)
                    .node(task_id)
                    .execution(exec.id)
                    .token(exec.token_id)
                    .payload(json!({
                        "error": "task-failed",
                        "kind": failure.kind,
                        "message": failure.message,
                    })));
                self.cancel_token(exec.token_id, CancelCause::Failure);
            }
        }
    }

    fn cancel_failed(&mut self, exec: &TaskExecution, reason: &str) {
        if exec.cancel_requested() {
            let record = self.task_record(EventKind::TaskCancelFailed, exec).payload(json!({ "reason": reason }));
            self.events.publish(record);
        }
    }

    fn transition(&self, exec: &mut TaskExecution, to: ExecutionStatus) {
        if let Err(e) = exec.transition(to) {
            warn!(execution_id = %exec.id, error = %e, "Unexpected task transition");
        }
    }

    fn task_record(&self, kind: EventKind, exec: &TaskExecution) -> EventRecord {
        EventRecord::new(kind)
            .node(&self.graph.node(exec.task).id)
            .execution(exec.id)
            .token(exec.token_id)
    }
}

fn failure_payload(failure: &TaskFailure) -> Value {
    json!({
        "kind": failure.kind,
        "message": failure.message,
        "code": failure.error_code(),
        "attempts": failure.attempts,
        "partial": failure.partial,
    })
}
