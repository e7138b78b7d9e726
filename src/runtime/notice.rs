use serde_json::Value;
use uuid::Uuid;
use crate::handlers::TaskFailure;
use crate::runtime::graph::NodeIndex;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        result: Value,
        attempts: u32,
        /// Produced by the handler's fallback path.
        degraded: bool,
    },
    Cancelled,
    Failed(TaskFailure),
}

/// Messages posted to the scheduler by task workers and boundary timers.
/// Posting never mutates engine state; the scheduler applies them in order.
#[derive(Debug)]
pub enum Notice {
    Cancellable { execution_id: Uuid },
    Progress { execution_id: Uuid, chunk: Value },
    Escalation { execution_id: Uuid, code: String },
    Outcome { execution_id: Uuid, outcome: TaskOutcome },
    TimerElapsed { execution_id: Uuid, boundary: NodeIndex },
}
