use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use crate::runtime::graph::NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    RunningNotCancellable,
    Cancellable,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One task run for one token. `status` is the single authoritative state;
/// only the scheduler mutates it.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task: NodeIndex,
    pub token_id: Uuid,
    status: ExecutionStatus,
    cancel_requested: bool,
    /// Interrupting boundary that requested the cancel, if any.
    pub interrupted_by: Option<NodeIndex>,
}

impl TaskExecution {
    pub fn new(task: NodeIndex, token_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            token_id,
            status: ExecutionStatus::RunningNotCancellable,
            cancel_requested: false,
            interrupted_by: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Monotonic: returns `false` if cancellation was already requested.
    pub fn request_cancel(&mut self) -> bool {
        !std::mem::replace(&mut self.cancel_requested, true)
    }

    /// Whether a cancel affordance should be visible for this execution.
    pub fn shows_cancel_affordance(&self) -> bool {
        match self.status {
            ExecutionStatus::Cancellable => true,
            ExecutionStatus::RunningNotCancellable => self.cancel_requested,
            _ => false,
        }
    }

    pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), InvalidTransition> {
        use ExecutionStatus::*;
        let allowed = match (self.status, to) {
            (RunningNotCancellable, Cancellable) => true,
            (RunningNotCancellable | Cancellable, Completed | Failed) => true,
            // cancellation only takes effect once the task is interruptible
            (Cancellable, Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }
}
