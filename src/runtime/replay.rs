use std::collections::{HashMap, VecDeque};
use serde_json::Value;
use crate::runtime::event::{EventKind, ProcessEvent};

/// Recorded task results, consumed in order per node ID. A task resolved
/// from the journal never runs, never becomes cancellable and never arms
/// boundaries.
#[derive(Debug, Clone, Default)]
pub struct ReplayJournal {
    outcomes: HashMap<String, VecDeque<Value>>,
}

impl ReplayJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects `task.completed` and `task.replayed` results of a prior run.
    pub fn from_events(events: &[ProcessEvent]) -> Self {
        let mut journal = Self::new();
        for event in events {
            if !matches!(event.kind, EventKind::TaskCompleted | EventKind::TaskReplayed) {
                continue;
            }
            if let Some(node_id) = &event.node_id {
                let result = event.payload.get("result").cloned().unwrap_or(Value::Null);
                journal.record(node_id, result);
            }
        }
        journal
    }

    pub fn record(&mut self, node_id: &str, result: Value) {
        self.outcomes.entry(node_id.to_string()).or_default().push_back(result);
    }

    pub fn take(&mut self, node_id: &str) -> Option<Value> {
        self.outcomes.get_mut(node_id).and_then(|q| q.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.values().all(|q| q.is_empty())
    }
}
