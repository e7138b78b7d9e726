use std::collections::HashMap;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;
use crate::handlers::TaskFailure;
use crate::runtime::execution::TaskExecution;
use crate::runtime::graph::{NodeIndex, ProcessGraph, Trigger};
use crate::runtime::notice::Notice;

/// Lifecycle of one execution's watch. An execution with no watch is unarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Armed,
    Fired,
    Disarmed,
}

#[derive(Debug)]
pub struct BoundaryArm {
    pub boundary: NodeIndex,
    pub execution_id: Uuid,
    pub armed_at: DateTime<Utc>,
    pub fired: bool,
    timer: Option<JoinHandle<()>>,
}

impl BoundaryArm {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug)]
struct Watch {
    state: MonitorState,
    arms: Vec<BoundaryArm>,
}

/// Per-execution boundary arms. Driven by the scheduler; the only thing it
/// does on its own is post `TimerElapsed` notices.
pub struct BoundaryMonitor {
    watches: HashMap<Uuid, Watch>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl BoundaryMonitor {
    pub fn new(notices: mpsc::UnboundedSender<Notice>) -> Self {
        Self { watches: HashMap::new(), notices }
    }

    /// Arms timer, signal and escalation boundaries of the execution's task.
    /// Error boundaries are matched against the outcome instead.
    pub fn arm(&mut self, graph: &ProcessGraph, execution: &TaskExecution) -> Vec<NodeIndex> {
        let mut arms = Vec::new();
        for &boundary in graph.boundaries_of(execution.task) {
            let Some(spec) = graph.boundary_spec(boundary) else { continue };
            let timer = match &spec.trigger {
                Trigger::Error(_) => continue,
                Trigger::Timer(duration) => {
                    let notices = self.notices.clone();
                    let duration = *duration;
                    let execution_id = execution.id;
                    Some(tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        let _ = notices.send(Notice::TimerElapsed { execution_id, boundary });
                    }))
                }
                Trigger::Signal(_) | Trigger::Escalation(_) => None,
            };
            arms.push(BoundaryArm {
                boundary,
                execution_id: execution.id,
                armed_at: Utc::now(),
                fired: false,
                timer,
            });
        }

        let armed = arms.iter().map(|a| a.boundary).collect();
        if !arms.is_empty() {
            self.watches.insert(execution.id, Watch { state: MonitorState::Armed, arms });
        }
        armed
    }

    pub fn is_armed(&self, execution_id: Uuid, boundary: NodeIndex) -> bool {
        self.watches.get(&execution_id)
            .filter(|w| w.state == MonitorState::Armed)
            .is_some_and(|w| w.arms.iter().any(|a| a.boundary == boundary && !a.fired))
    }

    pub fn signal_targets(&self, graph: &ProcessGraph, name: &str) -> Vec<(Uuid, NodeIndex)> {
        let mut targets: Vec<_> = self.armed_where(graph, |trigger| matches!(trigger, Trigger::Signal(n) if n == name))
            .collect();
        // HashMap order is arbitrary; keep firing order stable
        targets.sort_by_key(|(_, b)| *b);
        targets
    }

    pub fn escalation_targets(&self, graph: &ProcessGraph, execution_id: Uuid, code: &str) -> Vec<NodeIndex> {
        self.armed_where(graph, |trigger| match trigger {
            Trigger::Escalation(None) => true,
            Trigger::Escalation(Some(c)) => c == code,
            _ => false,
        })
        .filter(|(exec, _)| *exec == execution_id)
        .map(|(_, b)| b)
        .collect()
    }

    fn armed_where<'a, F>(&'a self, graph: &'a ProcessGraph, pred: F) -> impl Iterator<Item = (Uuid, NodeIndex)> + 'a
    where
        F: Fn(&Trigger) -> bool + 'a,
    {
        self.watches.iter()
            .filter(|(_, w)| w.state == MonitorState::Armed)
            .flat_map(|(exec, w)| w.arms.iter().map(move |a| (*exec, a)))
            .filter(move |(_, a)| !a.fired && graph.boundary_spec(a.boundary).is_some_and(|s| pred(&s.trigger)))
            .map(|(exec, a)| (exec, a.boundary))
    }

    /// Marks the arm fired. Returns `Some(interrupting)` if it was armed.
    /// An interrupting firing disarms every other arm of the execution; a
    /// non-interrupting one only retires itself.
    pub fn fire(&mut self, graph: &ProcessGraph, execution_id: Uuid, boundary: NodeIndex) -> Option<bool> {
        if !self.is_armed(execution_id, boundary) {
            return None;
        }
        let interrupting = graph.boundary_spec(boundary)?.interrupting;
        let watch = self.watches.get_mut(&execution_id)?;

        if interrupting {
            watch.state = MonitorState::Fired;
            for arm in watch.arms.iter_mut() {
                arm.cancel_timer();
                arm.fired = arm.boundary == boundary;
            }
        } else if let Some(arm) = watch.arms.iter_mut().find(|a| a.boundary == boundary) {
            arm.cancel_timer();
            arm.fired = true;
        }
        Some(interrupting)
    }

    /// Drops all arms once the execution resolves. A fired watch stays `Fired`.
    pub fn disarm(&mut self, execution_id: Uuid) {
        if let Some(watch) = self.watches.get_mut(&execution_id) {
            let live = watch.arms.iter().filter(|a| !a.fired).count();
            for arm in watch.arms.iter_mut() {
                arm.cancel_timer();
            }
            watch.arms.clear();
            if watch.state == MonitorState::Armed {
                watch.state = MonitorState::Disarmed;
            }
            debug!(execution_id = %execution_id, live, state = ?watch.state, "Boundary arms released");
        }
    }

    /// Error boundary resolving a failed task: exact code match wins over a
    /// catch-all, then declaration order.
    pub fn error_boundary_for(graph: &ProcessGraph, task: NodeIndex, failure: &TaskFailure) -> Option<NodeIndex> {
        let candidates = || graph.boundaries_of(task).iter().copied().filter_map(|b| {
            match &graph.boundary_spec(b)?.trigger {
                Trigger::Error(code) => Some((b, code.as_deref())),
                _ => None,
            }
        });

        candidates()
            .find(|(_, code)| code.is_some() && failure.matches_code(*code))
            .or_else(|| candidates().find(|(_, code)| code.is_none()))
            .map(|(b, _)| b)
    }
}

impl Drop for BoundaryMonitor {
    fn drop(&mut self) {
        for watch in self.watches.values_mut() {
            for arm in watch.arms.iter_mut() {
                arm.cancel_timer();
            }
        }
    }
}
