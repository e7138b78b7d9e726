use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;
use crate::runtime::context::Context;
use crate::runtime::graph::{NodeIndex, ProcessGraph};
use crate::runtime::token::{SplitFrame, Token};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("no outgoing flow of exclusive gateway '{gateway}' matched and no default flow exists")]
    NoMatchingPath { gateway: String },
}

// --- EXCLUSIVE GATEWAY ---

/// First flow (declared order) whose condition holds, else the default
/// (unconditioned) flow.
pub fn select_exclusive(graph: &ProcessGraph, gateway: NodeIndex, ctx: &Context) -> Result<NodeIndex, FlowError> {
    let mut default = None;
    for edge in graph.outgoing(gateway) {
        match &edge.condition {
            Some(cond) => {
                if ctx.eval_condition(&cond.raw, &cond.tree) {
                    return Ok(edge.target);
                }
            }
            None => {
                default.get_or_insert(edge.target);
            }
        }
    }
    default.ok_or_else(|| FlowError::NoMatchingPath {
        gateway: graph.node(gateway).id.clone(),
    })
}

// --- PARALLEL JOIN ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct JoinKey {
    join: NodeIndex,
    /// Splitting token of the innermost lineage frame; `None` for tokens
    /// that did not come from a split (counted per incoming flow).
    split: Option<Uuid>,
}

#[derive(Debug, Default)]
struct PendingJoin {
    expected: usize,
    arrived: BTreeMap<usize, Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinArrival {
    Waiting,
    /// Another token already holds this branch's slot.
    Duplicate,
    Resolved {
        absorbed: Vec<Uuid>,
        lineage: Vec<SplitFrame>,
    },
}

/// Join bookkeeping. Arrival order is irrelevant, only completeness.
#[derive(Debug, Default)]
pub struct JoinTable {
    pending: HashMap<JoinKey, PendingJoin>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `incoming` caps the expectation: branches of the split that never
    /// flow into this join are not waited for.
    pub fn arrive(&mut self, join: NodeIndex, incoming: usize, token: &Token) -> JoinArrival {
        let frame = token.innermost_split();
        let key = JoinKey { join, split: frame.map(|f| f.split_token) };

        let pending = self.pending.entry(key).or_insert_with(|| PendingJoin {
            expected: frame.map_or(incoming, |f| f.of.min(incoming)).max(1),
            arrived: BTreeMap::new(),
        });

        let slot = match frame {
            Some(f) => f.branch,
            None => pending.arrived.len(),
        };
        if pending.arrived.contains_key(&slot) {
            return JoinArrival::Duplicate;
        }
        pending.arrived.insert(slot, token.id);

        if pending.arrived.len() < pending.expected {
            return JoinArrival::Waiting;
        }

        let resolved = self.pending.remove(&key).unwrap_or_default();
        let mut lineage = token.parent_lineage.clone();
        if frame.is_some() {
            lineage.pop();
        }
        JoinArrival::Resolved {
            absorbed: resolved.arrived.into_values().collect(),
            lineage,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forgets every incomplete join, returning the tokens that were waiting.
    pub fn drain_waiting(&mut self) -> Vec<(NodeIndex, Uuid)> {
        let mut waiting: Vec<_> = self.pending.drain()
            .flat_map(|(key, p)| p.arrived.into_values().map(move |t| (key.join, t)))
            .collect();
        waiting.sort();
        waiting
    }
}
