use std::collections::HashMap;
use std::time::Duration;
use evalexpr::Node as EvalNode;
use serde_json::Value;
use thiserror::Error;

pub type NodeIndex = usize;
pub type EdgeIndex = usize;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("node not found: {0}")]
    UnknownNode(String),
    #[error("duplicate node ID: {0}")]
    DuplicateNode(String),
    #[error("process '{0}' has no start event")]
    MissingStart(String),
    #[error("boundary '{boundary}' must be attached to a task, got '{attached_to}'")]
    InvalidAttachment { boundary: String, attached_to: String },
    #[error("boundary '{0}' cannot have incoming sequence flows")]
    BoundaryHasIncoming(String),
    #[error("invalid condition on flow {from} -> {target}: {reason}")]
    InvalidCondition { from: String, target: String, reason: String },
    #[error("invalid timer duration '{duration}' on boundary '{boundary}'")]
    InvalidTimer { boundary: String, duration: String },
    #[error("exclusive gateway '{0}' has more than one default flow")]
    AmbiguousDefault(String),
    #[error("node '{0}' is not a boundary event")]
    NotABoundary(String),
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub handler: String,
    pub params: Value,
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Timer(Duration),
    /// `None` catches any error.
    Error(Option<String>),
    Signal(String),
    Escalation(Option<String>),
}

impl Trigger {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Trigger::Timer(_) => "timer",
            Trigger::Error(_) => "error",
            Trigger::Signal(_) => "signal",
            Trigger::Escalation(_) => "escalation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundarySpec {
    pub attached_to: NodeIndex,
    pub interrupting: bool,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    Task(TaskSpec),
    ExclusiveGateway,
    ParallelGateway,
    Boundary(BoundarySpec),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
}

/// Pre-compiled sequence flow condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub raw: String,
    pub tree: EvalNode,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub condition: Option<Condition>,
}

/// Immutable, validated process graph. Built by the compiler, shared via `Arc`.
#[derive(Debug)]
pub struct ProcessGraph {
    pub id: String,
    pub name: String,
    pub variables: HashMap<String, Value>,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    index: HashMap<String, NodeIndex>,
    outgoing: Vec<Vec<EdgeIndex>>,
    incoming: Vec<usize>,
    // task index -> attached boundary indices, derived once from `attached_to`
    boundaries: Vec<Vec<NodeIndex>>,
    starts: Vec<NodeIndex>,
}

impl ProcessGraph {
    /// Assembles the lookup indexes. Callers (the compiler) have already
    /// validated node references.
    pub(crate) fn from_parts(
        id: String,
        name: String,
        variables: HashMap<String, Value>,
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
    ) -> Self {
        let index = nodes.iter()
            .enumerate()
            .map(|(idx, n)| (n.id.clone(), idx))
            .collect();

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![0; nodes.len()];
        for (edge_idx, edge) in edges.iter().enumerate() {
            outgoing[edge.source].push(edge_idx);
            incoming[edge.target] += 1;
        }

        let mut boundaries = vec![Vec::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            if let NodeKind::Boundary(spec) = &node.kind {
                boundaries[spec.attached_to].push(idx);
            }
        }

        let starts = nodes.iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Start))
            .map(|(idx, _)| idx)
            .collect();

        Self { id, name, variables, nodes, edges, index, outgoing, incoming, boundaries, starts }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn resolve(&self, node_id: &str) -> Result<NodeIndex, GraphError> {
        self.index.get(node_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn edge(&self, idx: EdgeIndex) -> &GraphEdge {
        &self.edges[idx]
    }

    pub fn start_nodes(&self) -> &[NodeIndex] {
        &self.starts
    }

    /// Outgoing flows of a node, in declared order.
    pub fn outgoing(&self, idx: NodeIndex) -> impl Iterator<Item = &GraphEdge> {
        self.outgoing[idx].iter().map(|e| &self.edges[*e])
    }

    pub fn incoming_count(&self, idx: NodeIndex) -> usize {
        self.incoming[idx]
    }

    pub fn boundaries_of(&self, task: NodeIndex) -> &[NodeIndex] {
        &self.boundaries[task]
    }

    pub fn boundary_spec(&self, idx: NodeIndex) -> Option<&BoundarySpec> {
        match &self.nodes[idx].kind {
            NodeKind::Boundary(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Result<Vec<&GraphEdge>, GraphError> {
        let idx = self.resolve(node_id)?;
        Ok(self.outgoing(idx).collect())
    }

    pub fn boundary_events_for(&self, task_id: &str) -> Result<Vec<&str>, GraphError> {
        let idx = self.resolve(task_id)?;
        Ok(self.boundaries[idx].iter().map(|b| self.nodes[*b].id.as_str()).collect())
    }

    pub fn is_interrupting(&self, boundary_id: &str) -> Result<bool, GraphError> {
        let idx = self.resolve(boundary_id)?;
        self.boundary_spec(idx)
            .map(|spec| spec.interrupting)
            .ok_or_else(|| GraphError::NotABoundary(boundary_id.to_string()))
    }
}

/// Parses `500ms`, `30s`, `5m`, `1h` and ISO-8601 `PT1H2M3.5S` durations.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if let Some(iso) = s.strip_prefix("PT").or_else(|| s.strip_prefix("pt")) {
        return parse_iso_time(iso);
    }

    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (amount, unit) = s.split_at(split);
    let amount: f64 = amount.parse().ok()?;
    let secs = match unit.trim() {
        "ms" => amount / 1000.0,
        "s" => amount,
        "m" => amount * 60.0,
        "h" => amount * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_iso_time(body: &str) -> Option<Duration> {
    if body.is_empty() {
        return None;
    }
    let mut secs = 0.0;
    let mut number = String::new();
    for c in body.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'H' | 'M' | 'S' => {
                let value: f64 = number.parse().ok()?;
                number.clear();
                secs += match c {
                    'H' => value * 3600.0,
                    'M' => value * 60.0,
                    _ => value,
                };
            }
            _ => return None,
        }
    }
    if !number.is_empty() {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
