use crate::dsl::{Process, Node, NodeType, BoundaryTrigger};
use crate::runtime::graph::{
    BoundarySpec, Condition, GraphEdge, GraphError, GraphNode, NodeIndex, NodeKind, ProcessGraph,
    TaskSpec, Trigger, parse_duration,
};
use crate::compiler::expander::Expander;
use evalexpr::build_operator_tree;
use std::collections::HashMap;
use serde_json::Value;

pub struct Compiler {
    id_map: HashMap<String, NodeIndex>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            id_map: HashMap::new(),
        }
    }

    pub fn compile(&mut self, raw_process: Process) -> Result<ProcessGraph, GraphError> {
        self.id_map.clear();

        // 0. Expand authoring sugar
        let process = Expander::new().expand(raw_process)?;

        // 1. Indexing
        for (idx, node) in process.nodes.iter().enumerate() {
            if self.id_map.insert(node.id.clone(), idx).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        // 2. Nodes
        let mut nodes = Vec::with_capacity(process.nodes.len());
        for node in &process.nodes {
            nodes.push(self.transform_node(node, &process)?);
        }

        // 3. Flows
        let mut edges = Vec::with_capacity(process.edges.len());
        let mut defaults: HashMap<NodeIndex, usize> = HashMap::new();
        for edge in &process.edges {
            let source = self.resolve_target(&edge.source)?;
            let target = self.resolve_target(&edge.target)?;

            if matches!(nodes[target].kind, NodeKind::Boundary(_)) {
                return Err(GraphError::BoundaryHasIncoming(edge.target.clone()));
            }

            let condition = match &edge.condition {
                Some(raw) => {
                    let clean = raw.replace("${", "").replace('}', "");
                    let tree = build_operator_tree(&clean).map_err(|e| GraphError::InvalidCondition {
                        from: edge.source.clone(),
                        target: edge.target.clone(),
                        reason: e.to_string(),
                    })?;
                    Some(Condition { raw: clean, tree })
                }
                None => None,
            };

            if condition.is_none() && matches!(nodes[source].kind, NodeKind::ExclusiveGateway) {
                let count = defaults.entry(source).or_default();
                *count += 1;
                if *count > 1 {
                    return Err(GraphError::AmbiguousDefault(edge.source.clone()));
                }
            }

            edges.push(GraphEdge { source, target, condition });
        }

        if !nodes.iter().any(|n| matches!(n.kind, NodeKind::Start)) {
            return Err(GraphError::MissingStart(process.id.clone()));
        }

        Ok(ProcessGraph::from_parts(
            process.id,
            process.name,
            process.variables,
            nodes,
            edges,
        ))
    }

    fn transform_node(&self, node: &Node, process: &Process) -> Result<GraphNode, GraphError> {
        let kind = match &node.kind {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::ExclusiveGateway => NodeKind::ExclusiveGateway,
            NodeType::ParallelGateway => NodeKind::ParallelGateway,
            NodeType::Task { handler, params, output } => NodeKind::Task(TaskSpec {
                handler: handler.clone(),
                params: Value::Object(params.clone().into_iter().collect()),
                output: output.clone(),
            }),
            NodeType::Boundary { attached_to, interrupting, trigger } => {
                let host = self.id_map.get(attached_to)
                    .copied()
                    .filter(|idx| matches!(process.nodes[*idx].kind, NodeType::Task { .. }))
                    .ok_or_else(|| GraphError::InvalidAttachment {
                        boundary: node.id.clone(),
                        attached_to: attached_to.clone(),
                    })?;

                let compiled = match trigger {
                    BoundaryTrigger::Timer { duration } => {
                        let d = parse_duration(duration).ok_or_else(|| GraphError::InvalidTimer {
                            boundary: node.id.clone(),
                            duration: duration.clone(),
                        })?;
                        Trigger::Timer(d)
                    }
                    BoundaryTrigger::Error { code } => Trigger::Error(non_empty(code)),
                    BoundaryTrigger::Signal { name } => Trigger::Signal(name.clone()),
                    BoundaryTrigger::Escalation { code } => Trigger::Escalation(non_empty(code)),
                };

                // the host task has already failed when an error boundary fires
                let interrupting = matches!(compiled, Trigger::Error(_))
                    || interrupting.unwrap_or_else(|| trigger.interrupting_by_default());

                NodeKind::Boundary(BoundarySpec {
                    attached_to: host,
                    interrupting,
                    trigger: compiled,
                })
            }
            NodeType::Parallel { .. } => {
                return Err(GraphError::UnknownNode(format!("{} (unexpanded parallel block)", node.id)));
            }
        };

        Ok(GraphNode { id: node.id.clone(), kind })
    }

    fn resolve_target(&self, target_id: &str) -> Result<NodeIndex, GraphError> {
        self.id_map.get(target_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(target_id.to_string()))
    }
}

fn non_empty(code: &Option<String>) -> Option<String> {
    code.as_ref().filter(|c| !c.is_empty()).cloned()
}
