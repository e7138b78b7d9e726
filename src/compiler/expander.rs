use crate::dsl::{Process, Node, NodeType, Edge, Branch};
use crate::runtime::graph::GraphError;
use std::collections::HashSet;

/// Rewrites `Parallel` blocks into explicit split/join gateway pairs.
pub struct Expander {}

impl Expander {
    pub fn new() -> Self {
        Self {}
    }

    pub fn expand(&self, process: Process) -> Result<Process, GraphError> {
        let mut new_nodes = Vec::new();
        let mut new_edges = process.edges.clone();

        for node in process.nodes {
            if let NodeType::Parallel { branches } = node.kind {
                self.expand_parallel(node.id, branches, &mut new_nodes, &mut new_edges);
            } else {
                new_nodes.push(node);
            }
        }

        let mut seen = HashSet::new();
        for node in &new_nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        Ok(Process {
            nodes: new_nodes,
            edges: new_edges,
            ..process
        })
    }

    fn expand_parallel(
        &self,
        parallel_id: String,
        branches: Vec<Branch>,
        new_nodes: &mut Vec<Node>,
        new_edges: &mut Vec<Edge>,
    ) {
        let split_id = format!("{}_split", parallel_id);
        let join_id = format!("{}_join", parallel_id);

        // incoming flows enter the split, outgoing flows leave the join
        for edge in new_edges.iter_mut() {
            if edge.target == parallel_id {
                edge.target = split_id.clone();
            }
            if edge.source == parallel_id {
                edge.source = join_id.clone();
            }
        }

        new_nodes.push(Node { id: split_id.clone(), kind: NodeType::ParallelGateway });
        new_nodes.push(Node { id: join_id.clone(), kind: NodeType::ParallelGateway });

        for branch in branches {
            let (Some(head), Some(tail)) = (branch.nodes.first(), branch.nodes.last()) else {
                continue;
            };
            new_edges.push(plain_edge(&split_id, &head.id));
            new_edges.push(plain_edge(&tail.id, &join_id));

            for pair in branch.nodes.windows(2) {
                new_edges.push(plain_edge(&pair[0].id, &pair[1].id));
            }
            new_nodes.extend(branch.nodes);
        }
    }
}

fn plain_edge(source: &str, target: &str) -> Edge {
    Edge {
        source: source.to_string(),
        target: target.to_string(),
        condition: None,
    }
}
