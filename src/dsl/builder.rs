use crate::dsl::{Process, Node, Edge, NodeType, Branch, BoundaryTrigger};
use std::collections::HashMap;
use serde_json::Value;

pub struct ProcessBuilder {
    id: String,
    name: String,
    variables: HashMap<String, Value>,
    pub nodes: Vec<Node>, // public so tests can splice nodes by hand
    edges: Vec<Edge>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            variables: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeType::Start)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeType::End)
    }

    pub fn exclusive(self, id: &str) -> Self {
        self.node(id, NodeType::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.node(id, NodeType::ParallelGateway)
    }

    pub fn task(self, id: &str, handler: &str) -> TaskBuilder {
        TaskBuilder {
            process_builder: self,
            id: id.to_string(),
            handler: handler.to_string(),
            params: HashMap::new(),
            output: None,
        }
    }

    /// Adds a parallel block; each inner vec is one linear branch.
    pub fn parallel(self, id: &str, branches: Vec<Vec<Node>>) -> Self {
        let branches = branches.into_iter()
            .map(|nodes| Branch { nodes })
            .collect();
        self.node(id, NodeType::Parallel { branches })
    }

    pub fn timer_boundary(self, id: &str, attached_to: &str, duration: &str, interrupting: bool) -> Self {
        self.boundary(id, attached_to, Some(interrupting), BoundaryTrigger::Timer {
            duration: duration.to_string(),
        })
    }

    pub fn error_boundary(self, id: &str, attached_to: &str, code: Option<&str>) -> Self {
        self.boundary(id, attached_to, None, BoundaryTrigger::Error {
            code: code.map(str::to_string),
        })
    }

    pub fn signal_boundary(self, id: &str, attached_to: &str, name: &str, interrupting: bool) -> Self {
        self.boundary(id, attached_to, Some(interrupting), BoundaryTrigger::Signal {
            name: name.to_string(),
        })
    }

    pub fn escalation_boundary(self, id: &str, attached_to: &str, code: Option<&str>, interrupting: bool) -> Self {
        self.boundary(id, attached_to, Some(interrupting), BoundaryTrigger::Escalation {
            code: code.map(str::to_string),
        })
    }

    pub fn boundary(self, id: &str, attached_to: &str, interrupting: Option<bool>, trigger: BoundaryTrigger) -> Self {
        self.node(id, NodeType::Boundary {
            attached_to: attached_to.to_string(),
            interrupting,
            trigger,
        })
    }

    pub fn node(mut self, id: &str, kind: NodeType) -> Self {
        self.nodes.push(Node { id: id.to_string(), kind });
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        });
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(condition.to_string()),
        });
        self
    }

    pub fn build(self) -> Process {
        Process {
            id: self.id,
            name: self.name,
            variables: self.variables,
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

pub struct TaskBuilder {
    process_builder: ProcessBuilder,
    id: String,
    handler: String,
    params: HashMap<String, Value>,
    output: Option<String>,
}

impl TaskBuilder {
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn output(mut self, var_name: &str) -> Self {
        self.output = Some(var_name.to_string());
        self
    }

    pub fn build(mut self) -> ProcessBuilder {
        self.process_builder.nodes.push(Node {
            id: self.id,
            kind: NodeType::Task {
                handler: self.handler,
                params: self.params,
                output: self.output,
            },
        });
        self.process_builder
    }
}

/// Shorthand for a task node, handy when assembling `Parallel` branches.
pub fn task_node(id: &str, handler: &str, params: HashMap<String, Value>) -> Node {
    Node {
        id: id.to_string(),
        kind: NodeType::Task {
            handler: handler.to_string(),
            params,
            output: None,
        },
    }
}
