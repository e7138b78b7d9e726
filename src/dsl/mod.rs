pub mod builder;

use std::collections::HashMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;

/// Process definition as authored (YAML or builder), before compilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Process {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NodeType {
    Start,
    End,
    Task {
        handler: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        #[serde(default)]
        output: Option<String>,
    },
    ExclusiveGateway,
    ParallelGateway,
    Boundary {
        attached_to: String,
        /// Defaults to `true`, except for escalations.
        #[serde(default)]
        interrupting: Option<bool>,
        trigger: BoundaryTrigger,
    },
    /// Authoring sugar, rewritten into a split/join gateway pair by the expander.
    Parallel {
        branches: Vec<Branch>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum BoundaryTrigger {
    Timer {
        duration: String,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
    },
    Signal {
        name: String,
    },
    Escalation {
        #[serde(default)]
        code: Option<String>,
    },
}

impl BoundaryTrigger {
    pub fn interrupting_by_default(&self) -> bool {
        !matches!(self, BoundaryTrigger::Escalation { .. })
    }
}

/// A linear chain of nodes inside a `Parallel` block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}
