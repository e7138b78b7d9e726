use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::runtime::graph::NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Pending,
    Running,
    WaitingForJoin,
    Completed,
    Cancelled,
}

impl TokenState {
    pub fn is_live(&self) -> bool {
        matches!(self, TokenState::Pending | TokenState::Running | TokenState::WaitingForJoin)
    }
}

/// Why a token ended `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelCause {
    /// Task failure with no matching error boundary, or no viable gateway path.
    Failure,
    User,
    JoinUnreachable,
}

/// One level of parallel split ancestry. A join matches tokens on the
/// innermost frame: same splitting token, one arrival per branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFrame {
    pub split_token: Uuid,
    pub gateway: NodeIndex,
    pub branch: usize,
    pub of: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub current_node: NodeIndex,
    pub state: TokenState,
    pub parent_lineage: Vec<SplitFrame>,
    pub cancel_cause: Option<CancelCause>,
}

impl Token {
    pub fn new(current_node: NodeIndex, parent_lineage: Vec<SplitFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            current_node,
            state: TokenState::Pending,
            parent_lineage,
            cancel_cause: None,
        }
    }

    pub fn innermost_split(&self) -> Option<&SplitFrame> {
        self.parent_lineage.last()
    }
}
