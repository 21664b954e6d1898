//! Core types for the agent tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetError;
use crate::tools::GatewayError;

const MAX_SLUG_LEN: usize = 48;

/// Human-legible node identifier.
///
/// The `/`-joined path of slugs from the root, so it is unique tree-wide:
/// `build-api/write-tests_2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Id of a root node for `description`.
    pub fn root(description: &str) -> Self {
        Self(slugify(description))
    }

    /// Id of a child of `self` with an already de-duplicated `name`.
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}/{}", self.0, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Depth implied by the path (root is 0).
    pub fn depth(&self) -> u32 {
        self.0.matches('/').count() as u32
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.0.rsplit_once('/').map(|(p, _)| NodeId(p.to_string()))
    }

    /// Whether `self` is `other` or lies beneath it.
    pub fn is_within(&self, other: &NodeId) -> bool {
        self == other
            || (self.0.len() > other.0.len()
                && self.0.starts_with(&other.0)
                && self.0.as_bytes()[other.0.len()] == b'/')
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase ASCII slug of a task description.
///
/// Runs of non-alphanumeric characters collapse into one `-` and the result
/// is cut to at most 48 characters. Empty input yields `task`.
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(description.len().min(MAX_SLUG_LEN));
    let mut pending_dash = false;

    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                if slug.len() + 1 >= MAX_SLUG_LEN {
                    break;
                }
                slug.push('-');
            }
            pending_dash = false;
            if slug.len() >= MAX_SLUG_LEN {
                break;
            }
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Assigns sibling names in spawn order.
///
/// The first occurrence of a slug keeps the bare name; later ones get
/// `_2`, `_3`, …. Slugs never contain `_`, so suffixed names cannot collide
/// with bare ones.
#[derive(Debug, Default, Clone)]
pub struct SiblingNames {
    counts: HashMap<String, usize>,
}

impl SiblingNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, description: &str) -> String {
        let slug = slugify(description);
        let count = self.counts.entry(slug.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            slug
        } else {
            format!("{}_{}", slug, count)
        }
    }
}

/// Lifecycle status of a node.
///
/// # State Machine
/// ```text
/// Pending -> Running <-> AwaitingChildren
///    |         |  \          |
///    |         |   \-> Suspended -> (back to the state it paused from)
///    v         v
///  Failed   Completed | Failed
///
/// Any state except Completed/Terminated -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    AwaitingChildren,
    Suspended,
    Completed,
    Failed,
    Terminated,
}

impl NodeStatus {
    /// Completed, Failed or Terminated.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// Leaving Suspended is checked against the state it paused from by
    /// [`AgentNode::resume`](super::AgentNode::resume).
    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, to) {
            (Completed | Terminated, _) => false,
            (_, Terminated) => true,
            (Pending, Running | Failed) => true,
            (Running, AwaitingChildren | Completed | Failed | Suspended) => true,
            (AwaitingChildren, Running | Failed | Suspended) => true,
            (Suspended, Running | AwaitingChildren) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingChildren => "awaiting_children",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Errors that end or reject node work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Denied: {0}")]
    Denied(String),

    #[error("Circuit open for tool '{tool}'")]
    CircuitOpen { tool: String },

    #[error("Tool '{tool}' timed out")]
    Timeout { tool: String },

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("Insufficient budget: requested {requested}, available {available}")]
    InsufficientBudget { requested: u64, available: u64 },

    #[error("Budget exhausted: step cost {requested} exceeded the {available} remaining")]
    BudgetExhausted { requested: u64, available: u64 },

    #[error("Depth exceeded: child depth {depth} is beyond the maximum of {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Low confidence: {score:.2} below {threshold:.2}")]
    LowConfidence { score: f64, threshold: f64 },

    #[error("Dependency '{dependency}' did not complete")]
    DependencyFailed { dependency: NodeId },

    #[error("Max iterations reached: {0}")]
    MaxIterations(usize),

    #[error("Reasoner error: {0}")]
    Reasoner(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: NodeStatus, to: NodeStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for AgentError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Denied { .. } => Self::Denied(e.to_string()),
            GatewayError::CircuitOpen { tool, .. } => Self::CircuitOpen { tool },
            GatewayError::Timeout { tool, .. } => Self::Timeout { tool },
            GatewayError::ToolFailure { tool, message } => Self::ToolFailure { tool, message },
        }
    }
}

impl From<BudgetError> for AgentError {
    fn from(e: BudgetError) -> Self {
        match e {
            BudgetError::InsufficientBudget {
                requested,
                available,
            } => Self::InsufficientBudget {
                requested,
                available,
            },
            BudgetError::CeilingTooLarge {
                requested,
                parent_total,
            } => Self::InsufficientBudget {
                requested,
                available: parent_total.saturating_sub(1),
            },
            BudgetError::Exhausted {
                requested,
                available,
            } => Self::BudgetExhausted {
                requested,
                available,
            },
            other => Self::Internal(other.to_string()),
        }
    }
}
