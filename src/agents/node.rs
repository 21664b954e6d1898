//! Agent node and task types.
//!
//! # Invariants
//! - `depth <= max_depth`; a node at `max_depth` never carries `spawn-child`
//! - A node leaves Pending only once its allocation has been granted
//! - `capabilities` is a subset of the parent's set
//!
//! An `AgentNode` is owned by exactly one supervisor task; other components
//! only see its id and the status mirror.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::types::{AgentError, NodeId, NodeStatus};
use crate::budget::AllocationId;
use crate::tools::CapabilitySet;

/// Status of a task, mirroring the node's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl From<NodeStatus> for TaskStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Pending => Self::Pending,
            NodeStatus::Running | NodeStatus::AwaitingChildren | NodeStatus::Suspended => {
                Self::Running
            }
            NodeStatus::Completed => Self::Completed,
            NodeStatus::Failed => Self::Failed,
            NodeStatus::Terminated => Self::Terminated,
        }
    }
}

/// A unit of work delegated to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    description: String,
    /// Siblings that must be Completed first
    depends_on: BTreeSet<NodeId>,
    /// Lower ordinal starts first
    priority: u32,
    /// Whether the parent treats a failure of this task as critical
    critical: bool,
    status: TaskStatus,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            depends_on: BTreeSet::new(),
            priority: 0,
            critical: false,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_dependencies(mut self, depends_on: BTreeSet<NodeId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn depends_on(&self) -> &BTreeSet<NodeId> {
        &self.depends_on
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }
}

/// A worker in the orchestration tree.
#[derive(Debug, Clone)]
pub struct AgentNode {
    id: NodeId,
    parent: Option<NodeId>,
    depth: u32,
    status: NodeStatus,
    /// State to return to when leaving Suspended
    suspended_from: Option<NodeStatus>,
    allocation: Option<AllocationId>,
    capabilities: CapabilitySet,
    children: Vec<NodeId>,
    task: Task,
}

impl AgentNode {
    /// Create a Pending node.
    ///
    /// # Preconditions
    /// - `depth == parent.depth + 1` (or 0 for the root), validated by the tree manager
    pub fn new(
        id: NodeId,
        parent: Option<NodeId>,
        depth: u32,
        capabilities: CapabilitySet,
        task: Task,
    ) -> Self {
        Self {
            id,
            parent,
            depth,
            status: NodeStatus::Pending,
            suspended_from: None,
            allocation: None,
            capabilities,
            children: Vec::new(),
            task,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn allocation(&self) -> Option<AllocationId> {
        self.allocation
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Record the granted allocation. Only possible while Pending.
    pub fn grant(&mut self, allocation: AllocationId) -> Result<(), AgentError> {
        if self.status != NodeStatus::Pending || self.allocation.is_some() {
            return Err(AgentError::Internal(format!(
                "allocation granted to {} in state {}",
                self.id, self.status
            )));
        }
        self.allocation = Some(allocation);
        Ok(())
    }

    pub fn add_children(&mut self, children: impl IntoIterator<Item = NodeId>) {
        self.children.extend(children);
    }

    /// Move to `to`, returning the previous status.
    pub fn transition(&mut self, to: NodeStatus) -> Result<NodeStatus, AgentError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition { from, to });
        }
        if from == NodeStatus::Suspended && Some(to) != self.suspended_from && to != NodeStatus::Terminated {
            return Err(AgentError::InvalidTransition { from, to });
        }
        if from == NodeStatus::Pending && to == NodeStatus::Running && self.allocation.is_none() {
            return Err(AgentError::Internal(format!(
                "{} cannot start without an allocation",
                self.id
            )));
        }

        if to == NodeStatus::Suspended {
            self.suspended_from = Some(from);
        } else if from == NodeStatus::Suspended {
            self.suspended_from = None;
        }
        self.status = to;
        self.task.status = to.into();
        Ok(from)
    }

    /// Suspend, remembering the current state.
    pub fn suspend(&mut self) -> Result<NodeStatus, AgentError> {
        self.transition(NodeStatus::Suspended)
    }

    /// Leave Suspended for the state it paused from.
    pub fn resume(&mut self) -> Result<NodeStatus, AgentError> {
        let target = self.suspended_from.ok_or(AgentError::InvalidTransition {
            from: self.status,
            to: NodeStatus::Running,
        })?;
        self.transition(target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLedger;

    fn node() -> AgentNode {
        AgentNode::new(
            NodeId::root("Build API"),
            None,
            0,
            CapabilitySet::new(["read_file"]),
            Task::new("Build API"),
        )
    }

    #[test]
    fn test_cannot_start_without_allocation() {
        let mut n = node();
        assert!(n.transition(NodeStatus::Running).is_err());
        assert_eq!(n.status(), NodeStatus::Pending);

        let ledger = BudgetLedger::new();
        n.grant(ledger.seed_root(100)).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        assert_eq!(n.task().status(), TaskStatus::Running);
    }

    #[test]
    fn test_suspend_resumes_to_prior_state() {
        let ledger = BudgetLedger::new();
        let mut n = node();
        n.grant(ledger.seed_root(100)).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::AwaitingChildren).unwrap();

        n.suspend().unwrap();
        assert!(n.transition(NodeStatus::Running).is_err());
        assert_eq!(n.resume().unwrap(), NodeStatus::AwaitingChildren);
        assert_eq!(n.status(), NodeStatus::AwaitingChildren);
        assert!(n.resume().is_err());
    }

    #[test]
    fn test_terminated_is_final() {
        let mut n = node();
        n.transition(NodeStatus::Terminated).unwrap();
        assert_eq!(n.task().status(), TaskStatus::Terminated);
        assert!(n.transition(NodeStatus::Running).is_err());
        assert!(n.transition(NodeStatus::Terminated).is_err());
    }
}
