//! Child batches and the result barrier.
//!
//! A parent that spawns a batch waits until every child of the batch is
//! terminal. Results are collected in spawn order regardless of the order in
//! which children finish, so aggregation is deterministic.
//!
//! # Scheduling
//! - A child starts once every dependency completed; ready children start in
//!   priority order, ties broken by spawn order
//! - A child with a failed or terminated dependency fails without starting,
//!   and so do its own dependents

use std::collections::BTreeSet;

use serde::Serialize;

use super::types::{AgentError, NodeId};
use crate::tools::CapabilitySet;

/// How a child ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Completed(String),
    Failed { error: AgentError },
    Terminated { by: String, reason: String },
}

impl ChildOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl std::fmt::Display for ChildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(answer) => write!(f, "completed: {}", answer),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::Terminated { by, reason } => write!(f, "terminated by {}: {}", by, reason),
        }
    }
}

/// The `ResultReport` payload of one child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResult {
    pub child: NodeId,
    pub description: String,
    pub outcome: ChildOutcome,
    pub critical: bool,
    /// Work units the child's subtree consumed
    pub consumed: u64,
}

/// One planned child of a batch.
#[derive(Debug, Clone)]
pub struct BatchMember {
    pub id: NodeId,
    pub description: String,
    /// Indices of siblings in the same batch
    pub depends_on: Vec<usize>,
    pub priority: u32,
    pub critical: bool,
    /// Fixed ceiling computed at spawn time
    pub ceiling: u64,
    pub capabilities: CapabilitySet,
}

/// Invalid dependency indices in a spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum DependencyError {
    #[error("subtask {index} depends on {dependency}, which is not in the batch")]
    OutOfRange { index: usize, dependency: usize },

    #[error("subtask {index} depends on itself")]
    SelfReference { index: usize },

    #[error("dependency cycle among subtasks {members:?}")]
    Cycle { members: Vec<usize> },
}

/// Check that `deps[i]` only names other valid indices and that the graph is acyclic.
pub fn check_dependencies(deps: &[Vec<usize>]) -> Result<(), DependencyError> {
    for (index, list) in deps.iter().enumerate() {
        for &dependency in list {
            if dependency >= deps.len() {
                return Err(DependencyError::OutOfRange { index, dependency });
            }
            if dependency == index {
                return Err(DependencyError::SelfReference { index });
            }
        }
    }

    // Kahn's algorithm; whatever never reaches in-degree zero is on a cycle.
    let mut remaining: Vec<usize> = deps.iter().map(|d| d.iter().collect::<BTreeSet<_>>().len()).collect();
    let mut ready: Vec<usize> = (0..deps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut resolved = vec![false; deps.len()];
    while let Some(done) = ready.pop() {
        resolved[done] = true;
        for (i, list) in deps.iter().enumerate() {
            if !resolved[i] && remaining[i] > 0 && list.contains(&done) {
                remaining[i] -= 1;
                if remaining[i] == 0 {
                    ready.push(i);
                }
            }
        }
    }

    let members: Vec<usize> = (0..deps.len()).filter(|&i| !resolved[i]).collect();
    if members.is_empty() {
        Ok(())
    } else {
        Err(DependencyError::Cycle { members })
    }
}

#[derive(Debug, Clone)]
enum MemberState {
    Waiting,
    Started,
    Finished(ChildResult),
}

/// Children started by one spawn request, awaited together.
#[derive(Debug, Clone)]
pub struct ChildBatch {
    members: Vec<BatchMember>,
    states: Vec<MemberState>,
}

/// What the parent must do after the barrier state changed.
#[derive(Debug, Default)]
pub struct Advance {
    /// Members to start now, in start order
    pub start: Vec<usize>,
    /// Members failed without starting because a dependency did not complete
    pub skipped: Vec<ChildResult>,
}

impl ChildBatch {
    /// # Preconditions
    /// - Dependency indices passed [`check_dependencies`]
    pub fn new(members: Vec<BatchMember>) -> Self {
        let states = vec![MemberState::Waiting; members.len()];
        Self { members, states }
    }

    pub fn member(&self, index: usize) -> &BatchMember {
        &self.members[index]
    }

    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.members.iter().position(|m| &m.id == id)
    }

    fn finished(&self, index: usize) -> Option<&ChildResult> {
        match &self.states[index] {
            MemberState::Finished(result) => Some(result),
            _ => None,
        }
    }

    /// Fail blocked members and pick the ones that may start now.
    pub fn advance(&mut self) -> Advance {
        let mut advance = Advance::default();

        loop {
            let mut changed = false;
            for index in 0..self.members.len() {
                if !matches!(self.states[index], MemberState::Waiting) {
                    continue;
                }
                let failed_dep = self.members[index].depends_on.iter().copied().find(|&d| {
                    self.finished(d).is_some_and(|r| !r.outcome.is_completed())
                });
                if let Some(dep) = failed_dep {
                    let member = &self.members[index];
                    let result = ChildResult {
                        child: member.id.clone(),
                        description: member.description.clone(),
                        outcome: ChildOutcome::Failed {
                            error: AgentError::DependencyFailed {
                                dependency: self.members[dep].id.clone(),
                            },
                        },
                        critical: member.critical,
                        consumed: 0,
                    };
                    advance.skipped.push(result.clone());
                    self.states[index] = MemberState::Finished(result);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut ready: Vec<usize> = (0..self.members.len())
            .filter(|&i| matches!(self.states[i], MemberState::Waiting))
            .filter(|&i| {
                self.members[i]
                    .depends_on
                    .iter()
                    .all(|&d| self.finished(d).is_some_and(|r| r.outcome.is_completed()))
            })
            .collect();
        ready.sort_by_key(|&i| (self.members[i].priority, i));
        for &i in &ready {
            self.states[i] = MemberState::Started;
        }
        advance.start = ready;
        advance
    }

    /// Record a child's report. Returns `false` for unknown or repeated reports.
    pub fn record(&mut self, result: ChildResult) -> bool {
        let Some(index) = self.index_of(&result.child) else {
            tracing::warn!(child = %result.child, "Result from a child outside the batch");
            return false;
        };
        if let MemberState::Finished(_) = self.states[index] {
            tracing::debug!(child = %result.child, "Ignoring repeated result report");
            return false;
        }
        self.states[index] = MemberState::Finished(result);
        true
    }

    /// Whether every member is terminal.
    pub fn is_complete(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s, MemberState::Finished(_)))
    }

    /// Results in spawn order.
    ///
    /// # Preconditions
    /// - `is_complete()`; unfinished members are omitted
    pub fn into_results(self) -> Vec<ChildResult> {
        self.states
            .into_iter()
            .filter_map(|s| match s {
                MemberState::Finished(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}
