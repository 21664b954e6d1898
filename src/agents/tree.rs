//! Orchestration tree manager.
//!
//! The manager never owns an [`AgentNode`]: each node lives inside its
//! supervisor task. What the manager keeps is the routing table (through the
//! [`MessageRouter`]), a status mirror fed by the supervisors, and each
//! node's cancellation token.
//!
//! # Invariants
//! - A child's depth is its parent's plus one and never exceeds `max_depth`
//! - A child's capabilities are a subset of its parent's
//! - Cascade termination visits descendants before ancestors, so every
//!   allocation is released before its parent's

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::barrier::{check_dependencies, BatchMember, ChildBatch, ChildOutcome, ChildResult, DependencyError};
use super::message::{Endpoint, InterruptSignal, Mailbox, MessageRouter, Payload};
use super::node::{AgentNode, Task};
use super::supervisor::Supervisor;
use super::types::{AgentError, NodeId, NodeStatus, SiblingNames};
use crate::budget::{child_ceiling, AllocationId, BudgetError, BudgetLedger};
use crate::config::Config;
use crate::events::{EventBus, StateEvent};
use crate::fallback::HealthSignal;
use crate::llm::{Reasoner, SpawnRequest};
use crate::tools::{ToolGateway, SPAWN_CHILD};

/// Why a spawn request was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("Spawn request contains no subtasks")]
    EmptyBatch,

    #[error("Spawn request has {requested} subtasks; at most {max} are allowed")]
    BatchTooLarge { requested: usize, max: usize },

    #[error("Depth exceeded: child depth {depth} is beyond the maximum of {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Node {node} is not permitted to spawn children")]
    SpawnNotPermitted { node: NodeId },

    #[error("Capability escalation for '{description}': {tags:?} not granted to the parent")]
    CapabilityEscalation { description: String, tags: Vec<String> },

    #[error(transparent)]
    InvalidDependencies(#[from] DependencyError),

    #[error("A root node named {0} already exists")]
    DuplicateRoot(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
}

impl SpawnError {
    /// Structural refusals fail the requesting node; the rest are reported
    /// back to its reasoning as an observation.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DepthExceeded { .. } | Self::SpawnNotPermitted { .. } | Self::CapabilityEscalation { .. }
        )
    }
}

impl From<SpawnError> for AgentError {
    fn from(e: SpawnError) -> Self {
        match e {
            SpawnError::DepthExceeded { depth, max_depth } => Self::DepthExceeded { depth, max_depth },
            SpawnError::SpawnNotPermitted { .. } | SpawnError::CapabilityEscalation { .. } => {
                Self::Denied(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// How a supervisor obtains its allocation.
#[derive(Debug)]
pub(crate) enum Grant {
    Granted(AllocationId),
    /// The parent could not cover the ceiling right away; wait for siblings
    Queued { parent: AllocationId, amount: u64 },
    Rejected(AgentError),
}

#[derive(Debug)]
struct NodeRecord {
    parent: Option<NodeId>,
    depth: u32,
    description: String,
    critical: bool,
    status: NodeStatus,
    children: Vec<NodeId>,
    names: SiblingNames,
    cancel: CancellationToken,
    ceiling: u64,
    allocation: Option<AllocationId>,
    terminated_by: Option<String>,
    last_transition: Instant,
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub depth: u32,
    pub description: String,
    pub status: NodeStatus,
    pub children: Vec<NodeId>,
    pub ceiling: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_by: Option<String>,
    /// Time since the last status transition
    #[serde(skip)]
    pub idle: Duration,
}

/// Spawns, tracks and tears down the nodes of one orchestration tree.
pub struct TreeManager {
    config: Arc<Config>,
    ledger: Arc<BudgetLedger>,
    gateway: Arc<ToolGateway>,
    reasoner: Arc<dyn Reasoner>,
    router: Arc<MessageRouter>,
    events: EventBus,
    health: mpsc::UnboundedSender<HealthSignal>,
    nodes: Mutex<HashMap<NodeId, NodeRecord>>,
    root: Mutex<Option<NodeId>>,
    shutdown: CancellationToken,
}

impl TreeManager {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<BudgetLedger>,
        gateway: Arc<ToolGateway>,
        reasoner: Arc<dyn Reasoner>,
        router: Arc<MessageRouter>,
        events: EventBus,
        health: mpsc::UnboundedSender<HealthSignal>,
    ) -> Self {
        Self {
            config,
            ledger,
            gateway,
            reasoner,
            router,
            events,
            health,
            nodes: Mutex::new(HashMap::new()),
            root: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub(crate) fn reasoner(&self) -> &dyn Reasoner {
        self.reasoner.as_ref()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Token cancelled when the whole tree shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every supervisor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeRecord>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn signal(&self, signal: HealthSignal) {
        // Nobody listening means no fallback controller is installed.
        let _ = self.health.send(signal);
    }

    /// Create the root node for `description` and start its supervisor.
    ///
    /// The root receives the full root budget and every registered tool.
    pub fn spawn_root(self: &Arc<Self>, description: &str) -> Result<NodeId, SpawnError> {
        let id = NodeId::root(description);
        let mut capabilities = self.gateway.registry().capabilities();
        if self.config.max_depth > 0 {
            capabilities = capabilities.with(SPAWN_CHILD);
        }
        let cancel = self.shutdown.child_token();

        {
            let mut nodes = self.lock();
            if nodes.contains_key(&id) {
                return Err(SpawnError::DuplicateRoot(id));
            }
            nodes.insert(
                id.clone(),
                NodeRecord {
                    parent: None,
                    depth: 0,
                    description: description.to_string(),
                    critical: true,
                    status: NodeStatus::Pending,
                    children: Vec::new(),
                    names: SiblingNames::new(),
                    cancel: cancel.clone(),
                    ceiling: self.config.root_budget,
                    allocation: None,
                    terminated_by: None,
                    last_transition: Instant::now(),
                },
            );
        }
        *self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.clone());

        let allocation = self.ledger.seed_root(self.config.root_budget);
        self.events.publish(StateEvent::NodeCreated {
            node: id.clone(),
            parent: None,
            depth: 0,
            description: description.to_string(),
            budget: Some(self.config.root_budget),
        });
        tracing::info!(node = %id, budget = self.config.root_budget, "Root node created");

        let task = Task::new(description).with_critical(true);
        let node = AgentNode::new(id.clone(), None, 0, capabilities, task.clone());
        let mailbox = self.router.register(Endpoint::Node(id.clone()));
        self.launch(node, Grant::Granted(allocation), mailbox, cancel);
        self.delegate(Endpoint::Control, &id, task);
        Ok(id)
    }

    /// Validate a spawn request and register its children as Pending.
    ///
    /// Nothing is recorded unless the whole batch is valid.
    pub(crate) fn plan_children(
        &self,
        parent: &AgentNode,
        requests: &[SpawnRequest],
    ) -> Result<ChildBatch, SpawnError> {
        if requests.is_empty() {
            return Err(SpawnError::EmptyBatch);
        }
        if requests.len() > self.config.max_spawn_batch {
            return Err(SpawnError::BatchTooLarge {
                requested: requests.len(),
                max: self.config.max_spawn_batch,
            });
        }
        let depth = parent.depth() + 1;
        if depth > self.config.max_depth {
            return Err(SpawnError::DepthExceeded {
                depth,
                max_depth: self.config.max_depth,
            });
        }
        if !parent.capabilities().can_spawn() {
            return Err(SpawnError::SpawnNotPermitted {
                node: parent.id().clone(),
            });
        }
        let deps: Vec<Vec<usize>> = requests.iter().map(|r| r.depends_on.clone()).collect();
        check_dependencies(&deps)?;

        let mut capabilities = Vec::with_capacity(requests.len());
        for request in requests {
            let requested = request
                .capabilities
                .clone()
                .unwrap_or_else(|| parent.capabilities().clone());
            let tags = requested.escalations(parent.capabilities());
            if !tags.is_empty() {
                return Err(SpawnError::CapabilityEscalation {
                    description: request.description.clone(),
                    tags,
                });
            }
            capabilities.push(if depth == self.config.max_depth {
                requested.without(SPAWN_CHILD)
            } else {
                requested
            });
        }

        let parent_total = parent
            .allocation()
            .and_then(|a| self.ledger.snapshot(a))
            .map(|a| a.total())
            .unwrap_or(0);

        let mut nodes = self.lock();
        let parent_record = nodes
            .get_mut(parent.id())
            .ok_or_else(|| SpawnError::UnknownNode(parent.id().clone()))?;
        let parent_cancel = parent_record.cancel.clone();

        let members: Vec<BatchMember> = requests
            .iter()
            .zip(capabilities)
            .map(|(request, capabilities)| BatchMember {
                id: parent.id().child(&parent_record.names.assign(&request.description)),
                description: request.description.clone(),
                depends_on: request.depends_on.clone(),
                priority: request.priority,
                critical: request.critical,
                ceiling: child_ceiling(
                    parent_total,
                    request.budget,
                    self.config.default_child_budget,
                    self.config.child_budget_fraction,
                ),
                capabilities,
            })
            .collect();
        parent_record
            .children
            .extend(members.iter().map(|m| m.id.clone()));

        for member in &members {
            nodes.insert(
                member.id.clone(),
                NodeRecord {
                    parent: Some(parent.id().clone()),
                    depth,
                    description: member.description.clone(),
                    critical: member.critical,
                    status: NodeStatus::Pending,
                    children: Vec::new(),
                    names: SiblingNames::new(),
                    cancel: parent_cancel.child_token(),
                    ceiling: member.ceiling,
                    allocation: None,
                    terminated_by: None,
                    last_transition: Instant::now(),
                },
            );
        }
        drop(nodes);

        for member in &members {
            self.events.publish(StateEvent::NodeCreated {
                node: member.id.clone(),
                parent: Some(parent.id().clone()),
                depth,
                description: member.description.clone(),
                budget: Some(member.ceiling),
            });
        }
        tracing::info!(
            parent = %parent.id(),
            children = members.len(),
            depth,
            "Planned child batch"
        );
        Ok(ChildBatch::new(members))
    }

    /// Start the supervisor of batch member `index`.
    ///
    /// The allocation is attempted synchronously; when siblings hold the
    /// parent's capacity the child queues inside its own supervisor.
    pub(crate) fn start_child(self: &Arc<Self>, parent: &AgentNode, batch: &ChildBatch, index: usize) {
        let member = batch.member(index);
        let Some(cancel) = self.lock().get(&member.id).map(|r| r.cancel.clone()) else {
            tracing::error!(node = %member.id, "Starting a child that was never planned");
            return;
        };

        let grant = match parent.allocation() {
            Some(parent_alloc) => match self.ledger.allocate(parent_alloc, member.ceiling) {
                Ok(allocation) => Grant::Granted(allocation),
                Err(BudgetError::InsufficientBudget { .. }) => Grant::Queued {
                    parent: parent_alloc,
                    amount: member.ceiling,
                },
                Err(e) => Grant::Rejected(e.into()),
            },
            None => Grant::Rejected(AgentError::Internal(format!(
                "parent {} has no allocation",
                parent.id()
            ))),
        };

        let depends_on: BTreeSet<NodeId> = member
            .depends_on
            .iter()
            .map(|&d| batch.member(d).id.clone())
            .collect();
        let task = Task::new(member.description.clone())
            .with_dependencies(depends_on)
            .with_priority(member.priority)
            .with_critical(member.critical);
        let node = AgentNode::new(
            member.id.clone(),
            Some(parent.id().clone()),
            parent.depth() + 1,
            member.capabilities.clone(),
            task.clone(),
        );

        tracing::debug!(node = %member.id, ceiling = member.ceiling, ?grant, "Starting child");
        let mailbox = self.router.register(Endpoint::Node(member.id.clone()));
        self.launch(node, grant, mailbox, cancel);
        self.delegate(Endpoint::Node(parent.id().clone()), &member.id, task);
    }

    fn launch(self: &Arc<Self>, node: AgentNode, grant: Grant, mailbox: Mailbox, cancel: CancellationToken) {
        let supervisor = Supervisor::new(Arc::clone(self), node, grant, mailbox, cancel);
        tokio::spawn(supervisor.run());
    }

    fn delegate(&self, from: Endpoint, to: &NodeId, task: Task) {
        if let Err(e) = self
            .router
            .send(from, Endpoint::Node(to.clone()), Payload::Delegation(task))
        {
            tracing::error!(node = %to, error = %e, "Failed to delegate task");
        }
    }

    /// Mark a batch member that will never start as Failed.
    pub(crate) fn skip_child(&self, result: &ChildResult) {
        let detail = result.outcome.to_string();
        tracing::info!(node = %result.child, reason = %detail, "Child skipped");
        self.record_status(&result.child, NodeStatus::Pending, NodeStatus::Failed, Some(detail));
    }

    pub(crate) fn record_allocation(&self, id: &NodeId, allocation: AllocationId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.allocation = Some(allocation);
        }
    }

    /// Mirror a supervisor's transition and publish it.
    ///
    /// Updates for nodes the mirror already holds as terminal are dropped.
    pub(crate) fn record_status(&self, id: &NodeId, from: NodeStatus, to: NodeStatus, detail: Option<String>) {
        {
            let mut nodes = self.lock();
            let Some(record) = nodes.get_mut(id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.status = to;
            record.last_transition = Instant::now();
        }
        tracing::debug!(node = %id, %from, %to, "Status changed");
        self.events.publish(StateEvent::NodeStatusChanged {
            node: id.clone(),
            from,
            to,
            detail,
        });
    }

    /// Restart a node's stall clock.
    pub fn touch(&self, id: &NodeId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.last_transition = Instant::now();
        }
    }

    fn upward(from: &NodeId) -> Endpoint {
        match from.parent() {
            Some(parent) => Endpoint::Node(parent),
            None => Endpoint::Control,
        }
    }

    /// Send a result report from `from` to its parent (or the control boundary).
    pub(crate) fn report(&self, from: &NodeId, result: ChildResult) {
        if let Err(e) = self
            .router
            .send(Endpoint::Node(from.clone()), Self::upward(from), Payload::Result(result))
        {
            tracing::warn!(node = %from, error = %e, "Result report not delivered");
        }
    }

    /// Pass a status update or error report from `from` upward.
    ///
    /// Updates are advisory; a parent that already stopped listening just
    /// misses them.
    pub(crate) fn notify_parent(&self, from: &NodeId, payload: Payload) {
        if let Err(e) = self
            .router
            .send(Endpoint::Node(from.clone()), Self::upward(from), payload)
        {
            tracing::trace!(node = %from, error = %e, "Update not delivered");
        }
    }

    fn live_subtree(nodes: &HashMap<NodeId, NodeRecord>, id: &NodeId, post_order: bool, out: &mut Vec<NodeId>) {
        let Some(record) = nodes.get(id) else {
            return;
        };
        let live = !record.status.is_terminal();
        if live && !post_order {
            out.push(id.clone());
        }
        for child in &record.children {
            Self::live_subtree(nodes, child, post_order, out);
        }
        if live && post_order {
            out.push(id.clone());
        }
    }

    /// Terminate `id` and every live descendant, deepest first.
    ///
    /// Each node's allocation is released before its parent's, the issuer and
    /// reason are recorded on every node, and one `Terminated` result is
    /// reported to the surviving parent of `id`. Returns the terminated nodes.
    pub fn terminate_subtree(&self, id: &NodeId, issued_by: &str, reason: &str) -> Vec<NodeId> {
        let detail = format!("terminated by {}: {}", issued_by, reason);
        let mut terminated = Vec::new();
        let (changes, report) = {
            let mut nodes = self.lock();
            let mut order = Vec::new();
            Self::live_subtree(&nodes, id, true, &mut order);
            let mut changes = Vec::with_capacity(order.len());
            for node in order {
                if let Some(record) = nodes.get_mut(&node) {
                    let from = record.status;
                    record.status = NodeStatus::Terminated;
                    record.terminated_by = Some(detail.clone());
                    record.last_transition = Instant::now();
                    record.cancel.cancel();
                    changes.push((node, from, record.allocation));
                }
            }
            let report = nodes.get(id).filter(|_| !changes.is_empty()).map(|record| {
                let surviving_parent = match &record.parent {
                    Some(parent) => nodes.get(parent).is_some_and(|p| !p.status.is_terminal()),
                    None => true,
                };
                (surviving_parent, record.description.clone(), record.critical, record.allocation)
            });
            (changes, report)
        };

        for (node, from, allocation) in changes {
            if let Some(allocation) = allocation {
                if let Err(e) = self.ledger.release(allocation) {
                    tracing::error!(node = %node, error = %e, "Failed to release allocation");
                }
            }
            if let Err(e) = self.router.send(
                Endpoint::Control,
                Endpoint::Node(node.clone()),
                Payload::Interrupt(InterruptSignal::Terminate {
                    issued_by: issued_by.to_string(),
                    reason: reason.to_string(),
                }),
            ) {
                tracing::debug!(node = %node, error = %e, "Terminate not delivered");
            }
            self.router.unregister(&Endpoint::Node(node.clone()));
            self.events.publish(StateEvent::NodeStatusChanged {
                node: node.clone(),
                from,
                to: NodeStatus::Terminated,
                detail: Some(detail.clone()),
            });
            terminated.push(node);
        }

        if let Some((true, description, critical, allocation)) = report {
            let consumed = allocation
                .and_then(|a| self.ledger.snapshot(a))
                .map(|a| a.consumed())
                .unwrap_or(0);
            self.report(
                id,
                ChildResult {
                    child: id.clone(),
                    description,
                    outcome: ChildOutcome::Terminated {
                        by: issued_by.to_string(),
                        reason: reason.to_string(),
                    },
                    critical,
                    consumed,
                },
            );
        }
        if !terminated.is_empty() {
            tracing::info!(node = %id, issued_by, reason, count = terminated.len(), "Subtree terminated");
        }
        terminated
    }

    fn interrupt_all(&self, nodes: &[NodeId], signal: InterruptSignal) {
        for node in nodes {
            if let Err(e) = self.router.send(
                Endpoint::Control,
                Endpoint::Node(node.clone()),
                Payload::Interrupt(signal.clone()),
            ) {
                tracing::debug!(node = %node, error = %e, "Interrupt not delivered");
            }
        }
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        let mut live: Vec<NodeId> = self
            .lock()
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    /// Ask `id` and its live descendants to suspend.
    pub fn suspend_subtree(&self, id: &NodeId, reason: &str) -> Vec<NodeId> {
        let mut targets = Vec::new();
        Self::live_subtree(&self.lock(), id, false, &mut targets);
        self.interrupt_all(
            &targets,
            InterruptSignal::Suspend {
                reason: reason.to_string(),
            },
        );
        tracing::info!(node = %id, reason, count = targets.len(), "Subtree suspended");
        targets
    }

    /// Resume every live node, handing each the same guidance.
    pub fn resume_all(&self, guidance: Option<String>) -> Vec<NodeId> {
        let targets = self.live_nodes();
        self.interrupt_all(&targets, InterruptSignal::Resume { guidance });
        targets
    }

    /// Deliver a priority message to every live node.
    pub fn broadcast(&self, message: &str) -> Vec<NodeId> {
        let targets = self.live_nodes();
        self.interrupt_all(&targets, InterruptSignal::Priority(message.to_string()));
        tracing::info!(count = targets.len(), "Priority message broadcast");
        targets
    }

    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.lock().get(id).map(|r| r.status)
    }

    pub fn description(&self, id: &NodeId) -> Option<String> {
        self.lock().get(id).map(|r| r.description.clone())
    }

    pub fn allocation(&self, id: &NodeId) -> Option<AllocationId> {
        self.lock().get(id).and_then(|r| r.allocation)
    }

    /// Every node, sorted by id.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut snapshot: Vec<NodeSnapshot> = self
            .lock()
            .iter()
            .map(|(id, r)| NodeSnapshot {
                id: id.clone(),
                parent: r.parent.clone(),
                depth: r.depth,
                description: r.description.clone(),
                status: r.status,
                children: r.children.clone(),
                ceiling: r.ceiling,
                consumed: r
                    .allocation
                    .and_then(|a| self.ledger.snapshot(a))
                    .map(|a| a.consumed()),
                terminated_by: r.terminated_by.clone(),
                idle: r.last_transition.elapsed(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Snapshot of `id` and its descendants, parents before children.
    pub fn subtree(&self, id: &NodeId) -> Vec<NodeSnapshot> {
        self.snapshot()
            .into_iter()
            .filter(|n| n.id.is_within(id))
            .collect()
    }
}

impl std::fmt::Debug for TreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeManager")
            .field("root", &self.root())
            .field("nodes", &self.lock().len())
            .finish()
    }
}
