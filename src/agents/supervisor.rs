//! Agent node supervisor.
//!
//! One tokio task per node. The supervisor owns the [`AgentNode`] and drives
//! its reasoning loop:
//!
//! 1. Drain the priority lane (suspend, resume, priority messages, terminate)
//! 2. Ask the reasoner for a step and charge its token cost
//! 3. Gate on confidence when the step reports factors
//! 4. Act: call a tool through the gateway, spawn a child batch and wait on
//!    its barrier, or finish with the final answer
//!
//! Suspension points are the tool call, the child barrier and Suspended
//! itself. Cancelling the node's token drops whichever is in progress.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::barrier::{ChildBatch, ChildOutcome, ChildResult};
use super::message::{Endpoint, InterruptSignal, Mailbox, Payload};
use super::node::AgentNode;
use super::tree::{Grant, TreeManager};
use super::types::{AgentError, NodeStatus};
use crate::budget::AllocationId;
use crate::confidence::{assess, ConfidenceFactors};
use crate::fallback::HealthSignal;
use crate::llm::{Observation, ReasoningContext, SpawnRequest, StepAction};
use crate::tools::{GatewayError, SPAWN_CHILD};

/// Why a child batch ended without results.
enum BatchEnd {
    /// Refused before any child was created; the reasoning may try again
    Rejected(String),
    Stop(ChildOutcome),
}

/// Outcome of the confidence gate.
enum Gate {
    Proceed,
    /// The node was suspended and resumed; reason again with the guidance
    Discard,
    Stop(ChildOutcome),
}

pub(crate) struct Supervisor {
    tree: Arc<TreeManager>,
    node: AgentNode,
    grant: Option<Grant>,
    mailbox: Mailbox,
    cancel: CancellationToken,
    context: ReasoningContext,
    /// Interrupts that arrived before the node was running
    stashed: VecDeque<InterruptSignal>,
    consecutive_errors: u32,
    /// Set when a low-confidence handoff was resumed without guidance
    unguided_low_confidence: bool,
    tool_failures: HashMap<String, u32>,
}

impl Supervisor {
    pub(crate) fn new(
        tree: Arc<TreeManager>,
        node: AgentNode,
        grant: Grant,
        mailbox: Mailbox,
        cancel: CancellationToken,
    ) -> Self {
        let context = ReasoningContext::new(
            node.id().clone(),
            node.depth(),
            node.task().description(),
        );
        Self {
            tree,
            node,
            grant: Some(grant),
            mailbox,
            cancel,
            context,
            stashed: VecDeque::new(),
            consecutive_errors: 0,
            unguided_low_confidence: false,
            tool_failures: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.drive() => Some(outcome),
        };

        match outcome {
            Some(outcome) => self.finish(outcome),
            None => {
                tracing::info!(node = %self.node.id(), "Supervisor cancelled");
                let _ = self.node.transition(NodeStatus::Terminated);
            }
        }
        self.tree
            .router()
            .unregister(&Endpoint::Node(self.node.id().clone()));
    }

    async fn drive(&mut self) -> ChildOutcome {
        let allocation = match self.acquire().await {
            Ok(allocation) => allocation,
            Err(outcome) => return outcome,
        };
        if let Err(outcome) = self.await_delegation().await {
            return outcome;
        }
        if let Err(error) = self.transition(NodeStatus::Running, None) {
            return ChildOutcome::Failed { error };
        }
        tracing::info!(node = %self.node.id(), depth = self.node.depth(), "Node running");
        self.reason_loop(allocation).await
    }

    async fn acquire(&mut self) -> Result<AllocationId, ChildOutcome> {
        let failed = |error: AgentError| ChildOutcome::Failed { error };
        let grant = self
            .grant
            .take()
            .ok_or_else(|| failed(AgentError::Internal("allocation requested twice".to_string())))?;
        let allocation = match grant {
            Grant::Granted(allocation) => allocation,
            Grant::Queued { parent, amount } => self.wait_for_budget(parent, amount).await?,
            Grant::Rejected(error) => return Err(failed(error)),
        };
        self.node.grant(allocation).map_err(failed)?;
        self.tree.record_allocation(self.node.id(), allocation);
        Ok(allocation)
    }

    /// Queue for sibling budget while watching the priority lane.
    ///
    /// A suspend holds the wait without a deadline. After the resume the
    /// full `spawn_wait` starts over.
    async fn wait_for_budget(&mut self, parent: AllocationId, amount: u64) -> Result<AllocationId, ChildOutcome> {
        let tree = Arc::clone(&self.tree);
        let spawn_wait = tree.config().spawn_wait;
        let mut deadline = tokio::time::Instant::now() + spawn_wait;

        loop {
            tracing::debug!(node = %self.node.id(), amount, "Waiting for sibling budget");
            let wait = deadline.saturating_duration_since(tokio::time::Instant::now());
            let message = tokio::select! {
                biased;
                message = self.mailbox.recv_priority() => message,
                result = tree.ledger().allocate_within(parent, amount, wait) => {
                    return result.map_err(|e| ChildOutcome::Failed { error: e.into() });
                }
            };
            let Some(message) = message else {
                return Err(ChildOutcome::Failed {
                    error: AgentError::Internal("mailbox closed while queued".to_string()),
                });
            };
            let Payload::Interrupt(signal) = message.payload else {
                continue;
            };
            match signal {
                InterruptSignal::Suspend { reason } => {
                    tracing::info!(node = %self.node.id(), reason = %reason, "Budget wait held");
                    self.hold_queued().await?;
                    deadline = tokio::time::Instant::now() + spawn_wait;
                }
                InterruptSignal::Terminate { issued_by, reason } => {
                    return Err(ChildOutcome::Terminated {
                        by: issued_by,
                        reason,
                    });
                }
                other => self.stashed.push_back(other),
            }
        }
    }

    /// Hold a queued node until resumed or terminated.
    async fn hold_queued(&mut self) -> Result<(), ChildOutcome> {
        loop {
            let Some(message) = self.mailbox.recv_priority().await else {
                return Err(ChildOutcome::Failed {
                    error: AgentError::Internal("mailbox closed while queued".to_string()),
                });
            };
            let Payload::Interrupt(signal) = message.payload else {
                continue;
            };
            match signal {
                InterruptSignal::Resume { guidance } => {
                    self.context.guidance.extend(guidance);
                    tracing::info!(node = %self.node.id(), "Budget wait resumed");
                    return Ok(());
                }
                InterruptSignal::Terminate { issued_by, reason } => {
                    return Err(ChildOutcome::Terminated {
                        by: issued_by,
                        reason,
                    });
                }
                InterruptSignal::Priority(text) => {
                    self.stashed.push_back(InterruptSignal::Priority(text));
                }
                InterruptSignal::Suspend { .. } => {}
            }
        }
    }

    async fn await_delegation(&mut self) -> Result<(), ChildOutcome> {
        loop {
            let Some(message) = self.mailbox.recv().await else {
                return Err(ChildOutcome::Failed {
                    error: AgentError::Internal("mailbox closed before delegation".to_string()),
                });
            };
            match message.payload {
                Payload::Delegation(task) => {
                    tracing::debug!(node = %self.node.id(), task = task.description(), "Task delegated");
                    return Ok(());
                }
                Payload::Interrupt(InterruptSignal::Terminate { issued_by, reason }) => {
                    return Err(ChildOutcome::Terminated {
                        by: issued_by,
                        reason,
                    });
                }
                Payload::Interrupt(signal) => self.stashed.push_back(signal),
                other => {
                    tracing::warn!(node = %self.node.id(), kind = ?other.kind(), "Unexpected message before delegation");
                }
            }
        }
    }

    fn transition(&mut self, to: NodeStatus, detail: Option<String>) -> Result<(), AgentError> {
        let from = self.node.transition(to)?;
        self.tree.record_status(self.node.id(), from, to, detail);
        self.tree.notify_parent(self.node.id(), Payload::Status(to));
        Ok(())
    }

    fn next_interrupt(&mut self) -> Option<InterruptSignal> {
        if let Some(signal) = self.stashed.pop_front() {
            return Some(signal);
        }
        match self.mailbox.try_recv_priority()?.payload {
            Payload::Interrupt(signal) => Some(signal),
            _ => None,
        }
    }

    /// Handle queued interrupts before the next step.
    async fn drain_interrupts(&mut self) -> Option<ChildOutcome> {
        while let Some(signal) = self.next_interrupt() {
            if let Some(outcome) = self.on_interrupt(signal).await {
                return Some(outcome);
            }
        }
        None
    }

    async fn on_interrupt(&mut self, signal: InterruptSignal) -> Option<ChildOutcome> {
        match signal {
            InterruptSignal::Suspend { reason } => self.suspend(&reason).await,
            InterruptSignal::Resume { guidance } => {
                // Not suspended: keep the guidance for the next step anyway.
                self.context.guidance.extend(guidance);
                None
            }
            InterruptSignal::Priority(text) => {
                tracing::debug!(node = %self.node.id(), "Priority message received");
                self.context.history.push(Observation::PriorityMessage(text));
                None
            }
            InterruptSignal::Terminate { issued_by, reason } => Some(ChildOutcome::Terminated {
                by: issued_by,
                reason,
            }),
        }
    }

    /// Enter Suspended and hold there until resumed or terminated.
    ///
    /// Only the priority lane is read while suspended; results and other
    /// normal traffic stay queued.
    async fn suspend(&mut self, reason: &str) -> Option<ChildOutcome> {
        if let Err(error) = self.transition(NodeStatus::Suspended, Some(reason.to_string())) {
            return Some(ChildOutcome::Failed { error });
        }
        tracing::info!(node = %self.node.id(), reason, "Node suspended");

        loop {
            let Some(message) = self.mailbox.recv_priority().await else {
                return Some(ChildOutcome::Failed {
                    error: AgentError::Internal("mailbox closed while suspended".to_string()),
                });
            };
            let Payload::Interrupt(signal) = message.payload else {
                continue;
            };
            match signal {
                InterruptSignal::Resume { guidance } => {
                    self.context.guidance.extend(guidance);
                    self.consecutive_errors = 0;
                    let target = match self.node.resume() {
                        Ok(target) => target,
                        Err(error) => return Some(ChildOutcome::Failed { error }),
                    };
                    self.tree
                        .record_status(self.node.id(), NodeStatus::Suspended, target, None);
                    self.tree.notify_parent(self.node.id(), Payload::Status(target));
                    tracing::info!(node = %self.node.id(), %target, "Node resumed");
                    return None;
                }
                InterruptSignal::Terminate { issued_by, reason } => {
                    return Some(ChildOutcome::Terminated {
                        by: issued_by,
                        reason,
                    });
                }
                InterruptSignal::Priority(text) => {
                    self.context.history.push(Observation::PriorityMessage(text));
                }
                InterruptSignal::Suspend { .. } => {}
            }
        }
    }

    /// Count an error; past the limit, hand off and wait for guidance.
    async fn note_error(&mut self, message: String) -> Option<ChildOutcome> {
        self.consecutive_errors += 1;
        self.tree
            .notify_parent(self.node.id(), Payload::Error(message.clone()));
        let policy = &self.tree.config().fallback;
        if !policy.errors_crossed(self.consecutive_errors) {
            return None;
        }
        let count = self.consecutive_errors;
        tracing::warn!(node = %self.node.id(), count, error = %message, "Too many consecutive errors");
        self.tree.signal(HealthSignal::ConsecutiveErrors {
            node: self.node.id().clone(),
            count,
            last_error: message,
        });
        self.suspend(&format!("{} consecutive errors", count)).await
    }

    async fn gate_confidence(&mut self, allocation: AllocationId, mut factors: ConfidenceFactors) -> Gate {
        if factors.resource_availability.is_none() {
            factors.resource_availability = self
                .tree
                .ledger()
                .snapshot(allocation)
                .map(|a| a.available_ratio());
        }
        let assessment = assess(&factors);
        let policy = &self.tree.config().fallback;
        tracing::debug!(node = %self.node.id(), score = assessment.score, "Confidence assessed");
        if !policy.confidence_crossed(assessment.score) {
            self.unguided_low_confidence = false;
            return Gate::Proceed;
        }
        if self.unguided_low_confidence {
            tracing::warn!(node = %self.node.id(), score = assessment.score, "Confidence still low after an unguided resume");
            return Gate::Stop(ChildOutcome::Failed {
                error: AgentError::LowConfidence {
                    score: assessment.score,
                    threshold: policy.confidence_threshold,
                },
            });
        }

        let reason = assessment.describe();
        tracing::warn!(
            node = %self.node.id(),
            score = assessment.score,
            weakest = %assessment.weakest_factor(),
            "Confidence below threshold"
        );
        self.tree.signal(HealthSignal::LowConfidence {
            node: self.node.id().clone(),
            assessment,
        });
        match self.suspend(&reason).await {
            Some(outcome) => Gate::Stop(outcome),
            None => {
                self.unguided_low_confidence = self.context.guidance.is_empty();
                Gate::Discard
            }
        }
    }

    async fn reason_loop(&mut self, allocation: AllocationId) -> ChildOutcome {
        let tree = Arc::clone(&self.tree);
        let config = tree.config();
        let mut available_tools: Vec<String> = self
            .node
            .capabilities()
            .tool_names()
            .into_iter()
            .filter(|t| tree.gateway().registry().has_tool(t))
            .collect();
        if self.node.capabilities().can_spawn() && self.node.depth() < config.max_depth {
            available_tools.push(SPAWN_CHILD.to_string());
        }

        loop {
            if let Some(outcome) = self.drain_interrupts().await {
                return outcome;
            }
            if self.context.iteration >= config.max_iterations {
                return ChildOutcome::Failed {
                    error: AgentError::MaxIterations(config.max_iterations),
                };
            }
            self.context.budget_remaining = tree
                .ledger()
                .snapshot(allocation)
                .map(|a| a.available())
                .unwrap_or(0);

            let step = tree
                .reasoner()
                .reason_step(&self.context, &available_tools)
                .await;
            self.context.iteration += 1;
            let step = match step {
                Ok(step) => step,
                Err(e) if !e.is_transient() => {
                    tracing::error!(node = %self.node.id(), error = %e, "Reasoner cannot continue");
                    return ChildOutcome::Failed {
                        error: AgentError::Reasoner(e.to_string()),
                    };
                }
                Err(e) => {
                    tracing::warn!(node = %self.node.id(), error = %e, "Reasoning step failed");
                    self.context
                        .history
                        .push(Observation::ReasonerError(e.to_string()));
                    if let Some(outcome) = self.note_error(e.to_string()).await {
                        return outcome;
                    }
                    continue;
                }
            };
            self.context.guidance.clear();

            match tree.ledger().charge(allocation, step.token_cost) {
                Ok(remaining) => self.context.budget_remaining = remaining,
                Err(e) => return ChildOutcome::Failed { error: e.into() },
            }

            if let Some(factors) = step.confidence {
                match self.gate_confidence(allocation, factors).await {
                    Gate::Proceed => {}
                    Gate::Discard => continue,
                    Gate::Stop(outcome) => return outcome,
                }
            }

            match step.action {
                StepAction::FinalAnswer(answer) => return ChildOutcome::Completed(answer),
                StepAction::ToolCall {
                    tool,
                    args,
                    timeout,
                } => {
                    if let Some(outcome) = self
                        .call_tool(tool, args, timeout.unwrap_or(config.tool_timeout))
                        .await
                    {
                        return outcome;
                    }
                }
                StepAction::Spawn(requests) => match self.run_batch(&requests).await {
                    Ok(results) => {
                        self.consecutive_errors = 0;
                        self.context.history.push(Observation::ChildResults(results));
                    }
                    Err(BatchEnd::Rejected(reason)) => {
                        tracing::info!(node = %self.node.id(), reason = %reason, "Spawn rejected");
                        self.context
                            .history
                            .push(Observation::SpawnRejected { reason });
                    }
                    Err(BatchEnd::Stop(outcome)) => return outcome,
                },
            }
        }
    }

    async fn call_tool(
        &mut self,
        tool: String,
        args: serde_json::Value,
        timeout: std::time::Duration,
    ) -> Option<ChildOutcome> {
        let tree = Arc::clone(&self.tree);
        let result = tree
            .gateway()
            .invoke(
                self.node.id().as_str(),
                self.node.capabilities(),
                &tool,
                args,
                timeout,
            )
            .await;

        match result {
            Ok(result) => {
                self.tool_failures.remove(&tool);
                self.consecutive_errors = 0;
                self.context.history.push(Observation::ToolOutput {
                    tool,
                    output: result.output,
                });
                None
            }
            Err(e) if e.is_structural() => Some(ChildOutcome::Failed { error: e.into() }),
            Err(e @ GatewayError::CircuitOpen { .. }) => {
                self.tree.signal(HealthSignal::CircuitOpen {
                    node: self.node.id().clone(),
                    tool: tool.clone(),
                });
                self.context.history.push(Observation::ToolError {
                    tool,
                    error: e.to_string(),
                });
                self.note_error(e.to_string()).await
            }
            Err(e) => {
                let failures = self.tool_failures.entry(tool.clone()).or_insert(0);
                *failures += 1;
                if *failures > tree.config().max_tool_retries {
                    tracing::warn!(node = %self.node.id(), tool = %tool, failures = *failures, "Tool retries exhausted");
                    return Some(ChildOutcome::Failed { error: e.into() });
                }
                self.context.history.push(Observation::ToolError {
                    tool,
                    error: e.to_string(),
                });
                self.note_error(e.to_string()).await
            }
        }
    }

    fn advance(&self, batch: &mut ChildBatch) {
        let advance = batch.advance();
        for result in &advance.skipped {
            self.tree.skip_child(result);
        }
        for index in advance.start {
            self.tree.start_child(&self.node, batch, index);
        }
    }

    /// Spawn a batch and wait until every child is terminal.
    async fn run_batch(&mut self, requests: &[SpawnRequest]) -> Result<Vec<ChildResult>, BatchEnd> {
        let mut batch = match self.tree.plan_children(&self.node, requests) {
            Ok(batch) => batch,
            Err(e) if e.is_structural() => {
                return Err(BatchEnd::Stop(ChildOutcome::Failed { error: e.into() }))
            }
            Err(e) => return Err(BatchEnd::Rejected(e.to_string())),
        };
        self.node
            .add_children(batch.members().iter().map(|m| m.id.clone()));
        let detail = format!("waiting on {} children", batch.members().len());
        if let Err(error) = self.transition(NodeStatus::AwaitingChildren, Some(detail)) {
            return Err(BatchEnd::Stop(ChildOutcome::Failed { error }));
        }
        self.advance(&mut batch);

        while !batch.is_complete() {
            let Some(message) = self.mailbox.recv().await else {
                return Err(BatchEnd::Stop(ChildOutcome::Failed {
                    error: AgentError::Internal("mailbox closed while awaiting children".to_string()),
                }));
            };
            match message.payload {
                Payload::Result(result) => {
                    tracing::debug!(node = %self.node.id(), child = %result.child, outcome = %result.outcome, "Child reported");
                    if batch.record(result) {
                        self.advance(&mut batch);
                    }
                }
                Payload::Interrupt(signal) => {
                    if let Some(outcome) = self.on_interrupt(signal).await {
                        return Err(BatchEnd::Stop(outcome));
                    }
                }
                Payload::Status(status) => {
                    tracing::trace!(node = %self.node.id(), child = %message.from, %status, "Child status");
                }
                Payload::Error(error) => {
                    tracing::debug!(node = %self.node.id(), child = %message.from, error = %error, "Child reported an error");
                }
                other => {
                    tracing::debug!(node = %self.node.id(), kind = ?other.kind(), "Ignoring message while awaiting children");
                }
            }
        }

        if let Err(error) = self.transition(NodeStatus::Running, None) {
            return Err(BatchEnd::Stop(ChildOutcome::Failed { error }));
        }
        Ok(batch.into_results())
    }

    /// Close out the node's allocation, record its final status and report upward.
    fn finish(&mut self, outcome: ChildOutcome) {
        let id = self.node.id().clone();
        let allocation = self.node.allocation();
        let tree = Arc::clone(&self.tree);
        let ledger = tree.ledger();

        match &outcome {
            ChildOutcome::Completed(_) => {
                if let Some(allocation) = allocation {
                    match ledger.settle(allocation, 0) {
                        Ok(returned) => {
                            tracing::debug!(node = %id, returned, "Allocation settled")
                        }
                        Err(e) => {
                            tracing::error!(node = %id, error = %e, "Settlement failed; releasing");
                            let _ = ledger.release(allocation);
                        }
                    }
                }
                if let Err(e) = self.transition(NodeStatus::Completed, None) {
                    tracing::error!(node = %id, error = %e, "Could not record completion");
                }
                tracing::info!(node = %id, "Node completed");
            }
            ChildOutcome::Failed { error } => {
                for child in self.node.children() {
                    tree.terminate_subtree(child, id.as_str(), "parent failed");
                }
                if let Some(allocation) = allocation {
                    if let Err(e) = ledger.release(allocation) {
                        tracing::error!(node = %id, error = %e, "Failed to release allocation");
                    }
                }
                if let Err(e) = self.transition(NodeStatus::Failed, Some(error.to_string())) {
                    tracing::error!(node = %id, error = %e, "Could not record failure");
                }
                tracing::warn!(node = %id, error = %error, "Node failed");
            }
            ChildOutcome::Terminated { by, reason } => {
                // The tree manager already mirrored, released and reported.
                let _ = self.node.transition(NodeStatus::Terminated);
                tracing::info!(node = %id, by = %by, reason = %reason, "Node terminated");
                return;
            }
        }

        let consumed = allocation
            .and_then(|a| ledger.snapshot(a))
            .map(|a| a.consumed())
            .unwrap_or(0);
        tree.report(
            &id,
            ChildResult {
                child: id.clone(),
                description: self.node.task().description().to_string(),
                outcome,
                critical: self.node.task().critical(),
                consumed,
            },
        );
    }
}
