//! Human fallback controller.
//!
//! Watches health signals from the supervisors and the stall clock of every
//! running node. When a threshold is crossed it suspends the affected
//! subtree, emits exactly one [`HandoffSummary`], and waits for guidance.
//!
//! # Triggers
//! - Confidence score below `confidence_threshold`
//! - More than `max_consecutive_errors` consecutive errors on one node
//! - A Running node without a transition for longer than `stall_window`
//! - Open breakers on at least `circuit_cascade_tools` distinct tools
//! - An explicit user STOP
//!
//! Node-local triggers (confidence, errors) suspend the node itself before
//! signalling; user STOP and circuit cascades suspend from the root.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agents::{NodeId, NodeStatus, TreeManager};
use crate::confidence::{ConfidenceAssessment, ConfidenceFactor, FactorContribution};
use crate::config::FallbackPolicy;
use crate::events::StateEvent;
use crate::tools::BreakerPosition;

impl FallbackPolicy {
    pub fn confidence_crossed(&self, score: f64) -> bool {
        score < self.confidence_threshold
    }

    pub fn errors_crossed(&self, consecutive: u32) -> bool {
        consecutive > self.max_consecutive_errors
    }

    pub fn stalled(&self, idle: Duration) -> bool {
        idle > self.stall_window
    }

    pub fn cascade_crossed(&self, open_tools: usize) -> bool {
        self.circuit_cascade_tools > 0 && open_tools >= self.circuit_cascade_tools
    }
}

/// Health report sent by supervisors.
#[derive(Debug, Clone)]
pub enum HealthSignal {
    LowConfidence {
        node: NodeId,
        assessment: ConfidenceAssessment,
    },
    ConsecutiveErrors {
        node: NodeId,
        count: u32,
        last_error: String,
    },
    CircuitOpen {
        node: NodeId,
        tool: String,
    },
    Stall {
        node: NodeId,
        idle: Duration,
    },
    UserStop,
}

/// The specific limit that was crossed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackTrigger {
    LowConfidence {
        score: f64,
        threshold: f64,
        weakest: ConfidenceFactor,
        contributions: Vec<FactorContribution>,
    },
    ConsecutiveErrors {
        count: u32,
        limit: u32,
        last_error: String,
    },
    Stall {
        idle_secs: f64,
        window_secs: f64,
    },
    CircuitCascade {
        open_tools: Vec<String>,
        limit: usize,
    },
    UserStop,
}

impl std::fmt::Display for FallbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence {
                score,
                threshold,
                weakest,
                ..
            } => write!(
                f,
                "confidence {:.2} below {:.2} (weakest factor: {})",
                score, threshold, weakest
            ),
            Self::ConsecutiveErrors {
                count,
                limit,
                last_error,
            } => write!(
                f,
                "{} consecutive errors exceed the limit of {} (last: {})",
                count, limit, last_error
            ),
            Self::Stall {
                idle_secs,
                window_secs,
            } => write!(
                f,
                "no progress for {:.0}s (stall window {:.0}s)",
                idle_secs, window_secs
            ),
            Self::CircuitCascade { open_tools, limit } => write!(
                f,
                "circuit open on {} tools ({}), limit {}",
                open_tools.len(),
                open_tools.join(", "),
                limit
            ),
            Self::UserStop => f.write_str("stopped by user"),
        }
    }
}

/// Status line of one node in a handoff.
#[derive(Debug, Clone, Serialize)]
pub struct NodeProgress {
    pub node: NodeId,
    pub description: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetSummary {
    pub ceiling: u64,
    pub consumed: u64,
    pub available: u64,
}

/// A trigger raised by another node while a handoff was already pending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaisedTrigger {
    pub node: NodeId,
    pub trigger: FallbackTrigger,
}

/// Human-readable account of why autonomy stopped.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffSummary {
    /// Root of the suspended subtree
    pub node: NodeId,
    pub task: String,
    pub trigger: FallbackTrigger,
    pub progress: Vec<NodeProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSummary>,
    pub suspended: Vec<NodeId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub also_raised: Vec<RaisedTrigger>,
    pub at: DateTime<Utc>,
}

impl HandoffSummary {
    /// Record a later trigger on this handoff. Returns `false` when it adds nothing new.
    fn note(&mut self, node: NodeId, trigger: FallbackTrigger) -> bool {
        if self.node == node && self.trigger == trigger {
            return false;
        }
        let raised = RaisedTrigger { node, trigger };
        if self.also_raised.contains(&raised) {
            return false;
        }
        if !self.suspended.contains(&raised.node) {
            self.suspended.push(raised.node.clone());
        }
        self.also_raised.push(raised);
        true
    }
}

impl std::fmt::Display for HandoffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "## Handoff: {}", self.node)?;
        writeln!(f, "Task: {}", self.task)?;
        writeln!(f, "Trigger: {}", self.trigger)?;
        for raised in &self.also_raised {
            writeln!(f, "Also: {} ({})", raised.trigger, raised.node)?;
        }
        if let Some(budget) = &self.budget {
            writeln!(
                f,
                "Budget: {} of {} consumed, {} available",
                budget.consumed, budget.ceiling, budget.available
            )?;
        }
        writeln!(f, "Progress:")?;
        for entry in &self.progress {
            writeln!(f, "- {} [{}] {}", entry.node, entry.status, entry.description)?;
        }
        Ok(())
    }
}

/// Whether the tree runs on its own or waits for a human.
#[derive(Debug, Clone)]
pub enum FallbackMode {
    Autonomous,
    AwaitingGuidance { summary: HandoffSummary },
}

impl FallbackMode {
    pub fn is_autonomous(&self) -> bool {
        matches!(self, Self::Autonomous)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    #[error("No handoff is waiting for guidance")]
    NotAwaitingGuidance,
}

/// Decides when to hand control back to a human.
#[derive(Debug)]
pub struct FallbackController {
    tree: Arc<TreeManager>,
    policy: FallbackPolicy,
    mode: Mutex<FallbackMode>,
    history: Mutex<Vec<HandoffSummary>>,
}

impl FallbackController {
    pub fn new(tree: Arc<TreeManager>, policy: FallbackPolicy) -> Self {
        Self {
            tree,
            policy,
            mode: Mutex::new(FallbackMode::Autonomous),
            history: Mutex::new(Vec::new()),
        }
    }

    fn lock_mode(&self) -> MutexGuard<'_, FallbackMode> {
        self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mode(&self) -> FallbackMode {
        self.lock_mode().clone()
    }

    /// Every handoff emitted so far, oldest first.
    pub fn history(&self) -> Vec<HandoffSummary> {
        self.lock_history().clone()
    }

    fn open_tools(&self) -> Vec<String> {
        self.tree
            .gateway()
            .breakers()
            .snapshot()
            .into_iter()
            .filter(|b| b.position != BreakerPosition::Closed)
            .map(|b| b.tool)
            .collect()
    }

    /// Map a signal to the subtree it suspends and the limit it crossed.
    fn evaluate(&self, signal: HealthSignal) -> Option<(NodeId, FallbackTrigger)> {
        match signal {
            HealthSignal::LowConfidence { node, assessment } => {
                if !self.policy.confidence_crossed(assessment.score) {
                    return None;
                }
                Some((
                    node,
                    FallbackTrigger::LowConfidence {
                        score: assessment.score,
                        threshold: self.policy.confidence_threshold,
                        weakest: assessment.weakest_factor(),
                        contributions: assessment.contributions,
                    },
                ))
            }
            HealthSignal::ConsecutiveErrors {
                node,
                count,
                last_error,
            } => {
                if !self.policy.errors_crossed(count) {
                    return None;
                }
                Some((
                    node,
                    FallbackTrigger::ConsecutiveErrors {
                        count,
                        limit: self.policy.max_consecutive_errors,
                        last_error,
                    },
                ))
            }
            HealthSignal::Stall { node, idle } => {
                if !self.policy.stalled(idle) {
                    return None;
                }
                Some((
                    node,
                    FallbackTrigger::Stall {
                        idle_secs: idle.as_secs_f64(),
                        window_secs: self.policy.stall_window.as_secs_f64(),
                    },
                ))
            }
            HealthSignal::CircuitOpen { node, tool } => {
                let open_tools = self.open_tools();
                tracing::debug!(node = %node, tool = %tool, open = open_tools.len(), "Circuit open reported");
                if !self.policy.cascade_crossed(open_tools.len()) {
                    return None;
                }
                let root = self.tree.root()?;
                Some((
                    root,
                    FallbackTrigger::CircuitCascade {
                        open_tools,
                        limit: self.policy.circuit_cascade_tools,
                    },
                ))
            }
            HealthSignal::UserStop => Some((self.tree.root()?, FallbackTrigger::UserStop)),
        }
    }

    fn summarize(&self, node: &NodeId, trigger: FallbackTrigger, suspended: Vec<NodeId>) -> HandoffSummary {
        let progress = self
            .tree
            .subtree(node)
            .into_iter()
            .map(|n| NodeProgress {
                node: n.id,
                description: n.description,
                status: n.status,
            })
            .collect();
        let budget = self
            .tree
            .allocation(node)
            .and_then(|a| self.tree.ledger().snapshot(a))
            .map(|a| BudgetSummary {
                ceiling: a.total(),
                consumed: a.consumed(),
                available: a.available(),
            });
        HandoffSummary {
            node: node.clone(),
            task: self.tree.description(node).unwrap_or_default(),
            trigger,
            progress,
            budget,
            suspended,
            also_raised: Vec::new(),
            at: Utc::now(),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<HandoffSummary>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Act on one health signal.
    ///
    /// Returns the handoff if this signal caused one. A trigger raised while a
    /// handoff already waits for guidance is recorded on that handoff instead
    /// of being reported again.
    pub fn handle(&self, signal: HealthSignal) -> Option<HandoffSummary> {
        let (node, trigger) = self.evaluate(signal)?;

        let summary = {
            let mut mode = self.lock_mode();
            if let FallbackMode::AwaitingGuidance { summary } = &mut *mode {
                if summary.note(node.clone(), trigger.clone()) {
                    tracing::warn!(node = %node, %trigger, "Trigger recorded on pending handoff");
                    if let Some(last) = self.lock_history().last_mut() {
                        *last = summary.clone();
                    }
                }
                return None;
            }
            let suspended = self.tree.suspend_subtree(&node, &trigger.to_string());
            let summary = self.summarize(&node, trigger, suspended);
            *mode = FallbackMode::AwaitingGuidance {
                summary: summary.clone(),
            };
            self.lock_history().push(summary.clone());
            summary
        };

        tracing::warn!(node = %summary.node, trigger = %summary.trigger, "Handing control to a human\n{}", summary);
        self.tree.events().publish(StateEvent::FallbackTriggered {
            node: summary.node.clone(),
            summary: summary.clone(),
        });
        Some(summary)
    }

    /// Resume every suspended node with `guidance` as extra context for its
    /// next reasoning step. Returns the handoff that was answered.
    pub fn provide_guidance(&self, guidance: impl Into<String>) -> Result<HandoffSummary, FallbackError> {
        let summary = {
            let mut mode = self.lock_mode();
            match std::mem::replace(&mut *mode, FallbackMode::Autonomous) {
                FallbackMode::AwaitingGuidance { summary } => summary,
                FallbackMode::Autonomous => return Err(FallbackError::NotAwaitingGuidance),
            }
        };

        let guidance = guidance.into();
        let guidance = (!guidance.trim().is_empty()).then_some(guidance);
        let resumed = self.tree.resume_all(guidance);
        tracing::info!(node = %summary.node, resumed = resumed.len(), "Guidance received, resuming");
        Ok(summary)
    }

    fn check_stalls(&self) {
        if !self.lock_mode().is_autonomous() {
            return;
        }
        let stalled = self
            .tree
            .snapshot()
            .into_iter()
            .find(|n| n.status == NodeStatus::Running && self.policy.stalled(n.idle));
        if let Some(node) = stalled {
            self.tree.touch(&node.id);
            self.handle(HealthSignal::Stall {
                node: node.id,
                idle: node.idle,
            });
        }
    }

    /// Consume health signals and watch for stalls until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<HealthSignal>,
        shutdown: CancellationToken,
    ) {
        let period = (self.policy.stall_window / 4).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        self.handle(signal);
                    }
                    None => break,
                },
                _ = ticker.tick() => self.check_stalls(),
            }
        }
        tracing::debug!("Fallback controller stopped");
    }
}
