//! Orchestrator - the control boundary of one agent tree.
//!
//! Wires the ledger, gateway, router, tree manager and fallback controller
//! together, starts the root node and hands its final result back to the
//! caller. External control (STOP, priority messages, guidance, termination)
//! enters the tree here.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{ChildResult, Endpoint, Mailbox, MessageRouter, NodeId, NodeSnapshot, Payload, SpawnError, TreeManager};
use crate::budget::BudgetLedger;
use crate::config::Config;
use crate::events::{EventBus, EventEnvelope};
use crate::fallback::{FallbackController, FallbackError, FallbackMode, HandoffSummary, HealthSignal};
use crate::llm::Reasoner;
use crate::tools::{ToolGateway, ToolRegistry};

/// External interrupts accepted at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptKind {
    /// Suspend the whole tree and hand control to the user
    Stop,
    /// Context every live node considers before its next step
    PriorityMessage(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("This orchestrator has already started a run")]
    AlreadyStarted,

    #[error("No run has been started")]
    NotStarted,

    #[error("Failed to start root node: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Control boundary closed before the root reported")]
    ControlClosed,

    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

/// Receiving ends consumed by the first `start`.
struct Pending {
    control: Mailbox,
    health: mpsc::UnboundedReceiver<HealthSignal>,
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub root: NodeId,
    outcome: oneshot::Receiver<ChildResult>,
}

impl RunHandle {
    /// Wait for the root's result report.
    pub async fn wait(self) -> Result<ChildResult, OrchestratorError> {
        self.outcome.await.map_err(|_| OrchestratorError::ControlClosed)
    }
}

pub struct Orchestrator {
    tree: Arc<TreeManager>,
    fallback: Arc<FallbackController>,
    pending: Mutex<Option<Pending>>,
}

impl Orchestrator {
    pub fn new(config: Config, reasoner: Arc<dyn Reasoner>, tools: ToolRegistry) -> Self {
        let config = Arc::new(config);
        let events = EventBus::new(config.event_capacity);
        let ledger = Arc::new(BudgetLedger::new());
        let gateway = Arc::new(ToolGateway::new(
            tools,
            config.breaker.clone(),
            config.workspace_path.clone(),
        ));
        let router = Arc::new(MessageRouter::new(events.clone()));
        let control = router.register(Endpoint::Control);
        let (health_tx, health) = mpsc::unbounded_channel();

        let tree = Arc::new(TreeManager::new(
            Arc::clone(&config),
            ledger,
            gateway,
            reasoner,
            router,
            events,
            health_tx,
        ));
        let fallback = Arc::new(FallbackController::new(
            Arc::clone(&tree),
            config.fallback.clone(),
        ));

        Self {
            tree,
            fallback,
            pending: Mutex::new(Some(Pending { control, health })),
        }
    }

    /// Create the root node for `task` and start working on it.
    pub fn start(&self, task: &str) -> Result<RunHandle, OrchestratorError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(OrchestratorError::AlreadyStarted)?;

        let shutdown = self.tree.shutdown_token();
        tokio::spawn(Arc::clone(&self.fallback).run(pending.health, shutdown.clone()));

        let root = self.tree.spawn_root(task)?;
        let run_id = Uuid::new_v4();
        let (tx, outcome) = oneshot::channel();
        tokio::spawn(forward_root_result(pending.control, root.clone(), tx, shutdown));

        tracing::info!(run_id = %run_id, root = %root, "Run started");
        Ok(RunHandle {
            run_id,
            root,
            outcome,
        })
    }

    /// Start `task` and wait for the root's result.
    pub async fn run(&self, task: &str) -> Result<ChildResult, OrchestratorError> {
        self.start(task)?.wait().await
    }

    /// Deliver an external interrupt.
    ///
    /// STOP returns the handoff it produced, or `None` when the tree was
    /// already waiting for guidance.
    pub fn interrupt(&self, kind: InterruptKind) -> Result<Option<HandoffSummary>, OrchestratorError> {
        if self.tree.root().is_none() {
            return Err(OrchestratorError::NotStarted);
        }
        match kind {
            InterruptKind::Stop => {
                tracing::info!("User STOP received");
                Ok(self.fallback.handle(HealthSignal::UserStop))
            }
            InterruptKind::PriorityMessage(message) => {
                self.tree.broadcast(&message);
                Ok(None)
            }
        }
    }

    /// Answer the pending handoff and resume the suspended nodes.
    pub fn resume(&self, guidance: impl Into<String>) -> Result<HandoffSummary, OrchestratorError> {
        Ok(self.fallback.provide_guidance(guidance)?)
    }

    /// Terminate the whole tree. Returns the nodes that were still live.
    pub fn terminate(&self, reason: &str) -> Result<Vec<NodeId>, OrchestratorError> {
        let root = self.tree.root().ok_or(OrchestratorError::NotStarted)?;
        Ok(self.tree.terminate_subtree(&root, "user", reason))
    }

    pub fn mode(&self) -> FallbackMode {
        self.fallback.mode()
    }

    pub fn handoffs(&self) -> Vec<HandoffSummary> {
        self.fallback.history()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tree.events().subscribe()
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.tree.snapshot()
    }

    pub fn tree(&self) -> &Arc<TreeManager> {
        &self.tree
    }

    pub fn ledger(&self) -> &BudgetLedger {
        self.tree.ledger()
    }

    pub fn config(&self) -> &Config {
        self.tree.config()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.tree.shutdown();
    }
}

/// Read the control mailbox until the root reports.
async fn forward_root_result(
    mut control: Mailbox,
    root: NodeId,
    tx: oneshot::Sender<ChildResult>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return,
            message = control.recv() => message,
        };
        let Some(message) = message else {
            return;
        };
        match message.payload {
            Payload::Result(result) if result.child == root => {
                tracing::info!(root = %root, outcome = %result.outcome, consumed = result.consumed, "Root reported");
                let _ = tx.send(result);
                return;
            }
            Payload::Error(error) => {
                tracing::warn!(from = %message.from, error = %error, "Error report at control boundary");
            }
            other => {
                tracing::debug!(from = %message.from, kind = ?other.kind(), "Ignoring control message");
            }
        }
    }
}
