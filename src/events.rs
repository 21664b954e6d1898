//! State event stream.
//!
//! Every status transition, routed message and fallback handoff is published
//! on a broadcast channel. Publishing never blocks: with no subscribers the
//! event is dropped, and slow subscribers observe `Lagged` instead of
//! stalling the tree. Human-readable mirrors (logs, progress files) are
//! projections of this stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::agents::{Endpoint, MessageKind, NodeId, NodeStatus};
use crate::fallback::HandoffSummary;

/// One observable change in the orchestration tree.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    NodeCreated {
        node: NodeId,
        parent: Option<NodeId>,
        depth: u32,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        budget: Option<u64>,
    },
    NodeStatusChanged {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    MessageRouted {
        from: Endpoint,
        to: Endpoint,
        kind: MessageKind,
        sequence: u64,
    },
    FallbackTriggered {
        node: NodeId,
        summary: HandoffSummary,
    },
}

impl StateEvent {
    /// Node the event is about, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::NodeCreated { node, .. }
            | Self::NodeStatusChanged { node, .. }
            | Self::FallbackTriggered { node, .. } => Some(node),
            Self::MessageRouted { .. } => None,
        }
    }
}

/// A [`StateEvent`] stamped with its publication time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StateEvent,
}

/// Broadcast fan-out for state events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StateEvent) {
        // An error only means nobody is listening.
        let _ = self.tx.send(EventEnvelope {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
