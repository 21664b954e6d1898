//! Message routing between nodes.
//!
//! # Delivery Rules
//! - Every message carries a sequence number, monotonic per sender
//! - A recipient accepts each sender's sequence numbers in increasing order;
//!   repeats and stale numbers are discarded (at-most-once delivery)
//! - Interrupts travel on a priority lane that recipients drain before their
//!   normal queue
//! - Dequeuing a message is its acknowledgement; the router keeps no copy

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::barrier::ChildResult;
use super::node::Task;
use super::types::{NodeId, NodeStatus};
use crate::events::{EventBus, StateEvent};

/// Sender or recipient of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The orchestrator's control boundary (parent of the root)
    Control,
    Node(NodeId),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Node(id) => write!(f, "{}", id),
        }
    }
}

impl From<NodeId> for Endpoint {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskDelegation,
    ResultReport,
    StatusUpdate,
    ErrorReport,
    Interrupt,
}

/// Out-of-band control delivered on the priority lane.
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptSignal {
    Suspend { reason: String },
    Resume { guidance: Option<String> },
    /// Extra context to consider before the next step
    Priority(String),
    Terminate { issued_by: String, reason: String },
}

#[derive(Debug, Clone)]
pub enum Payload {
    Delegation(Task),
    Result(ChildResult),
    Status(NodeStatus),
    Error(String),
    Interrupt(InterruptSignal),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Delegation(_) => MessageKind::TaskDelegation,
            Self::Result(_) => MessageKind::ResultReport,
            Self::Status(_) => MessageKind::StatusUpdate,
            Self::Error(_) => MessageKind::ErrorReport,
            Self::Interrupt(_) => MessageKind::Interrupt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub from: Endpoint,
    pub to: Endpoint,
    pub sequence: u64,
    pub payload: Payload,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Receiving side of one endpoint's route.
#[derive(Debug)]
pub struct Mailbox {
    owner: Endpoint,
    priority: mpsc::UnboundedReceiver<Message>,
    normal: mpsc::UnboundedReceiver<Message>,
}

impl Mailbox {
    pub fn owner(&self) -> &Endpoint {
        &self.owner
    }

    /// Next message, interrupts first.
    ///
    /// Returns `None` once the route is gone and both lanes are drained.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            Some(msg) = self.priority.recv() => Some(msg),
            Some(msg) = self.normal.recv() => Some(msg),
            else => None,
        }
    }

    /// Next interrupt, leaving the normal queue untouched.
    pub async fn recv_priority(&mut self) -> Option<Message> {
        self.priority.recv().await
    }

    /// Queued interrupt, if any, without waiting.
    pub fn try_recv_priority(&mut self) -> Option<Message> {
        self.priority.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No route to {0}")]
    UnknownRecipient(Endpoint),

    #[error("Recipient {0} has shut down")]
    RecipientClosed(Endpoint),
}

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { sequence: u64 },
    /// Already seen from this sender; dropped
    Duplicate { sequence: u64 },
}

#[derive(Debug)]
struct Route {
    priority: mpsc::UnboundedSender<Message>,
    normal: mpsc::UnboundedSender<Message>,
    /// Highest sequence accepted per sender
    last_seen: HashMap<Endpoint, u64>,
}

#[derive(Debug, Default)]
struct RouterState {
    routes: HashMap<Endpoint, Route>,
    next_sequence: HashMap<Endpoint, u64>,
}

/// Routing table shared by the tree manager and every supervisor.
#[derive(Debug)]
pub struct MessageRouter {
    state: Mutex<RouterState>,
    events: EventBus,
}

impl MessageRouter {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create (or replace) the route for `endpoint` and hand back its mailbox.
    pub fn register(&self, endpoint: Endpoint) -> Mailbox {
        let (priority_tx, priority) = mpsc::unbounded_channel();
        let (normal_tx, normal) = mpsc::unbounded_channel();
        self.lock().routes.insert(
            endpoint.clone(),
            Route {
                priority: priority_tx,
                normal: normal_tx,
                last_seen: HashMap::new(),
            },
        );
        Mailbox {
            owner: endpoint,
            priority,
            normal,
        }
    }

    pub fn unregister(&self, endpoint: &Endpoint) {
        self.lock().routes.remove(endpoint);
    }

    pub fn is_registered(&self, endpoint: &Endpoint) -> bool {
        self.lock().routes.contains_key(endpoint)
    }

    /// Stamp the sender's next sequence number and route the message.
    pub fn send(
        &self,
        from: Endpoint,
        to: Endpoint,
        payload: Payload,
    ) -> Result<Delivery, RouteError> {
        let mut state = self.lock();
        let next = state.next_sequence.entry(from.clone()).or_insert(0);
        *next += 1;
        let sequence = *next;
        let message = Message {
            from,
            to,
            sequence,
            payload,
        };
        self.route(&mut state, message)
    }

    fn route(&self, state: &mut RouterState, message: Message) -> Result<Delivery, RouteError> {
        let to = message.to.clone();
        let route = state
            .routes
            .get_mut(&to)
            .ok_or_else(|| RouteError::UnknownRecipient(to.clone()))?;

        let sequence = message.sequence;
        let last = route.last_seen.get(&message.from).copied().unwrap_or(0);
        if sequence <= last {
            tracing::debug!(
                from = %message.from,
                to = %to,
                sequence,
                last,
                "Dropping duplicate message"
            );
            return Ok(Delivery::Duplicate { sequence });
        }

        let from = message.from.clone();
        let kind = message.kind();
        let lane = if kind == MessageKind::Interrupt {
            &route.priority
        } else {
            &route.normal
        };
        if lane.send(message).is_err() {
            state.routes.remove(&to);
            return Err(RouteError::RecipientClosed(to));
        }
        route.last_seen.insert(from.clone(), sequence);

        tracing::debug!(from = %from, to = %to, ?kind, sequence, "Message routed");
        self.events.publish(StateEvent::MessageRouted {
            from,
            to,
            kind,
            sequence,
        });
        Ok(Delivery::Delivered { sequence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Endpoint {
        Endpoint::Node(NodeId::root(name))
    }

    #[tokio::test]
    async fn test_interrupts_preempt_queued_messages() {
        let router = MessageRouter::new(EventBus::new(16));
        let mut mailbox = router.register(node("worker"));

        router
            .send(node("boss"), node("worker"), Payload::Status(NodeStatus::Running))
            .unwrap();
        router
            .send(node("boss"), node("worker"), Payload::Error("late".into()))
            .unwrap();
        router
            .send(
                Endpoint::Control,
                node("worker"),
                Payload::Interrupt(InterruptSignal::Priority("stop using fetch_url".into())),
            )
            .unwrap();

        let first = mailbox.recv().await.unwrap();
        assert_eq!(first.kind(), MessageKind::Interrupt);
        let second = mailbox.recv().await.unwrap();
        assert_eq!(second.kind(), MessageKind::StatusUpdate);
        assert_eq!(second.sequence, 1);
        let third = mailbox.recv().await.unwrap();
        assert_eq!(third.sequence, 2);
    }

    /// Route an already stamped message again, as a retransmission would.
    fn redeliver(router: &MessageRouter, message: Message) -> Result<Delivery, RouteError> {
        let mut state = router.lock();
        router.route(&mut state, message)
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_dropped() {
        let router = MessageRouter::new(EventBus::new(16));
        let mut mailbox = router.register(node("worker"));

        router
            .send(node("boss"), node("worker"), Payload::Error("once".into()))
            .unwrap();
        let msg = mailbox.recv().await.unwrap();

        assert_eq!(
            redeliver(&router, msg.clone()).unwrap(),
            Delivery::Duplicate { sequence: 1 }
        );
        // A newer number from the same sender is still accepted.
        let mut newer = msg;
        newer.sequence = 5;
        assert_eq!(
            redeliver(&router, newer).unwrap(),
            Delivery::Delivered { sequence: 5 }
        );
    }

    #[tokio::test]
    async fn test_unknown_and_closed_recipients() {
        let router = MessageRouter::new(EventBus::new(16));
        assert_eq!(
            router.send(Endpoint::Control, node("ghost"), Payload::Error("x".into())),
            Err(RouteError::UnknownRecipient(node("ghost")))
        );

        let mailbox = router.register(node("gone"));
        drop(mailbox);
        assert_eq!(
            router.send(Endpoint::Control, node("gone"), Payload::Error("x".into())),
            Err(RouteError::RecipientClosed(node("gone")))
        );
        assert!(!router.is_registered(&node("gone")));
    }

    #[tokio::test]
    async fn test_routing_publishes_events() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let router = MessageRouter::new(bus);
        let _mailbox = router.register(Endpoint::Control);

        router
            .send(node("root"), Endpoint::Control, Payload::Error("x".into()))
            .unwrap();
        let envelope = events.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            StateEvent::MessageRouted { kind: MessageKind::ErrorReport, sequence: 1, .. }
        ));
    }
}
