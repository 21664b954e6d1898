//! Agents module - the recursive orchestration tree.
//!
//! # Pieces
//! - **AgentNode**: one unit of work with its own allocation and capabilities
//! - **Supervisor**: the tokio task that owns a node and runs its reasoning loop
//! - **TreeManager**: spawn validation, naming, status mirror, cascade termination
//! - **MessageRouter**: sequenced two-lane mailboxes between nodes
//! - **ChildBatch**: dependency scheduling and the result barrier
//!
//! # Design Principles
//! - A node is only ever touched by its own supervisor
//! - Parents learn about children exclusively through result reports
//! - Termination flows down the tree, results flow up

mod barrier;
mod message;
mod node;
mod supervisor;
mod tree;
mod types;

pub use barrier::{check_dependencies, BatchMember, ChildBatch, ChildOutcome, ChildResult, DependencyError};
pub use message::{
    Delivery, Endpoint, InterruptSignal, Mailbox, Message, MessageKind, MessageRouter, Payload, RouteError,
};
pub use node::{AgentNode, Task, TaskStatus};
pub use tree::{NodeSnapshot, SpawnError, TreeManager};
pub use types::{slugify, AgentError, NodeId, NodeStatus, SiblingNames};
