//! # Ralph Swarm
//!
//! Recursive agent orchestration with a hierarchical resource budget.
//!
//! A root agent decomposes its task into child agents, which may recurse up
//! to a depth limit. Every node owns a fixed slice of its parent's budget,
//! reaches tools only through a circuit-breaking gateway, and hands control
//! back to a human when its confidence, error rate or progress degrades.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │          Orchestrator            │
//!        │  (control boundary, STOP/resume) │
//!        └───────┬──────────────────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!       ┌─────────────────┐  ┌──────────────────┐
//!       │   TreeManager   │◄─┤FallbackController│
//!       └───────┬─────────┘  └──────────────────┘
//!               │ one task per node
//!               ▼
//!       ┌─────────────────┐   ┌──────────────┐
//!       │   Supervisor    ├──►│ BudgetLedger │
//!       │ (reasoning loop)├──►│ ToolGateway  │
//!       └─────────────────┘   └──────────────┘
//! ```
//!
//! ## Task Flow
//! 1. The root receives the task and the full root budget
//! 2. Each step is charged, gated on confidence, then acted on
//! 3. Spawned children get a fixed ceiling and a subset of capabilities
//! 4. Results return to the parent in spawn order
//!
//! ## Modules
//! - `agents`: nodes, supervisors, routing and the tree manager
//! - `budget`: the allocation ledger
//! - `tools`: tool collaborators and the gateway with its breakers
//! - `confidence`: the weighted confidence score
//! - `fallback`: human handoff triggers and guidance
//! - `llm`: the reasoner interface, a script-driven reasoner and a chat completions reasoner
//! - `mcp`: an MCP server that exposes the tool registry over stdio
//! - `events`: the state event stream

pub mod agents;
pub mod budget;
pub mod config;
pub mod confidence;
pub mod events;
pub mod fallback;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod tools;

pub use config::Config;
pub use orchestrator::{InterruptKind, Orchestrator, OrchestratorError, RunHandle};
