//! Reasoning collaborator interface.
//!
//! A node's reasoning loop asks a [`Reasoner`] for one step at a time. The
//! step names an action (tool call, spawn, or final answer), the token cost
//! the language model reported for producing it, and optionally the
//! confidence factors it judged at this decision point.
//!
//! [`ScriptedReasoner`] replays a fixed script per task description and is
//! what the tests drive the tree with. [`OpenAiReasoner`] asks a chat
//! completions endpoint for each step.

mod error;
mod openai;
mod scripted;

pub use error::ReasonerError;
pub use openai::OpenAiReasoner;
pub use scripted::{ScriptEntry, ScriptedReasoner};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::{ChildResult, NodeId};
use crate::confidence::ConfidenceFactors;
use crate::tools::CapabilitySet;

/// A subtask requested by a node's reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub description: String,

    /// Requested ceiling; clamped to the parent's cap
    #[serde(default)]
    pub budget: Option<u64>,

    /// Requested tags; inherits the parent's set when absent
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,

    /// Indices of sibling requests in the same batch that must complete first
    #[serde(default)]
    pub depends_on: Vec<usize>,

    /// Lower ordinal starts first
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub critical: bool,
}

impl SpawnRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            budget: None,
            capabilities: None,
            depends_on: Vec::new(),
            priority: 0,
            critical: false,
        }
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn depends_on(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(indices);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// What the node should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    ToolCall {
        tool: String,
        args: Value,
        /// Overrides the configured tool deadline
        timeout: Option<Duration>,
    },
    Spawn(Vec<SpawnRequest>),
    FinalAnswer(String),
}

/// One step of a node's reasoning loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningStep {
    pub action: StepAction,
    /// Work units the model spent producing this step
    pub token_cost: u64,
    pub confidence: Option<ConfidenceFactors>,
}

impl ReasoningStep {
    fn with_action(action: StepAction) -> Self {
        Self {
            action,
            token_cost: 0,
            confidence: None,
        }
    }

    pub fn tool(tool: impl Into<String>, args: Value) -> Self {
        Self::with_action(StepAction::ToolCall {
            tool: tool.into(),
            args,
            timeout: None,
        })
    }

    pub fn spawn(requests: Vec<SpawnRequest>) -> Self {
        Self::with_action(StepAction::Spawn(requests))
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self::with_action(StepAction::FinalAnswer(text.into()))
    }

    pub fn with_cost(mut self, token_cost: u64) -> Self {
        self.token_cost = token_cost;
        self
    }

    pub fn with_confidence(mut self, confidence: ConfidenceFactors) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Set a deadline on a tool call step. No effect on other actions.
    pub fn with_timeout(mut self, deadline: Duration) -> Self {
        if let StepAction::ToolCall { timeout, .. } = &mut self.action {
            *timeout = Some(deadline);
        }
        self
    }
}

/// Something the node learned since its previous step.
#[derive(Debug, Clone)]
pub enum Observation {
    ToolOutput { tool: String, output: String },
    ToolError { tool: String, error: String },
    /// Results of a child batch, in spawn order
    ChildResults(Vec<ChildResult>),
    SpawnRejected { reason: String },
    PriorityMessage(String),
    ReasonerError(String),
}

/// Everything a reasoner sees when asked for the next step.
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub node: NodeId,
    pub depth: u32,
    pub task: String,
    /// Zero-based step number
    pub iteration: usize,
    pub budget_remaining: u64,
    pub history: Vec<Observation>,
    /// Human guidance received since the previous step
    pub guidance: Vec<String>,
}

impl ReasoningContext {
    pub fn new(node: NodeId, depth: u32, task: impl Into<String>) -> Self {
        Self {
            node,
            depth,
            task: task.into(),
            iteration: 0,
            budget_remaining: 0,
            history: Vec::new(),
            guidance: Vec::new(),
        }
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.history.last()
    }
}

/// The language-model collaborator.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Produce the next step for the node described by `context`.
    ///
    /// `available_tools` lists the registered tools the node may invoke,
    /// followed by `spawn-child` when the node may still spawn.
    async fn reason_step(
        &self,
        context: &ReasoningContext,
        available_tools: &[String],
    ) -> Result<ReasoningStep, ReasonerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeout_only_applies_to_tool_calls() {
        let step = ReasoningStep::tool("read_file", json!({"path": "a"}))
            .with_timeout(Duration::from_secs(2))
            .with_cost(5);
        assert!(matches!(
            step.action,
            StepAction::ToolCall { timeout: Some(t), .. } if t == Duration::from_secs(2)
        ));
        assert_eq!(
            ReasoningStep::answer("done").with_timeout(Duration::from_secs(2)),
            ReasoningStep::answer("done")
        );
    }

    #[test]
    fn test_spawn_request_deserializes_with_defaults() {
        let req: SpawnRequest =
            serde_json::from_value(json!({"description": "Write tests", "depends_on": [0]}))
                .unwrap();
        assert_eq!(req, SpawnRequest::new("Write tests").depends_on([0]));
    }
}
