//! Script-driven reasoner.
//!
//! Each task description maps to a list of steps replayed in order, one per
//! call. Every node keeps its own cursor, so two nodes with the same task
//! each walk the script from the start. Once a script runs out the reasoner
//! answers with a summary of the last observation.
//!
//! ```yaml
//! default:
//!   - answer: "done"
//! tasks:
//!   "Build the API":
//!     - spawn:
//!         - description: Design schema
//!           budget: 1000
//!         - description: Write handlers
//!           depends_on: [0]
//!           critical: true
//!       cost: 120
//!     - tool: write_file
//!       args: { path: api.md, content: "# API" }
//!       cost: 40
//!       confidence: { task_clarity: 0.9, solution_certainty: 0.8 }
//!     - answer: "API built"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{
    Observation, Reasoner, ReasonerError, ReasoningContext, ReasoningStep, SpawnRequest,
};
use crate::agents::NodeId;
use crate::confidence::ConfidenceFactors;

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct ScriptEntry {
    /// `Err` replays a reasoner failure with this message
    pub result: Result<ReasoningStep, String>,
    pub delay: Option<Duration>,
}

impl ScriptEntry {
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay: None,
        }
    }

    /// Wait `delay` before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl From<ReasoningStep> for ScriptEntry {
    fn from(step: ReasoningStep) -> Self {
        Self {
            result: Ok(step),
            delay: None,
        }
    }
}

/// On-disk form of one step. Exactly one of `tool`, `spawn`, `answer`, `fail`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDef {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    spawn: Option<Vec<SpawnRequest>>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default)]
    cost: u64,
    #[serde(default)]
    confidence: Option<ConfidenceFactors>,
    #[serde(default)]
    delay_ms: Option<u64>,
}

impl StepDef {
    fn into_entry(self, task: &str, index: usize) -> Result<ScriptEntry, ReasonerError> {
        let actions = [
            self.tool.is_some(),
            self.spawn.is_some(),
            self.answer.is_some(),
            self.fail.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if actions != 1 {
            return Err(ReasonerError::InvalidScript(format!(
                "step {} of '{}' must set exactly one of tool, spawn, answer, fail",
                index, task
            )));
        }

        let delay = self.delay_ms.map(Duration::from_millis);
        if let Some(message) = self.fail {
            return Ok(ScriptEntry {
                result: Err(message),
                delay,
            });
        }

        let mut step = if let Some(tool) = self.tool {
            let step = ReasoningStep::tool(tool, self.args.unwrap_or(Value::Object(Default::default())));
            match self.timeout_secs {
                Some(secs) => step.with_timeout(Duration::from_secs(secs)),
                None => step,
            }
        } else if let Some(requests) = self.spawn {
            ReasoningStep::spawn(requests)
        } else {
            ReasoningStep::answer(self.answer.unwrap_or_default())
        };
        step.token_cost = self.cost;
        step.confidence = self.confidence;

        Ok(ScriptEntry {
            result: Ok(step),
            delay,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptFile {
    #[serde(default)]
    default: Vec<StepDef>,
    #[serde(default)]
    tasks: HashMap<String, Vec<StepDef>>,
}

/// Reasoner that replays scripted steps keyed by task description.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    scripts: HashMap<String, Vec<ScriptEntry>>,
    default_script: Vec<ScriptEntry>,
    cursors: Mutex<HashMap<NodeId, usize>>,
    transcript: Mutex<Vec<ReasoningContext>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for nodes whose task description is exactly `task`.
    pub fn with_script<I, E>(mut self, task: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<ScriptEntry>,
    {
        self.scripts
            .insert(task.into(), entries.into_iter().map(Into::into).collect());
        self
    }

    /// Script for tasks without a dedicated one.
    pub fn with_default<I, E>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<ScriptEntry>,
    {
        self.default_script = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_yaml(text: &str) -> Result<Self, ReasonerError> {
        let file: ScriptFile =
            serde_yaml::from_str(text).map_err(|e| ReasonerError::InvalidScript(e.to_string()))?;

        let mut reasoner = Self::new();
        for (i, def) in file.default.into_iter().enumerate() {
            reasoner.default_script.push(def.into_entry("default", i)?);
        }
        for (task, defs) in file.tasks {
            let entries = defs
                .into_iter()
                .enumerate()
                .map(|(i, def)| def.into_entry(&task, i))
                .collect::<Result<Vec<_>, _>>()?;
            reasoner.scripts.insert(task, entries);
        }

        tracing::debug!(
            tasks = reasoner.scripts.len(),
            default_steps = reasoner.default_script.len(),
            "Loaded reasoning script"
        );
        Ok(reasoner)
    }

    pub fn from_file(path: &Path) -> Result<Self, ReasonerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Every context this reasoner has been asked about, in call order.
    pub fn transcript(&self) -> Vec<ReasoningContext> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Contexts seen for one node.
    pub fn contexts_for(&self, node: &NodeId) -> Vec<ReasoningContext> {
        self.transcript()
            .into_iter()
            .filter(|c| &c.node == node)
            .collect()
    }

    fn next_entry(&self, context: &ReasoningContext) -> Option<ScriptEntry> {
        let script = self
            .scripts
            .get(&context.task)
            .unwrap_or(&self.default_script);
        let mut cursors = self
            .cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cursor = cursors.entry(context.node.clone()).or_insert(0);
        let entry = script.get(*cursor).cloned();
        if entry.is_some() {
            *cursor += 1;
        }
        entry
    }
}

fn summarize(context: &ReasoningContext) -> String {
    match context.last_observation() {
        Some(Observation::ToolOutput { output, .. }) => output.clone(),
        Some(Observation::ChildResults(results)) => results
            .iter()
            .map(|r| format!("{}: {}", r.child, r.outcome))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => format!("Completed: {}", context.task),
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn reason_step(
        &self,
        context: &ReasoningContext,
        _available_tools: &[String],
    ) -> Result<ReasoningStep, ReasonerError> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(context.clone());

        let Some(entry) = self.next_entry(context) else {
            return Ok(ReasoningStep::answer(summarize(context)));
        };
        if let Some(delay) = entry.delay {
            tokio::time::sleep(delay).await;
        }
        entry.result.map_err(ReasonerError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StepAction;
    use serde_json::json;

    const SCRIPT: &str = r##"
default:
  - answer: "leaf done"
    cost: 5
tasks:
  "Build the API":
    - spawn:
        - description: Design schema
          budget: 1000
        - description: Write handlers
          depends_on: [0]
          critical: true
      cost: 120
    - tool: write_file
      args: { path: api.md, content: "# API" }
      timeout_secs: 3
      confidence: { task_clarity: 0.9 }
    - fail: "model overloaded"
"##;

    #[test]
    fn test_parses_yaml_script() {
        let reasoner = ScriptedReasoner::from_yaml(SCRIPT).unwrap();
        let script = &reasoner.scripts["Build the API"];
        assert_eq!(script.len(), 3);

        let spawn = script[0].result.as_ref().unwrap();
        assert_eq!(spawn.token_cost, 120);
        match &spawn.action {
            StepAction::Spawn(requests) => {
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[0].budget, Some(1000));
                assert_eq!(requests[1].depends_on, vec![0]);
                assert!(requests[1].critical);
            }
            other => panic!("unexpected action {:?}", other),
        }

        let tool = script[1].result.as_ref().unwrap();
        assert_eq!(
            tool.action,
            StepAction::ToolCall {
                tool: "write_file".to_string(),
                args: json!({"path": "api.md", "content": "# API"}),
                timeout: Some(Duration::from_secs(3)),
            }
        );
        assert_eq!(tool.confidence.unwrap().task_clarity, Some(0.9));
        assert_eq!(script[2].result, Err("model overloaded".to_string()));
    }

    #[test]
    fn test_rejects_ambiguous_step() {
        let err = ScriptedReasoner::from_yaml("default:\n  - answer: a\n    fail: b\n").unwrap_err();
        assert!(matches!(err, ReasonerError::InvalidScript(_)));
    }

    #[tokio::test]
    async fn test_cursor_is_per_node_and_falls_back_to_summary() {
        let reasoner = ScriptedReasoner::new()
            .with_script("t", [ReasoningStep::answer("first")]);
        let a = ReasoningContext::new(NodeId::root("a"), 0, "t");
        let b = ReasoningContext::new(NodeId::root("b"), 0, "t");

        let step = reasoner.reason_step(&a, &[]).await.unwrap();
        assert_eq!(step.action, StepAction::FinalAnswer("first".to_string()));
        let step = reasoner.reason_step(&b, &[]).await.unwrap();
        assert_eq!(step.action, StepAction::FinalAnswer("first".to_string()));

        let step = reasoner.reason_step(&a, &[]).await.unwrap();
        assert_eq!(step.action, StepAction::FinalAnswer("Completed: t".to_string()));
        assert_eq!(reasoner.contexts_for(&NodeId::root("a")).len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_unavailable() {
        let reasoner = ScriptedReasoner::new().with_default([ScriptEntry::fail("boom")]);
        let ctx = ReasoningContext::new(NodeId::root("x"), 0, "anything");
        let err = reasoner.reason_step(&ctx, &[]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
