//! Shared fixtures for orchestration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ralph_swarm::agents::NodeStatus;
use ralph_swarm::config::Config;
use ralph_swarm::events::EventEnvelope;
use ralph_swarm::llm::{Reasoner, ScriptedReasoner};
use ralph_swarm::tools::{Tool, ToolRegistry};
use ralph_swarm::Orchestrator;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Replies with its `text` argument.
pub struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given text"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": { "text": { "type": "string" } } })
    }

    async fn execute(&self, args: Value, _working_dir: &Path) -> anyhow::Result<String> {
        Ok(args["text"].as_str().unwrap_or_default().to_string())
    }
}

/// Always fails, counting how often it was actually executed.
pub struct Flaky {
    name: String,
    calls: AtomicUsize,
}

impl Flaky {
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for Flaky {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "A service that is down"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _args: Value, _working_dir: &Path) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("connection refused")
    }
}

pub fn config() -> Config {
    Config::new(std::env::temp_dir())
}

pub fn tools() -> ToolRegistry {
    ToolRegistry::empty().with_tool(Arc::new(Echo))
}

pub fn orchestrator(config: Config, reasoner: &Arc<ScriptedReasoner>, tools: ToolRegistry) -> Orchestrator {
    Orchestrator::new(config, Arc::clone(reasoner) as Arc<dyn Reasoner>, tools)
}

/// Everything published so far.
pub fn drain(events: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Poll until `node` reaches `status`, panicking after a minute of (virtual) time.
pub async fn wait_for_status(orchestrator: &Orchestrator, node: &str, status: NodeStatus) {
    for _ in 0..600 {
        let current = orchestrator
            .snapshot()
            .into_iter()
            .find(|n| n.id.as_str() == node)
            .map(|n| n.status);
        if current == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} never reached {}", node, status);
}

/// Poll until the fallback controller waits for guidance.
pub async fn wait_for_handoff(orchestrator: &Orchestrator) {
    for _ in 0..600 {
        if !orchestrator.mode().is_autonomous() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no handoff was emitted");
}
