//! ralph-swarm - command line entry point.
//!
//! Runs one task through the orchestration tree, driven by a YAML reasoning
//! script or a chat completions endpoint. The event stream is rendered to
//! the log and optionally mirrored to a markdown progress file. While a
//! handoff is pending, each line typed on stdin is sent back as guidance;
//! `stop` requests a handoff and `quit` terminates the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ralph_swarm::agents::NodeSnapshot;
use ralph_swarm::config::{Config, ConfigError};
use ralph_swarm::events::StateEvent;
use ralph_swarm::fallback::FallbackMode;
use ralph_swarm::llm::{OpenAiReasoner, Reasoner, ScriptedReasoner};
use ralph_swarm::tools::ToolRegistry;
use ralph_swarm::{InterruptKind, Orchestrator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ralph_swarm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: max_depth={}, root_budget={}",
        config.max_depth, config.root_budget
    );

    let task = read_task(&config.workspace_path)?;
    let registry = ToolRegistry::new();
    let reasoner = build_reasoner(&config, &registry)?;
    let progress_file = std::env::var("RALPH_PROGRESS_FILE").ok().map(PathBuf::from);

    let orchestrator = Arc::new(Orchestrator::new(config, reasoner, registry));
    tokio::spawn(render_events(
        orchestrator.subscribe(),
        Arc::clone(&orchestrator),
        progress_file,
    ));

    let handle = orchestrator.start(&task)?;
    info!("Run {} started for {}", handle.run_id, handle.root);
    tokio::spawn(read_commands(Arc::clone(&orchestrator)));

    let result = tokio::select! {
        result = handle.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            let terminated = orchestrator.terminate("interrupted")?;
            anyhow::bail!("Interrupted; terminated {} nodes", terminated.len());
        }
    };

    let ledger = orchestrator.ledger();
    if let Err(e) = ledger.check_invariants() {
        warn!("Budget ledger inconsistent after run: {}", e);
    }
    println!("{}", result.outcome);
    info!("Run finished: {} work units consumed", result.consumed);
    if !result.outcome.is_completed() {
        anyhow::bail!("Task did not complete: {}", result.outcome);
    }
    Ok(())
}

/// A scripted reasoner when `RALPH_SCRIPT` is set, otherwise the chat completions endpoint.
fn build_reasoner(config: &Config, registry: &ToolRegistry) -> anyhow::Result<Arc<dyn Reasoner>> {
    if let Ok(script) = std::env::var("RALPH_SCRIPT") {
        let reasoner = ScriptedReasoner::from_file(Path::new(&script))
            .with_context(|| format!("Failed to load reasoning script {}", script))?;
        info!("Reasoning from script {}", script);
        return Ok(Arc::new(reasoner));
    }
    if config.llm.api_key.is_none() {
        return Err(ConfigError::MissingEnvVar("OPENAI_API_KEY (or RALPH_SCRIPT)".to_string()).into());
    }
    let reasoner = OpenAiReasoner::new(config.llm.clone(), registry)?;
    info!("Reasoning with {} at {}", config.llm.model, config.llm.api_url);
    Ok(Arc::new(reasoner))
}

/// Task from the command line, or `AGENT.md` in the workspace when none is given.
fn read_task(workspace: &Path) -> anyhow::Result<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return Ok(args.join(" "));
    }
    let path = workspace.join("AGENT.md");
    let task = std::fs::read_to_string(&path)
        .with_context(|| format!("No task given and {} is unreadable", path.display()))?;
    let task = task.trim().to_string();
    if task.is_empty() {
        anyhow::bail!("{} is empty", path.display());
    }
    Ok(task)
}

async fn read_commands(orchestrator: Arc<Orchestrator>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let result = match line {
            "" => continue,
            "stop" => orchestrator.interrupt(InterruptKind::Stop).map(|_| ()),
            "quit" => orchestrator.terminate("quit by user").map(|_| ()),
            guidance => match orchestrator.mode() {
                FallbackMode::AwaitingGuidance { .. } => orchestrator.resume(guidance).map(|_| ()),
                FallbackMode::Autonomous => orchestrator
                    .interrupt(InterruptKind::PriorityMessage(guidance.to_string()))
                    .map(|_| ()),
            },
        };
        if let Err(e) = result {
            warn!("Command '{}' failed: {}", line, e);
        }
    }
}

async fn render_events(
    mut events: broadcast::Receiver<ralph_swarm::events::EventEnvelope>,
    orchestrator: Arc<Orchestrator>,
    progress_file: Option<PathBuf>,
) {
    loop {
        let envelope = match events.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &envelope.event {
            StateEvent::NodeCreated {
                node, budget, ..
            } => info!("[{}] created (budget {:?})", node, budget),
            StateEvent::NodeStatusChanged {
                node, from, to, detail,
            } => match detail {
                Some(detail) => info!("[{}] {} -> {} ({})", node, from, to, detail),
                None => info!("[{}] {} -> {}", node, from, to),
            },
            StateEvent::MessageRouted { .. } => {}
            StateEvent::FallbackTriggered { summary, .. } => {
                eprintln!("{}", summary);
                eprintln!("Type guidance to resume, or `quit` to terminate.");
            }
        }

        let mirrored = matches!(
            envelope.event,
            StateEvent::NodeCreated { .. }
                | StateEvent::NodeStatusChanged { .. }
                | StateEvent::FallbackTriggered { .. }
        );
        if let (true, Some(path)) = (mirrored, &progress_file) {
            let markdown = render_progress(&orchestrator.snapshot());
            if let Err(e) = tokio::fs::write(path, markdown).await {
                warn!("Failed to write progress file {}: {}", path.display(), e);
            }
        }
    }
}

fn render_progress(nodes: &[NodeSnapshot]) -> String {
    let mut out = String::from("# Progress\n\n");
    for node in nodes {
        let indent = "  ".repeat(node.depth as usize);
        let checkbox = if node.status.is_terminal() { "x" } else { " " };
        out.push_str(&format!(
            "{}- [{}] `{}` {} ({})",
            indent, checkbox, node.id, node.description, node.status
        ));
        if let Some(consumed) = node.consumed {
            out.push_str(&format!(", {}/{} units", consumed, node.ceiling));
        }
        if let Some(by) = &node.terminated_by {
            out.push_str(&format!(", {}", by));
        }
        out.push('\n');
    }
    out
}
