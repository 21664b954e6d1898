//! Chat completions reasoner.
//!
//! Each step is one request to an OpenAI-compatible `/chat/completions`
//! endpoint. The node's tools are offered as functions next to two built-ins:
//! `final_answer` ends the node and `spawn-child` delegates subtasks. A reply
//! with plain content and no function call is taken as the final answer.
//! The step's token cost is the `usage.total_tokens` the endpoint reports.
//!
//! Rate limits, server errors and network failures are retried with
//! exponential backoff, honoring `Retry-After`. Any other 4xx status is a
//! rejection and fails the node.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Observation, Reasoner, ReasonerError, ReasoningContext, ReasoningStep, SpawnRequest};
use crate::config::LlmConfig;
use crate::confidence::ConfidenceFactors;
use crate::tools::{ToolInfo, ToolRegistry, SPAWN_CHILD};

const FINAL_ANSWER: &str = "final_answer";

/// Observations longer than this many characters are cut before sending.
const MAX_OBSERVATION_CHARS: usize = 4000;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reasoner backed by a chat completions endpoint.
pub struct OpenAiReasoner {
    client: Client,
    config: LlmConfig,
    /// Schemas of every registered tool, by name
    tools: HashMap<String, ToolInfo>,
}

impl OpenAiReasoner {
    pub fn new(config: LlmConfig, registry: &ToolRegistry) -> Result<Self, ReasonerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ReasonerError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        let tools = registry
            .list_tools()
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();
        Ok(Self {
            client,
            config,
            tools,
        })
    }

    /// Function definitions for the tools this node may call.
    fn functions(&self, available_tools: &[String]) -> Vec<FunctionTool> {
        let mut out = Vec::with_capacity(available_tools.len() + 1);
        for name in available_tools {
            if name == SPAWN_CHILD {
                out.push(spawn_function());
                continue;
            }
            match self.tools.get(name) {
                Some(info) => out.push(FunctionTool::new(
                    &info.name,
                    &info.description,
                    info.parameters.clone(),
                )),
                None => tracing::debug!(tool = %name, "No schema registered, tool not offered"),
            }
        }
        out.push(final_answer_function());
        out
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> Result<String, Failure> {
        let mut builder = self
            .client
            .post(&self.config.api_url)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("Request timeout: {}", e)
            } else if e.is_connect() {
                format!("Connection failed: {}", e)
            } else {
                format!("Request failed: {}", e)
            };
            Failure::Transient {
                message,
                retry_after: None,
            }
        })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(|e| Failure::Transient {
            message: format!("Failed to read response: {}", e),
            retry_after: None,
        })?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status.as_u16(), body, retry_after))
        }
    }

    /// Send `request`, retrying transient failures up to the configured limit.
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ReasonerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(request).await {
                Ok(body) => {
                    if attempt > 0 {
                        tracing::info!("Reasoner request succeeded after {} retries", attempt);
                    }
                    return Ok(body);
                }
                Err(Failure::Fatal(e)) => {
                    tracing::error!(error = %e, "Reasoner request rejected");
                    return Err(e);
                }
                Err(Failure::Transient {
                    message,
                    retry_after,
                }) => {
                    if attempt >= self.config.max_retries {
                        tracing::warn!(attempts = attempt + 1, "Reasoner request failed: {}", message);
                        return Err(ReasonerError::Unavailable(message));
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff(attempt));
                    tracing::warn!(
                        "Reasoner attempt {} failed, retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    async fn reason_step(
        &self,
        context: &ReasoningContext,
        available_tools: &[String],
    ) -> Result<ReasoningStep, ReasonerError> {
        let may_spawn = available_tools.iter().any(|t| t == SPAWN_CHILD);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(context, may_spawn),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt(context),
                },
            ],
            tools: self.functions(available_tools),
            tool_choice: "auto",
            temperature: self.config.temperature,
        };

        tracing::debug!(
            node = %context.node,
            model = %self.config.model,
            iteration = context.iteration,
            "Requesting reasoning step"
        );
        let body = self.complete(&request).await?;
        parse_reply(&body)
    }
}

enum Failure {
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    Fatal(ReasonerError),
}

fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> Failure {
    match status {
        429 => Failure::Transient {
            message: format!("Rate limited: {}", body),
            retry_after,
        },
        400..=499 => Failure::Fatal(ReasonerError::Rejected {
            status,
            message: body,
        }),
        _ => Failure::Transient {
            message: format!("Server error {}: {}", status, body),
            retry_after,
        },
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1)
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

// ============================================================================
// Prompt
// ============================================================================

fn system_prompt(context: &ReasoningContext, may_spawn: bool) -> String {
    let mut prompt = format!(
        "You are agent {} at depth {} of a recursive agent tree. \
         Work toward your task one step at a time by calling exactly one function per reply. \
         Call `{}` with your result once the task is done.",
        context.node, context.depth, FINAL_ANSWER
    );
    if may_spawn {
        prompt.push_str(&format!(
            " Call `{}` to delegate independent subtasks to child agents; \
             their results come back to you in order.",
            SPAWN_CHILD
        ));
    }
    prompt.push_str(
        " Every reply spends from a fixed work budget. \
         Include your confidence factors, each between 0 and 1, when you answer or delegate.",
    );
    prompt
}

fn user_prompt(context: &ReasoningContext) -> String {
    let mut out = format!(
        "Task: {}\nStep: {}\nBudget remaining: {} work units\n",
        context.task,
        context.iteration + 1,
        context.budget_remaining
    );
    if !context.history.is_empty() {
        out.push_str("\nObservations so far:\n");
        for (i, observation) in context.history.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, describe(observation)));
        }
    }
    if !context.guidance.is_empty() {
        out.push_str("\nGuidance from the operator:\n");
        for guidance in &context.guidance {
            out.push_str(&format!("- {}\n", guidance));
        }
    }
    out
}

fn describe(observation: &Observation) -> String {
    match observation {
        Observation::ToolOutput { tool, output } => {
            format!("`{}` returned: {}", tool, truncate(output))
        }
        Observation::ToolError { tool, error } => format!("`{}` failed: {}", tool, error),
        Observation::ChildResults(results) => {
            let lines: Vec<String> = results
                .iter()
                .map(|r| format!("   - {} ({}): {}", r.description, r.child, truncate(&r.outcome.to_string())))
                .collect();
            format!("Subtask results:\n{}", lines.join("\n"))
        }
        Observation::SpawnRejected { reason } => format!("Spawn rejected: {}", reason),
        Observation::PriorityMessage(message) => format!("Priority message: {}", message),
        Observation::ReasonerError(error) => format!("Previous step failed: {}", error),
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_OBSERVATION_CHARS) {
        Some((cut, _)) => format!("{}... ({} bytes total)", &text[..cut], text.len()),
        None => text.to_string(),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    tools: Vec<FunctionTool>,
    tool_choice: &'static str,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct FunctionTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDef,
}

impl FunctionTool {
    fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function",
            function: FunctionDef {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

fn confidence_schema() -> Value {
    let factor = json!({"type": "number", "minimum": 0, "maximum": 1});
    json!({
        "type": "object",
        "description": "Confidence at this decision point",
        "properties": {
            "task_clarity": factor,
            "solution_certainty": factor,
            "verification_success": factor,
            "precedent_match": factor,
            "resource_availability": factor
        }
    })
}

fn final_answer_function() -> FunctionTool {
    FunctionTool::new(
        FINAL_ANSWER,
        "Finish the task and return the result to the parent",
        json!({
            "type": "object",
            "properties": {
                "answer": {"type": "string", "description": "The task result"},
                "confidence": confidence_schema()
            },
            "required": ["answer"]
        }),
    )
}

fn spawn_function() -> FunctionTool {
    FunctionTool::new(
        SPAWN_CHILD,
        "Delegate subtasks to child agents and wait for their results",
        json!({
            "type": "object",
            "properties": {
                "subtasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": {"type": "string"},
                            "budget": {"type": "integer", "description": "Work unit ceiling"},
                            "capabilities": {"type": "array", "items": {"type": "string"}},
                            "depends_on": {
                                "type": "array",
                                "items": {"type": "integer"},
                                "description": "Indices of subtasks in this list that must finish first"
                            },
                            "priority": {"type": "integer", "description": "Lower starts first"},
                            "critical": {"type": "boolean"}
                        },
                        "required": ["description"]
                    }
                },
                "confidence": confidence_schema()
            },
            "required": ["subtasks"]
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    /// JSON-encoded object
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl Usage {
    fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or_else(|| self.prompt_tokens.saturating_add(self.completion_tokens))
    }
}

#[derive(Debug, Deserialize)]
struct FinalAnswerArgs {
    answer: String,
    #[serde(default)]
    confidence: Option<ConfidenceFactors>,
}

#[derive(Debug, Deserialize)]
struct SpawnArgs {
    subtasks: Vec<SpawnRequest>,
    #[serde(default)]
    confidence: Option<ConfidenceFactors>,
}

fn parse_reply(body: &str) -> Result<ReasoningStep, ReasonerError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ReasonerError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
    let cost = parsed.usage.as_ref().map(Usage::total).unwrap_or(0);
    let message = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ReasonerError::InvalidResponse("No choices in response".to_string()))?
        .message;

    let mut calls = message.tool_calls.unwrap_or_default().into_iter();
    let step = match calls.next() {
        Some(call) => {
            if calls.len() > 0 {
                tracing::debug!(ignored = calls.len(), "Reply named several functions, taking the first");
            }
            step_from_call(call.function)?
        }
        None => match message.content.as_deref().map(str::trim) {
            Some(content) if !content.is_empty() => ReasoningStep::answer(content),
            _ => {
                return Err(ReasonerError::InvalidResponse(
                    "Reply has neither content nor a function call".to_string(),
                ))
            }
        },
    };
    Ok(step.with_cost(cost))
}

fn step_from_call(call: FunctionCall) -> Result<ReasoningStep, ReasonerError> {
    let FunctionCall { name, arguments } = call;
    let args: Value = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&arguments).map_err(|e| {
            ReasonerError::InvalidResponse(format!("Arguments for '{}' are not JSON: {}", name, e))
        })?
    };
    let mismatch = |e: serde_json::Error| {
        ReasonerError::InvalidResponse(format!("Arguments for '{}' do not match: {}", name, e))
    };

    match name.as_str() {
        FINAL_ANSWER => {
            let args: FinalAnswerArgs = serde_json::from_value(args).map_err(mismatch)?;
            Ok(attach(ReasoningStep::answer(args.answer), args.confidence))
        }
        SPAWN_CHILD => {
            let args: SpawnArgs = serde_json::from_value(args).map_err(mismatch)?;
            Ok(attach(ReasoningStep::spawn(args.subtasks), args.confidence))
        }
        _ => Ok(ReasoningStep::tool(name.clone(), args)),
    }
}

fn attach(step: ReasoningStep, confidence: Option<ConfidenceFactors>) -> ReasoningStep {
    match confidence {
        Some(confidence) => step.with_confidence(confidence),
        None => step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::NodeId;
    use crate::llm::StepAction;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn reply(message: Value) -> String {
        json!({
            "choices": [{"message": message, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 40, "completion_tokens": 17, "total_tokens": 57}
        })
        .to_string()
    }

    fn call(name: &str, arguments: Value) -> Value {
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": name, "arguments": arguments.to_string()}
            }]
        })
    }

    #[test]
    fn test_plain_content_is_a_final_answer() {
        let step = parse_reply(&reply(json!({"role": "assistant", "content": " All done. "}))).unwrap();
        assert_eq!(step, ReasoningStep::answer("All done.").with_cost(57));
    }

    #[test]
    fn test_function_call_becomes_a_tool_step() {
        let step = parse_reply(&reply(call("read_file", json!({"path": "README.md"})))).unwrap();
        assert_eq!(
            step.action,
            StepAction::ToolCall {
                tool: "read_file".to_string(),
                args: json!({"path": "README.md"}),
                timeout: None,
            }
        );
        assert_eq!(step.token_cost, 57);
        assert!(step.confidence.is_none());
    }

    #[test]
    fn test_spawn_call_carries_subtasks_and_confidence() {
        let step = parse_reply(&reply(call(
            SPAWN_CHILD,
            json!({
                "subtasks": [
                    {"description": "Design schema", "budget": 1000},
                    {"description": "Write handlers", "depends_on": [0], "critical": true}
                ],
                "confidence": {"task_clarity": 0.9, "solution_certainty": 0.8}
            }),
        )))
        .unwrap();

        assert_eq!(
            step.action,
            StepAction::Spawn(vec![
                SpawnRequest::new("Design schema").with_budget(1000),
                SpawnRequest::new("Write handlers").depends_on([0]).critical(),
            ])
        );
        let confidence = step.confidence.unwrap();
        assert_eq!(confidence.task_clarity, Some(0.9));
        assert_eq!(confidence.precedent_match, None);
    }

    #[test]
    fn test_final_answer_call_with_confidence() {
        let step = parse_reply(&reply(call(
            FINAL_ANSWER,
            json!({"answer": "API built", "confidence": {"verification_success": 0.4}}),
        )))
        .unwrap();
        assert_eq!(step.action, StepAction::FinalAnswer("API built".to_string()));
        assert_eq!(step.confidence.unwrap().verification_success, Some(0.4));
    }

    #[test]
    fn test_missing_total_tokens_sums_the_parts() {
        let body = json!({
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        assert_eq!(parse_reply(&body.to_string()).unwrap().token_cost, 15);
    }

    #[test]
    fn test_unusable_replies_are_transient_errors() {
        let empty = parse_reply(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(empty, ReasonerError::InvalidResponse(_)));
        assert!(empty.is_transient());

        let bad_args = parse_reply(&reply(call(SPAWN_CHILD, json!({"tasks": []})))).unwrap_err();
        assert!(bad_args.to_string().contains("spawn-child"));

        let blank = parse_reply(&reply(json!({"content": "  "}))).unwrap_err();
        assert!(matches!(blank, ReasonerError::InvalidResponse(_)));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(401, "bad key".into(), None),
            Failure::Fatal(ReasonerError::Rejected { status: 401, .. })
        ));
        assert!(matches!(
            classify_status(429, String::new(), Some(Duration::from_secs(7))),
            Failure::Transient { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));
        assert!(matches!(classify_status(503, String::new(), None), Failure::Transient { .. }));
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn test_only_granted_tools_are_offered() {
        let reasoner = OpenAiReasoner::new(LlmConfig::default(), &ToolRegistry::new()).unwrap();
        let names = |functions: Vec<FunctionTool>| -> Vec<String> {
            functions.into_iter().map(|f| f.function.name).collect()
        };

        assert_eq!(
            names(reasoner.functions(&["read_file".to_string(), "teleport".to_string()])),
            vec!["read_file", FINAL_ANSWER]
        );
        assert_eq!(
            names(reasoner.functions(&[SPAWN_CHILD.to_string()])),
            vec![SPAWN_CHILD, FINAL_ANSWER]
        );
    }

    #[test]
    fn test_prompt_carries_history_and_guidance() {
        let mut context = ReasoningContext::new(NodeId::root("build the api"), 0, "Build the API");
        context.iteration = 2;
        context.budget_remaining = 900;
        context.history.push(Observation::ToolError {
            tool: "run_command".to_string(),
            error: "exit status 1".to_string(),
        });
        context.guidance.push("Use the staging database".to_string());

        let prompt = user_prompt(&context);
        assert!(prompt.starts_with("Task: Build the API\nStep: 3\nBudget remaining: 900"));
        assert!(prompt.contains("1. `run_command` failed: exit status 1"));
        assert!(prompt.contains("- Use the staging database"));

        assert!(!system_prompt(&context, false).contains(SPAWN_CHILD));
        assert!(system_prompt(&context, true).contains(SPAWN_CHILD));
    }

    #[test]
    fn test_long_observations_are_truncated() {
        let long = "é".repeat(MAX_OBSERVATION_CHARS + 10);
        let cut = truncate(&long);
        assert!(cut.starts_with(&"é".repeat(MAX_OBSERVATION_CHARS)));
        assert!(cut.ends_with(&format!("({} bytes total)", long.len())));
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Answer one connection per reply, in order, and return the raw requests.
    async fn serve(listener: TcpListener, replies: Vec<(&'static str, String)>) -> Vec<String> {
        let mut requests = Vec::new();
        for (status_line, body) in replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut stream).await);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nRetry-After: 0\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        requests
    }

    #[tokio::test]
    async fn test_retries_a_server_error_then_parses_the_step() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![
                ("503 Service Unavailable", r#"{"error": "overloaded"}"#.to_string()),
                ("200 OK", reply(json!({"content": "done"}))),
            ],
        ));

        let config = LlmConfig {
            api_url: format!("http://{}/v1/chat/completions", addr),
            api_key: Some("sk-test".to_string()),
            max_retries: 1,
            ..LlmConfig::default()
        };
        let reasoner = OpenAiReasoner::new(config, &ToolRegistry::new()).unwrap();
        let context = ReasoningContext::new(NodeId::root("summarize"), 0, "Summarize");
        let step = reasoner
            .reason_step(&context, &["read_file".to_string()])
            .await
            .unwrap();
        assert_eq!(step, ReasoningStep::answer("done").with_cost(57));

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        let first = requests[0].to_ascii_lowercase();
        assert!(first.starts_with("post /v1/chat/completions"));
        assert!(first.contains("authorization: bearer sk-test"));
        assert!(requests[0].contains(r#""model":"gpt-4o-mini""#));
        assert!(requests[0].contains(r#""name":"read_file""#));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![("404 Not Found", r#"{"error": "unknown model"}"#.to_string())],
        ));

        let config = LlmConfig {
            api_url: format!("http://{}/v1/chat/completions", addr),
            ..LlmConfig::default()
        };
        let reasoner = OpenAiReasoner::new(config, &ToolRegistry::new()).unwrap();
        let context = ReasoningContext::new(NodeId::root("summarize"), 0, "Summarize");
        let err = reasoner.reason_step(&context, &[]).await.unwrap_err();

        assert!(matches!(err, ReasonerError::Rejected { status: 404, .. }));
        assert!(!err.is_transient());
        assert_eq!(server.await.unwrap().len(), 1);
    }
}
