//! MCP server exposing the tool registry.
//!
//! Speaks JSON-RPC 2.0, one message per line, and answers `initialize`,
//! `tools/list` and `tools/call`. Every call goes through a [`ToolGateway`],
//! so MCP clients get the same capability checks, deadlines, resource
//! serialization and circuit breakers as the agents in a run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::tools::{CapabilitySet, ToolGateway, ToolRegistry};

/// Caller name the gateway logs for MCP requests.
const CALLER: &str = "mcp";

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

// =============================================================================
// JSON-RPC Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    _jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct CallResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent::Text { text }],
            is_error,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves tool calls for one MCP client.
pub struct McpServer {
    gateway: Arc<ToolGateway>,
    capabilities: CapabilitySet,
    timeout: Duration,
}

impl McpServer {
    /// `capabilities` bounds which registered tools the client may call.
    pub fn new(gateway: Arc<ToolGateway>, capabilities: CapabilitySet, timeout: Duration) -> Self {
        Self {
            gateway,
            capabilities,
            timeout,
        }
    }

    /// Server over every tool in `registry`, with the configured breakers and deadline.
    pub fn from_config(config: &Config, registry: ToolRegistry) -> Self {
        let capabilities = registry.capabilities();
        let gateway = ToolGateway::new(
            registry,
            config.breaker.clone(),
            config.workspace_path.clone(),
        );
        Self::new(Arc::new(gateway), capabilities, config.tool_timeout)
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.gateway
            .registry()
            .list_tools()
            .into_iter()
            .filter(|info| self.capabilities.allows(&info.name))
            .map(|info| ToolDefinition {
                name: info.name,
                description: info.description,
                input_schema: info.parameters,
            })
            .collect()
    }

    async fn call_tool(&self, params: &Value) -> Result<CallResult, String> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Invalid params: missing tool name".to_string())?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        tracing::debug!(tool = name, "MCP tool call");
        let result = self
            .gateway
            .invoke(CALLER, &self.capabilities, name, args, self.timeout)
            .await;
        Ok(match result {
            Ok(result) => CallResult::text(result.output, false),
            Err(e) => CallResult::text(format!("Tool error: {}", e), true),
        })
    }

    async fn handle_request(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "ralph-mcp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {
                        "tools": {
                            "listChanged": false
                        }
                    }
                }),
            )),
            "notifications/initialized" | "initialized" => None,
            "tools/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "tools": self.tool_definitions() }),
            )),
            "tools/call" => Some(match self.call_tool(&request.params).await {
                Ok(result) => JsonRpcResponse::success(id, json!(result)),
                Err(message) => JsonRpcResponse::error(id, INVALID_PARAMS, message),
            }),
            method if method.starts_with("notifications/") => {
                tracing::trace!(method, "Ignoring notification");
                None
            }
            method => Some(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            )),
        }
    }

    /// Answer one line of input; `None` for notifications and blank lines.
    async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => self.handle_request(&request).await,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable MCP message");
                Some(JsonRpcResponse::error(Value::Null, PARSE_ERROR, e.to_string()))
            }
        }
    }

    /// Read requests from `reader` until EOF, writing one response line each.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };
            let mut encoded = serde_json::to_string(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            encoded.push('\n');
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;
        }
        tracing::info!("MCP client closed the connection");
        Ok(())
    }
}
