//! Uniform façade over tool collaborators.
//!
//! # Call Flow
//! ```text
//! 1. Capability check        -> Denied (no call attempted)
//! 2. Circuit breaker admit   -> CircuitOpen (no call attempted)
//! 3. Per-resource lock       (only for tools that declare a resource key)
//! 4. Execute on its own task under a deadline -> Timeout | ToolFailure | Ok
//! 5. Breaker updated with the outcome
//! ```
//! The gateway reports and never retries; retry policy belongs to the node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::breaker::{Admission, BreakerBoard};
use super::{CapabilitySet, ToolRegistry};
use crate::config::BreakerConfig;

/// Successful tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool: String,
    pub output: String,
    pub elapsed: Duration,
}

/// Why an invocation did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Tool '{tool}' is not granted to {caller}")]
    Denied { tool: String, caller: String },

    #[error("Circuit open for tool '{tool}' (retry in {retry_in:?})")]
    CircuitOpen { tool: String, retry_in: Duration },

    #[error("Tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },
}

impl GatewayError {
    /// Local failures a node may retry through its own reasoning.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ToolFailure { .. })
    }

    /// Failures that mean the call should never have been attempted.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    pub fn tool(&self) -> &str {
        match self {
            Self::Denied { tool, .. }
            | Self::CircuitOpen { tool, .. }
            | Self::Timeout { tool, .. }
            | Self::ToolFailure { tool, .. } => tool,
        }
    }
}

/// Frees a HalfOpen trial slot if the invocation is dropped before it resolves.
struct TrialGuard<'a> {
    breakers: &'a BreakerBoard,
    tool: &'a str,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breakers: &'a BreakerBoard, tool: &'a str, admission: Admission) -> Self {
        Self {
            breakers,
            tool,
            armed: admission == Admission::Trial,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(tool = self.tool, "Trial call abandoned before completion");
            self.breakers.abandon_trial(self.tool);
        }
    }
}

/// The only caller of tool collaborators.
pub struct ToolGateway {
    registry: ToolRegistry,
    breakers: BreakerBoard,
    resource_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    working_dir: PathBuf,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, breaker: BreakerConfig, working_dir: PathBuf) -> Self {
        Self {
            registry,
            breakers: BreakerBoard::new(breaker),
            resource_locks: Mutex::new(HashMap::new()),
            working_dir,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &BreakerBoard {
        &self.breakers
    }

    fn resource_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .resource_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Invoke `tool_name` on behalf of `caller`.
    ///
    /// # Postconditions
    /// - `Denied` and `CircuitOpen` never reach the collaborator
    /// - Every attempted call updates the tool's breaker exactly once
    pub async fn invoke(
        &self,
        caller: &str,
        capabilities: &CapabilitySet,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ToolResult, GatewayError> {
        let denied = || GatewayError::Denied {
            tool: tool_name.to_string(),
            caller: caller.to_string(),
        };
        if !capabilities.allows(tool_name) {
            tracing::warn!(caller, tool = tool_name, "Tool call denied: capability not granted");
            return Err(denied());
        }
        let tool = self.registry.get(tool_name).ok_or_else(denied)?;

        let admission = self.breakers.admit(tool_name).map_err(|retry_in| {
            tracing::debug!(caller, tool = tool_name, ?retry_in, "Failing fast on open circuit");
            GatewayError::CircuitOpen {
                tool: tool_name.to_string(),
                retry_in,
            }
        })?;
        let mut trial = TrialGuard::new(&self.breakers, tool_name, admission);

        let started = Instant::now();
        // The deadline starts once the resource is held, so waiting behind
        // another caller is not a failure of the tool.
        let resource = match tool.resource_key(&args, &self.working_dir) {
            Some(key) => {
                let lock = self.resource_lock(&key);
                tracing::trace!(caller, tool = tool_name, resource = %key, "Waiting for resource");
                Some(lock.lock_owned().await)
            }
            None => None,
        };
        let working_dir = self.working_dir.clone();

        // The collaborator runs detached so an abandoned call can keep going
        // (still holding its resource lock) while the caller moves on.
        let handle = tokio::spawn(async move {
            let _resource = resource;
            tool.execute(args, &working_dir).await
        });

        let outcome = tokio::time::timeout(timeout, handle).await;
        trial.disarm();
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(output))) => {
                self.breakers.record_success(tool_name);
                tracing::debug!(caller, tool = tool_name, ?elapsed, "Tool call succeeded");
                Ok(ToolResult {
                    tool: tool_name.to_string(),
                    output,
                    elapsed,
                })
            }
            Ok(Ok(Err(e))) => {
                self.breakers.record_failure(tool_name);
                tracing::info!(caller, tool = tool_name, error = %e, "Tool call failed");
                Err(GatewayError::ToolFailure {
                    tool: tool_name.to_string(),
                    message: format!("{:#}", e),
                })
            }
            Ok(Err(join_error)) => {
                self.breakers.record_failure(tool_name);
                tracing::error!(caller, tool = tool_name, error = %join_error, "Tool task panicked");
                Err(GatewayError::ToolFailure {
                    tool: tool_name.to_string(),
                    message: format!("tool task aborted: {}", join_error),
                })
            }
            Err(_) => {
                self.breakers.record_failure(tool_name);
                tracing::info!(caller, tool = tool_name, ?timeout, "Tool call abandoned at deadline");
                Err(GatewayError::Timeout {
                    tool: tool_name.to_string(),
                    timeout,
                })
            }
        }
    }
}
