//! Configuration management for ralph-swarm.
//!
//! Configuration can be set via environment variables:
//! - `WORKSPACE_PATH` - Optional. Default directory for tool paths. Defaults to current directory.
//! - `RALPH_MAX_DEPTH` - Optional. Deepest allowed node depth. Defaults to `3`.
//! - `RALPH_ROOT_BUDGET` - Optional. Root ceiling in work units. Defaults to `200000`.
//! - `RALPH_CHILD_BUDGET_FRACTION` - Optional. Child ceiling cap as a fraction of the parent's. Defaults to `0.5`.
//! - `RALPH_DEFAULT_CHILD_BUDGET` - Optional. Ceiling for spawns that request none. Defaults to the cap.
//! - `RALPH_SPAWN_WAIT_SECS` - Optional. Bounded wait for a queued spawn. Defaults to `30`.
//! - `RALPH_MAX_SPAWN_BATCH` - Optional. Subtasks per spawn request. Defaults to `500`.
//! - `RALPH_MAX_ITERATIONS` - Optional. Reasoning steps per node. Defaults to `50`.
//! - `RALPH_MAX_TOOL_RETRIES` - Optional. Retries of a failing tool before task failure. Defaults to `2`.
//! - `RALPH_TOOL_TIMEOUT_SECS` - Optional. Default tool deadline. Defaults to `60`.
//! - `RALPH_FAILURE_THRESHOLD` - Optional. Consecutive failures that open a breaker. Defaults to `5`.
//! - `RALPH_RECOVERY_TIMEOUT_SECS` - Optional. Open breaker cooldown. Defaults to `30`.
//! - `RALPH_CONFIDENCE_THRESHOLD` - Optional. Fallback below this score. Defaults to `0.7`.
//! - `RALPH_MAX_CONSECUTIVE_ERRORS` - Optional. Fallback above this count. Defaults to `3`.
//! - `RALPH_STALL_WINDOW_SECS` - Optional. Fallback after this long without a transition. Defaults to `300`.
//! - `RALPH_CIRCUIT_CASCADE_TOOLS` - Optional. Open breakers that escalate. Defaults to `2`.
//! - `RALPH_EVENT_CAPACITY` - Optional. State event buffer. Defaults to `1024`.
//! - `OPENAI_API_KEY` - Optional. Key for the chat completions endpoint. Required when no `RALPH_SCRIPT` is given.
//! - `RALPH_LLM_URL` - Optional. Chat completions endpoint. Defaults to `https://api.openai.com/v1/chat/completions`.
//! - `RALPH_MODEL` - Optional. Model name. Defaults to `gpt-4o-mini`.
//! - `RALPH_LLM_TEMPERATURE` - Optional. Sampling temperature. Defaults to `0`.
//! - `RALPH_LLM_MAX_RETRIES` - Optional. Retries of a rate-limited or failed request. Defaults to `3`.
//! - `RALPH_LLM_TIMEOUT_SECS` - Optional. Per-request deadline. Defaults to `120`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Circuit breaker settings shared by every tool.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures (timeouts included) that open the breaker
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls before allowing a trial
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Chat completions endpoint used by the model-backed reasoner.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,

    /// Sent as a bearer token when present
    pub api_key: Option<String>,

    pub model: String,

    pub temperature: f64,

    /// Retries of 429, 5xx and network failures before reporting unavailable
    pub max_retries: u32,

    /// Deadline for one HTTP request
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_retries: 3,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Thresholds that hand control back to a human.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    /// Confidence scores strictly below this trigger a handoff
    pub confidence_threshold: f64,

    /// Consecutive errors on one node strictly above this trigger a handoff
    pub max_consecutive_errors: u32,

    /// A running node idle for longer than this triggers a handoff
    pub stall_window: Duration,

    /// Distinct tools with open breakers that trigger a handoff
    pub circuit_cascade_tools: usize,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_consecutive_errors: 3,
            stall_window: Duration::from_secs(300),
            circuit_cascade_tools: 2,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default directory for relative tool paths
    pub workspace_path: PathBuf,

    /// Deepest allowed node depth (root is 0)
    pub max_depth: u32,

    /// Ceiling of the root allocation in work units
    pub root_budget: u64,

    /// Child ceiling cap as a fraction of the parent's ceiling
    pub child_budget_fraction: f64,

    /// Ceiling for spawn requests that do not name one
    pub default_child_budget: Option<u64>,

    /// Longest a spawn may queue for budget before it is rejected
    pub spawn_wait: Duration,

    /// Most subtasks accepted in one spawn request
    pub max_spawn_batch: usize,

    /// Reasoning steps a single node may take
    pub max_iterations: usize,

    /// Retries of Timeout/ToolFailure on one tool before the task fails
    pub max_tool_retries: u32,

    /// Deadline for tool calls that do not specify one
    pub tool_timeout: Duration,

    /// Per-tool circuit breaker settings
    pub breaker: BreakerConfig,

    /// Human fallback thresholds
    pub fallback: FallbackPolicy,

    /// Capacity of the state event broadcast buffer
    pub event_capacity: usize,

    /// Model endpoint for the model-backed reasoner
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_path: PathBuf::from("."),
            max_depth: 3,
            root_budget: 200_000,
            child_budget_fraction: 0.5,
            default_child_budget: None,
            spawn_wait: Duration::from_secs(30),
            max_spawn_batch: 500,
            max_iterations: 50,
            max_tool_retries: 2,
            tool_timeout: Duration::from_secs(60),
            breaker: BreakerConfig::default(),
            fallback: FallbackPolicy::default(),
            event_capacity: 1024,
            llm: LlmConfig::default(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but does not parse,
    /// or if a fraction/threshold falls outside [0, 1].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let default_child_budget = match std::env::var("RALPH_DEFAULT_CHILD_BUDGET") {
            Ok(raw) => Some(raw.trim().parse().map_err(|e| {
                ConfigError::InvalidValue(
                    "RALPH_DEFAULT_CHILD_BUDGET".to_string(),
                    format!("{}", e),
                )
            })?),
            Err(_) => None,
        };

        let config = Self {
            workspace_path,
            max_depth: env_parse("RALPH_MAX_DEPTH", defaults.max_depth)?,
            root_budget: env_parse("RALPH_ROOT_BUDGET", defaults.root_budget)?,
            child_budget_fraction: env_parse(
                "RALPH_CHILD_BUDGET_FRACTION",
                defaults.child_budget_fraction,
            )?,
            default_child_budget,
            spawn_wait: env_secs("RALPH_SPAWN_WAIT_SECS", defaults.spawn_wait)?,
            max_spawn_batch: env_parse("RALPH_MAX_SPAWN_BATCH", defaults.max_spawn_batch)?,
            max_iterations: env_parse("RALPH_MAX_ITERATIONS", defaults.max_iterations)?,
            max_tool_retries: env_parse("RALPH_MAX_TOOL_RETRIES", defaults.max_tool_retries)?,
            tool_timeout: env_secs("RALPH_TOOL_TIMEOUT_SECS", defaults.tool_timeout)?,
            breaker: BreakerConfig {
                failure_threshold: env_parse(
                    "RALPH_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?,
                recovery_timeout: env_secs(
                    "RALPH_RECOVERY_TIMEOUT_SECS",
                    defaults.breaker.recovery_timeout,
                )?,
            },
            fallback: FallbackPolicy {
                confidence_threshold: env_parse(
                    "RALPH_CONFIDENCE_THRESHOLD",
                    defaults.fallback.confidence_threshold,
                )?,
                max_consecutive_errors: env_parse(
                    "RALPH_MAX_CONSECUTIVE_ERRORS",
                    defaults.fallback.max_consecutive_errors,
                )?,
                stall_window: env_secs("RALPH_STALL_WINDOW_SECS", defaults.fallback.stall_window)?,
                circuit_cascade_tools: env_parse(
                    "RALPH_CIRCUIT_CASCADE_TOOLS",
                    defaults.fallback.circuit_cascade_tools,
                )?,
            },
            event_capacity: env_parse("RALPH_EVENT_CAPACITY", defaults.event_capacity)?,
            llm: LlmConfig {
                api_url: std::env::var("RALPH_LLM_URL").unwrap_or(defaults.llm.api_url),
                api_key: std::env::var("OPENAI_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                model: std::env::var("RALPH_MODEL").unwrap_or(defaults.llm.model),
                temperature: env_parse("RALPH_LLM_TEMPERATURE", defaults.llm.temperature)?,
                max_retries: env_parse("RALPH_LLM_MAX_RETRIES", defaults.llm.max_retries)?,
                request_timeout: env_secs("RALPH_LLM_TIMEOUT_SECS", defaults.llm.request_timeout)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that parsing alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.child_budget_fraction) {
            return Err(ConfigError::InvalidValue(
                "RALPH_CHILD_BUDGET_FRACTION".to_string(),
                format!("{} is outside [0, 1]", self.child_budget_fraction),
            ));
        }
        if !(0.0..=1.0).contains(&self.fallback.confidence_threshold) {
            return Err(ConfigError::InvalidValue(
                "RALPH_CONFIDENCE_THRESHOLD".to_string(),
                format!("{} is outside [0, 1]", self.fallback.confidence_threshold),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RALPH_EVENT_CAPACITY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a config rooted at a workspace (useful for testing).
    pub fn new(workspace_path: PathBuf) -> Self {
        Self {
            workspace_path,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_root_budget(mut self, root_budget: u64) -> Self {
        self.root_budget = root_budget;
        self
    }

    pub fn with_child_budget_fraction(mut self, fraction: f64) -> Self {
        self.child_budget_fraction = fraction;
        self
    }

    pub fn with_spawn_wait(mut self, spawn_wait: Duration) -> Self {
        self.spawn_wait = spawn_wait;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    pub fn with_max_tool_retries(mut self, retries: u32) -> Self {
        self.max_tool_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.max_spawn_batch, 500);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.temperature, 0.0);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn test_out_of_range_fraction_is_rejected() {
        let config = Config::default().with_child_budget_fraction(1.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "RALPH_CHILD_BUDGET_FRACTION"
        ));
    }
}
