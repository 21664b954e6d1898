//! Tool system for agent nodes.
//!
//! Tools are external collaborators: the orchestration core only knows a
//! tool's name, its capability tag (the same name), and whether an
//! invocation succeeded, failed or timed out. Every call goes through the
//! [`ToolGateway`], which enforces capabilities, circuit breakers and
//! deadlines.
//!
//! ## Workspace-First Design
//!
//! Built-in tools resolve relative paths from the workspace directory:
//! - `output/report.md` → `{workspace}/output/report.md`
//! - `/etc/hosts` → absolute path (escape hatch)

mod breaker;
mod directory;
mod file_ops;
mod gateway;
mod terminal;
mod web;

pub use breaker::{Admission, BreakerBoard, BreakerPosition, BreakerSnapshot, CircuitBreakerState};
pub use directory::ListFiles;
pub use file_ops::{ReadFile, WriteFile};
pub use gateway::{GatewayError, ToolGateway, ToolResult};
pub use terminal::RunCommand;
pub use web::FetchUrl;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability tag that permits a node to spawn children.
pub const SPAWN_CHILD: &str = "spawn-child";

// ============================================================================
// Path Resolution Utilities
// ============================================================================

/// Resolve a path relative to the workspace.
///
/// - Relative paths are joined with `workspace`
/// - Absolute paths are used as-is (escape hatch)
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Set of tool-name tags a node may invoke.
///
/// Children always inherit-or-narrow their parent's set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn can_spawn(&self) -> bool {
        self.allows(SPAWN_CHILD)
    }

    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Tags in `self` that `parent` does not grant.
    pub fn escalations(&self, parent: &CapabilitySet) -> Vec<String> {
        self.0.difference(&parent.0).cloned().collect()
    }

    pub fn without(mut self, tag: &str) -> Self {
        self.0.remove(tag);
        self
    }

    pub fn with(mut self, tag: impl Into<String>) -> Self {
        self.0.insert(tag.into());
        self
    }

    /// Tool names, excluding non-tool tags such as `spawn-child`.
    pub fn tool_names(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|t| t.as_str() != SPAWN_CHILD)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// Information about a tool for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Trait for implementing tool collaborators.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (also its capability tag).
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// External resource this call touches, if calls on it must be serialized.
    fn resource_key(&self, _args: &Value, _working_dir: &Path) -> Option<String> {
        None
    }

    /// Execute the tool with the given arguments.
    ///
    /// The `working_dir` is the default directory for relative paths.
    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String>;
}

/// Registry of available tools.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new registry with all built-in tools.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ReadFile));
        registry.register(Arc::new(WriteFile));
        registry.register(Arc::new(ListFiles));
        registry.register(Arc::new(RunCommand));
        registry.register(Arc::new(FetchUrl));
        tracing::debug!("Tool registry created with {} built-in tools", registry.len());
        registry
    }

    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Capability set granting every registered tool.
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(self.tools.keys().cloned())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_subset_and_escalation() {
        let parent = CapabilitySet::new(["read_file", "write_file", SPAWN_CHILD]);
        let narrowed = CapabilitySet::new(["read_file"]);
        let escalated = CapabilitySet::new(["read_file", "run_command"]);

        assert!(narrowed.is_subset(&parent));
        assert!(!escalated.is_subset(&parent));
        assert_eq!(escalated.escalations(&parent), vec!["run_command".to_string()]);
        assert!(!parent.clone().without(SPAWN_CHILD).can_spawn());
        assert_eq!(parent.tool_names(), vec!["read_file", "write_file"]);
    }

    #[test]
    fn test_builtin_registry_lists_sorted_tools() {
        let registry = ToolRegistry::new();
        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["fetch_url", "list_files", "read_file", "run_command", "write_file"]
        );
        assert!(registry.capabilities().allows("write_file"));
    }

    #[test]
    fn test_resolve_path() {
        let ws = Path::new("/work");
        assert_eq!(resolve_path("a/b.txt", ws), PathBuf::from("/work/a/b.txt"));
        assert_eq!(resolve_path("/etc/hosts", ws), PathBuf::from("/etc/hosts"));
    }
}
