//! File operation tools: read and write files.
//!
//! `write_file` declares its target path as a resource key, so concurrent
//! writes to the same file from different nodes are applied one at a time.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, Tool};

fn path_arg(args: &Value) -> anyhow::Result<&str> {
    args["path"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))
}

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents with line numbers. Relative paths resolve from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = path_arg(&args)?;
        let resolved = resolve_path(path, working_dir);

        if !resolved.exists() {
            anyhow::bail!("File not found: {} (resolved to: {})", path, resolved.display());
        }

        let bytes = tokio::fs::read(&resolved).await?;
        let size = bytes.len();
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                return Ok(format!(
                    "Binary file detected: {} ({} bytes). Cannot display binary content.",
                    resolved.display(),
                    size
                ));
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = args["start_line"].as_u64().map(|n| n as usize);
        let end_line = args["end_line"].as_u64().map(|n| n as usize);

        let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
        let end = end_line.unwrap_or(total_lines).min(total_lines);
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if start_line.is_some() && start >= total_lines {
            return Ok(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total_lines,
                start + 1
            ));
        }

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();

        Ok(numbered.join("\n"))
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Relative paths resolve from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn resource_key(&self, args: &Value, working_dir: &Path) -> Option<String> {
        let path = args["path"].as_str()?;
        Some(format!("file:{}", resolve_path(path, working_dir).display()))
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = path_arg(&args)?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' argument"))?;

        let resolved = resolve_path(path, working_dir);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&resolved, content).await?;

        let written = tokio::fs::metadata(&resolved).await?.len();
        if written != content.len() as u64 {
            anyhow::bail!(
                "Write verification failed: expected {} bytes, got {}",
                content.len(),
                written
            );
        }

        Ok(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            resolved.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_with_line_range() {
        let dir = tempfile::tempdir().unwrap();
        WriteFile
            .execute(
                json!({"path": "notes/todo.md", "content": "one\ntwo\nthree\n"}),
                dir.path(),
            )
            .await
            .unwrap();

        let all = ReadFile
            .execute(json!({"path": "notes/todo.md"}), dir.path())
            .await
            .unwrap();
        assert_eq!(all, "   1| one\n   2| two\n   3| three");

        let middle = ReadFile
            .execute(
                json!({"path": "notes/todo.md", "start_line": 2, "end_line": 2}),
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(middle, "   2| two");
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFile
            .execute(json!({"path": "nope.txt"}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_write_resource_key_is_resolved_path() {
        let ws = Path::new("/work");
        let a = WriteFile.resource_key(&json!({"path": "out.md"}), ws);
        let b = WriteFile.resource_key(&json!({"path": "/work/out.md"}), ws);
        assert_eq!(a, b);
        assert!(ReadFile.resource_key(&json!({"path": "out.md"}), ws).is_none());
    }
}
