//! Directory listing tool.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_path, Tool};

/// List files in a directory, optionally recursively.
///
/// Output is a JSON array of file paths (directories are not listed),
/// sorted by name so repeated calls are comparable.
pub struct ListFiles;

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a directory, optionally recursively"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory_path": {
                    "type": "string",
                    "description": "Directory to list. Use '.' for the workspace root."
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Whether to list files recursively (default: false)"
                }
            },
            "required": ["directory_path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = args["directory_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'directory_path' argument"))?;
        let recursive = args["recursive"].as_bool().unwrap_or(false);

        let full_path = resolve_path(path, working_dir);
        if !full_path.is_dir() {
            anyhow::bail!(
                "Directory not found: {} (resolved to: {})",
                path,
                full_path.display()
            );
        }

        let mut walker = WalkDir::new(&full_path).min_depth(1).sort_by_file_name();
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| anyhow::anyhow!("Error listing files: {}", e))?;
            if entry.file_type().is_file() {
                files.push(entry.path().display().to_string());
            }
        }

        Ok(serde_json::to_string(&files)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_flat_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();

        let flat: Vec<String> = serde_json::from_str(
            &ListFiles
                .execute(json!({"directory_path": "."}), dir.path())
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(flat.len(), 1);
        assert!(flat[0].ends_with("a.txt"));

        let deep: Vec<String> = serde_json::from_str(
            &ListFiles
                .execute(json!({"directory_path": ".", "recursive": true}), dir.path())
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(deep.len(), 2);
        assert!(deep.iter().any(|p| p.ends_with("b.txt")));
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ListFiles
            .execute(json!({"directory_path": "absent"}), dir.path())
            .await;
        assert!(result.is_err());
    }
}
