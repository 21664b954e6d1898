//! Shell command execution tool.
//!
//! Commands run in the workspace by default. The gateway owns the deadline;
//! the child process is killed when the tool future is dropped.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{resolve_path, Tool};

const MAX_OUTPUT_BYTES: usize = 10_000;

/// Replace binary garbage in command output while preserving text.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% control bytes is treated as binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Command prefixes that are refused outright.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("find / ", "Use a specific directory path"),
    ("grep -r /", "Use a specific directory path"),
    ("grep -R /", "Use a specific directory path"),
    ("ls -laR /", "Use a specific directory path instead of root"),
    ("du -a /", "Use a specific directory path instead of root"),
    ("rm -rf /", "This would destroy the entire system"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("mkfs", "Formatting filesystems is blocked"),
];

const WRAPPER_PREFIXES: &[&str] = &["sudo ", "time ", "nice ", "nohup "];

/// Validate a command against dangerous patterns.
fn validate_command(cmd: &str) -> Result<(), String> {
    let mut cmd = cmd.trim();
    while let Some(rest) = WRAPPER_PREFIXES
        .iter()
        .find_map(|prefix| cmd.strip_prefix(prefix))
    {
        cmd = rest.trim_start();
    }

    match DANGEROUS_PATTERNS
        .iter()
        .find(|(pattern, _)| cmd.starts_with(pattern) || cmd == pattern.trim_end())
    {
        Some((pattern, suggestion)) => Err(format!(
            "Blocked dangerous command pattern '{}'. {}",
            pattern.trim_end(),
            suggestion
        )),
        None => Ok(()),
    }
}

/// Run a shell command.
pub struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its output. Runs in the workspace by default."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional: working directory, relative to the workspace or absolute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?;

        if let Err(msg) = validate_command(command) {
            tracing::warn!(command, "Blocked dangerous command");
            anyhow::bail!("{}", msg);
        }

        let cwd = args["cwd"]
            .as_str()
            .map(|p| resolve_path(p, working_dir))
            .unwrap_or_else(|| working_dir.to_path_buf());

        tracing::info!(cwd = %cwd.display(), command, "Executing command");

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("/bin/sh", "-c")
        };

        let output = Command::new(shell)
            .arg(shell_arg)
            .arg(command)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute command: {}", e))?;

        let stdout = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::debug!(
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command completed"
        );

        let mut result = format!("Exit code: {}\n", exit_code);
        if !stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&stderr);
        }

        if result.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
            result.push_str("\n... [output truncated]");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_command_blocks_through_wrappers() {
        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("sudo nohup rm -rf /").is_err());
        assert!(validate_command("  dd if=/dev/zero of=x").is_err());
        assert!(validate_command("ls -la").is_ok());
        assert!(validate_command("find ./src -name '*.rs'").is_ok());
    }

    #[test]
    fn test_sanitize_output_flags_binary() {
        let binary = vec![0u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
        assert_eq!(sanitize_output(b"hi\tthere\n"), "hi\tthere\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = RunCommand
            .execute(json!({"command": "ls"}), dir.path())
            .await
            .unwrap();
        assert!(out.starts_with("Exit code: 0"));
        assert!(out.contains("marker.txt"));
    }
}
