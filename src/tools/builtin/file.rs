//! File tools: `read_file`, `write_file`, `edit_file`.
//!
//! Every path is resolved against the session's working-directory root and
//! rejected if it would land outside it.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum content size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the longest existing ancestor and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            return tail
                .into_iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                ancestor = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve `path_str` inside `root`, rejecting anything that escapes it.
pub(crate) fn validate_path(path_str: &str, root: &Path) -> Result<PathBuf, ToolError> {
    if path_str.trim().is_empty() {
        return Err(ToolError::InvalidParameters("path is empty".to_string()));
    }

    let raw = PathBuf::from(path_str);
    let joined = if raw.is_absolute() {
        raw
    } else {
        root.join(raw)
    };
    let resolved = canonicalize_existing_prefix(&normalize_lexical(&joined));
    let root_canonical = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(root));

    if !resolved.starts_with(&root_canonical) {
        return Err(ToolError::NotAuthorized(format!(
            "Path escapes working directory: {path_str}"
        )));
    }
    Ok(resolved)
}

fn relative_display(path: &Path, root: &Path) -> String {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    path.strip_prefix(&root)
        .unwrap_or(path)
        .display()
        .to_string()
}

// ── ReadFileTool ────────────────────────────────────────────────────

/// Read file contents, line-numbered, with optional offset/limit.
#[derive(Debug)]
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the working directory. Returns line-numbered content. \
         For large files, use offset and limit to read a portion."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = require_str(&params, "path")?;
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64()).map(|l| l as usize);

        let start = std::time::Instant::now();
        let path = validate_path(path_str, &self.root)?;

        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound(format!("file {path_str}"))
            } else {
                ToolError::ExecutionFailed(format!("Cannot access file: {e}"))
            }
        })?;

        if metadata.len() > MAX_READ_SIZE && limit.is_none() {
            return Err(ToolError::ExecutionFailed(format!(
                "File too large ({} bytes). Maximum is {MAX_READ_SIZE} bytes. Use offset/limit.",
                metadata.len()
            )));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read file: {e}")))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = offset.saturating_sub(1).min(total_lines);
        let end_line = limit
            .map(|l| start_line.saturating_add(l).min(total_lines))
            .unwrap_or(total_lines);

        let numbered: Vec<String> = lines[start_line..end_line]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}│ {}", start_line + i + 1, line))
            .collect();

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": relative_display(&path, &self.root),
                "content": numbered.join("\n"),
                "total_lines": total_lines,
                "lines_shown": end_line - start_line,
            }),
            start.elapsed(),
        ))
    }
}

// ── WriteFileTool ───────────────────────────────────────────────────

/// Create or overwrite a file, creating parent directories.
#[derive(Debug)]
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does. \
         Parent directories are created automatically. Use edit_file for targeted edits."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;
        let start = std::time::Instant::now();

        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "Content too large ({} bytes). Maximum is {MAX_WRITE_SIZE} bytes.",
                content.len()
            )));
        }

        let path = validate_path(path_str, &self.root)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("Failed to create directories: {e}"))
            })?;
        }

        fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write file: {e}")))?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": relative_display(&path, &self.root),
                "bytes_written": content.len(),
                "success": true,
            }),
            start.elapsed(),
        ))
    }
}

// ── EditFileTool ────────────────────────────────────────────────────

/// Replace the first exact occurrence of `old_text` with `new_text`.
#[derive(Debug)]
pub struct EditFileTool {
    root: PathBuf,
}

impl EditFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing the first exact occurrence of old_text with new_text. \
         old_text must match verbatim, including whitespace and indentation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = require_str(&params, "path")?;
        let old_text = require_str(&params, "old_text")?;
        let new_text = require_str(&params, "new_text")?;
        let start = std::time::Instant::now();

        if old_text.is_empty() {
            return Err(ToolError::InvalidParameters(
                "old_text must not be empty".to_string(),
            ));
        }

        let path = validate_path(path_str, &self.root)?;
        let content = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound(format!("file {path_str}"))
            } else {
                ToolError::ExecutionFailed(format!("Failed to read file: {e}"))
            }
        })?;

        if !content.contains(old_text) {
            return Err(ToolError::NotFound(format!(
                "old_text not present verbatim in {path_str}"
            )));
        }

        let updated = content.replacen(old_text, new_text, 1);
        fs::write(&path, &updated)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write file: {e}")))?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": relative_display(&path, &self.root),
                "replacements": 1,
                "success": true,
            }),
            start.elapsed(),
        ))
    }
}
