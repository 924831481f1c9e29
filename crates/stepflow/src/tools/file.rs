// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! File tools.
//!
//! Read, write, replace and search operations over the host file system.
//! Blocking I/O is wrapped in `spawn_blocking`; all expected failures come
//! back as `"Error: ..."` text so the model can react.

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use std::fs;
use std::path::Path;
use tokio::task::spawn_blocking;

use crate::error::{Error, Result};
use crate::tools::{Tool, ToolInput, ToolResult};

fn missing(field: &str) -> Error {
    Error::tool_failure(format!("Missing {field} parameter"))
}

async fn run_blocking<T: Send + 'static>(
    job: impl FnOnce() -> T + Send + 'static,
) -> Result<T> {
    spawn_blocking(job)
        .await
        .map_err(|e| Error::tool_failure(format!("Task join failed: {e}")))
}

/// Read file content, optionally restricted to a line range.
#[derive(Debug, Clone, Default)]
pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read file content. Use for checking file contents, analyzing logs, or reading configuration files."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file": {"type": "string", "description": "Path of the file to read"},
                "start_line": {"type": "integer", "description": "(Optional) Starting line to read from, 0-based"},
                "end_line": {"type": "integer", "description": "(Optional) Ending line number (exclusive)"}
            },
            "required": ["file"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let file = input
            .str_field("file")
            .or_else(|| input.as_text())
            .ok_or_else(|| missing("file"))?;
        let start_line = input.u64_field("start_line").map(|n| n as usize);
        let end_line = input.u64_field("end_line").map(|n| n as usize);

        let text = run_blocking(move || match fs::read_to_string(&file) {
            Ok(content) => {
                if start_line.is_none() && end_line.is_none() {
                    content
                } else {
                    let lines: Vec<&str> = content.lines().collect();
                    let start = start_line.unwrap_or(0).min(lines.len());
                    let end = end_line.unwrap_or(lines.len()).min(lines.len());
                    lines[start..end.max(start)].join("\n")
                }
            }
            Err(e) => format!("Error reading file: {e}"),
        })
        .await?;
        Ok(ToolResult::text(text))
    }
}

/// MIME type by file extension, defaulting to JPEG like the wire format
/// expects for unknown raster types.
fn image_content_type(path: &str) -> &'static str {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/jpeg",
    }
}

/// Read an image file as inline base64 data.
#[derive(Debug, Clone, Default)]
pub struct FileReadImageTool;

#[async_trait]
impl Tool for FileReadImageTool {
    fn name(&self) -> &str {
        "file_read_image"
    }

    fn description(&self) -> &str {
        "Read an image file and return it as base64-encoded inline data. Use for viewing images, diagrams, or visual content."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file": {"type": "string", "description": "Path of the image file to read"}
            },
            "required": ["file"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let file = input
            .str_field("file")
            .or_else(|| input.as_text())
            .ok_or_else(|| missing("file"))?;
        let content_type = image_content_type(&file);

        let bytes = run_blocking(move || fs::read(&file)).await?;
        match bytes {
            Ok(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok(
                    ToolResult::text(format!("Read image ({} bytes)", bytes.len()))
                        .with_image(content_type, encoded),
                )
            }
            Err(e) => Ok(ToolResult::text(format!("Error reading image file: {e}"))),
        }
    }
}

/// Overwrite or append content to a file.
#[derive(Debug, Clone, Default)]
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Overwrite or append content to a file. Use for creating new files, appending content, or modifying existing files."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file": {"type": "string", "description": "Path of the file to write to"},
                "content": {"type": "string", "description": "Text content to write"},
                "append": {"type": "boolean", "description": "(Optional) Whether to use append mode"},
                "leading_newline": {"type": "boolean", "description": "(Optional) Whether to add a leading newline"},
                "trailing_newline": {"type": "boolean", "description": "(Optional) Whether to add a trailing newline"}
            },
            "required": ["file", "content"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let file = input.str_field("file").ok_or_else(|| missing("file"))?;
        let content = input
            .str_field("content")
            .ok_or_else(|| missing("content"))?;
        let append = input.bool_field("append").unwrap_or(false);
        let leading_newline = input.bool_field("leading_newline").unwrap_or(false);
        let trailing_newline = input.bool_field("trailing_newline").unwrap_or(true);

        let text = run_blocking(move || {
            let mut payload = content;
            if leading_newline {
                payload.insert(0, '\n');
            }
            if trailing_newline && !payload.ends_with('\n') {
                payload.push('\n');
            }

            if let Some(parent) = Path::new(&file).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        return format!("Error writing file: {e}");
                    }
                }
            }

            let result = if append {
                use std::io::Write;
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file)
                    .and_then(|mut f| f.write_all(payload.as_bytes()))
            } else {
                fs::write(&file, payload)
            };
            match result {
                Ok(()) => format!("File written successfully: {file}"),
                Err(e) => format!("Error writing file: {e}"),
            }
        })
        .await?;
        Ok(ToolResult::text(text))
    }
}

/// Replace occurrences of a string in a file.
#[derive(Debug, Clone, Default)]
pub struct FileStrReplaceTool;

#[async_trait]
impl Tool for FileStrReplaceTool {
    fn name(&self) -> &str {
        "file_str_replace"
    }

    fn description(&self) -> &str {
        "Replace a specified string in a file. Use for updating specific content in files or fixing errors in code."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file": {"type": "string", "description": "Path of the file to perform replacement on"},
                "old_str": {"type": "string", "description": "Original string to be replaced"},
                "new_str": {"type": "string", "description": "New string to replace with"}
            },
            "required": ["file", "old_str", "new_str"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let file = input.str_field("file").ok_or_else(|| missing("file"))?;
        let old_str = input
            .str_field("old_str")
            .ok_or_else(|| missing("old_str"))?;
        let new_str = input
            .str_field("new_str")
            .ok_or_else(|| missing("new_str"))?;

        let text = run_blocking(move || match fs::read_to_string(&file) {
            Ok(content) => {
                let count = content.matches(&old_str).count();
                if count == 0 {
                    format!("No replacements made. String not found in {file}")
                } else {
                    let updated = content.replace(&old_str, &new_str);
                    match fs::write(&file, updated) {
                        Ok(()) => format!("Replaced {count} occurrence(s) in {file}"),
                        Err(e) => format!("Error replacing text in file: {e}"),
                    }
                }
            }
            Err(e) => format!("Error replacing text in file: {e}"),
        })
        .await?;
        Ok(ToolResult::text(text))
    }
}

/// Search file content with a regular expression.
#[derive(Debug, Clone, Default)]
pub struct FileFindInContentTool;

#[async_trait]
impl Tool for FileFindInContentTool {
    fn name(&self) -> &str {
        "file_find_in_content"
    }

    fn description(&self) -> &str {
        "Search for matching text within file content. Use for finding specific content or patterns in files."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file": {"type": "string", "description": "Path of the file to search within"},
                "regex": {"type": "string", "description": "Regular expression pattern to match"}
            },
            "required": ["file", "regex"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let file = input.str_field("file").ok_or_else(|| missing("file"))?;
        let pattern = input.str_field("regex").ok_or_else(|| missing("regex"))?;

        let text = run_blocking(move || {
            let regex = match regex::Regex::new(&pattern) {
                Ok(r) => r,
                Err(e) => return format!("Error: invalid regex: {e}"),
            };
            let content = match fs::read_to_string(&file) {
                Ok(c) => c,
                Err(e) => return format!("Error searching in file: {e}"),
            };

            let matches: Vec<(usize, &str)> = content
                .lines()
                .enumerate()
                .filter(|(_, line)| regex.is_match(line))
                .map(|(n, line)| (n + 1, line))
                .collect();

            if matches.is_empty() {
                return format!("No matches found in {file}");
            }
            let mut out = format!("Found {} matching line(s) in {file}:\n", matches.len());
            for (line_number, line) in matches {
                let preview: String = line.chars().take(100).collect();
                let ellipsis = if line.chars().count() > 100 { "..." } else { "" };
                out.push_str(&format!("Line {line_number}: {preview}{ellipsis}\n"));
            }
            out
        })
        .await?;
        Ok(ToolResult::text(text))
    }
}

/// Simple glob matching: `*` matches any run, `?` matches one character.
fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    fn inner(pattern: &[char], name: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&pattern[1..], name)
                    || (!name.is_empty() && inner(pattern, &name[1..]))
            }
            (Some('?'), Some(_)) => inner(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => inner(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    inner(&pattern, &name)
}

/// Find files by glob pattern within a directory.
#[derive(Debug, Clone, Default)]
pub struct FileFindByNameTool;

#[async_trait]
impl Tool for FileFindByNameTool {
    fn name(&self) -> &str {
        "file_find_by_name"
    }

    fn description(&self) -> &str {
        "Find files by name pattern in a specified directory. Use for locating files with specific naming patterns."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path of the directory to search"},
                "glob": {"type": "string", "description": "Filename pattern using glob syntax wildcards"}
            },
            "required": ["path", "glob"]
        })
    }

    async fn call(&self, input: ToolInput) -> Result<ToolResult> {
        let path = input.str_field("path").ok_or_else(|| missing("path"))?;
        let pattern = input.str_field("glob").ok_or_else(|| missing("glob"))?;

        let text = run_blocking(move || {
            let entries = match fs::read_dir(&path) {
                Ok(entries) => entries,
                Err(e) => return format!("Error searching for files: {e}"),
            };
            let mut matching: Vec<String> = entries
                .filter_map(std::result::Result::ok)
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| glob_match(&pattern, name))
                })
                .map(|entry| entry.path().display().to_string())
                .collect();
            matching.sort();

            if matching.is_empty() {
                format!("No files matching '{pattern}' found in {path}")
            } else {
                let mut out = format!("Found {} matching file(s):\n", matching.len());
                for file in matching {
                    out.push_str(&file);
                    out.push('\n');
                }
                out
            }
        })
        .await?;
        Ok(ToolResult::text(text))
    }
}

/// The complete file toolkit.
#[must_use]
pub fn file_toolkit() -> Vec<std::sync::Arc<dyn Tool>> {
    vec![
        std::sync::Arc::new(FileReadTool),
        std::sync::Arc::new(FileReadImageTool),
        std::sync::Arc::new(FileWriteTool),
        std::sync::Arc::new(FileStrReplaceTool),
        std::sync::Arc::new(FileFindInContentTool),
        std::sync::Arc::new(FileFindByNameTool),
    ]
}
