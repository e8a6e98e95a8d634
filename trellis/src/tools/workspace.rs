//! Workspace tools: file access and command execution under the run's
//! working folder.
//!
//! Paths are resolved under the working folder and may not escape it.
//! PLANNING mode keeps the workspace read-only apart from docs writes;
//! `command` is only available in IMPLEMENTATION mode.

use std::path::{Component, Path, PathBuf};

use run_event::GlobalMode;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{ToolEnv, ToolResult};

const MAX_LIST_ENTRIES: usize = 500;
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Resolves `path` under `cwd`, rejecting absolute paths and any traversal
/// that would escape the working folder.
pub(crate) fn resolve_path_under(cwd: &Path, path: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(format!("path must be relative to the working folder: {}", path));
    }
    let mut resolved = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(format!("path escapes the working folder: {}", path));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path must be relative to the working folder: {}", path));
            }
        }
    }
    Ok(cwd.join(resolved))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing argument: {}", key))
}

/// True when PLANNING mode still allows writing this path (docs only).
fn is_docs_path(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.ends_with(".md") || lowered.starts_with("docs/") || lowered.contains("/docs/")
}

pub(crate) async fn read_file(env: &ToolEnv, args: &Value) -> ToolResult {
    let path = match str_arg(args, "path").and_then(|p| resolve_path_under(&env.cwd, p)) {
        Ok(p) => p,
        Err(e) => return ToolResult::failure(e),
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => ToolResult::success(json!(content)),
        Err(e) => ToolResult::failure(format!("read {}: {}", path.display(), e)),
    }
}

pub(crate) async fn write_file(env: &ToolEnv, args: &Value) -> ToolResult {
    let rel = match str_arg(args, "path") {
        Ok(p) => p,
        Err(e) => return ToolResult::failure(e),
    };
    let content = match str_arg(args, "content") {
        Ok(c) => c,
        Err(e) => return ToolResult::failure(e),
    };
    if !env.capabilities.write_code && !env.capabilities.write_docs {
        return ToolResult::failure("write_file requires the write-code or write-docs capability");
    }
    if env.global_mode == GlobalMode::Planning && !is_docs_path(rel) {
        return ToolResult::failure("planning mode allows docs writes only");
    }
    if !env.capabilities.write_code && !is_docs_path(rel) {
        return ToolResult::failure("write-docs capability covers docs paths only");
    }
    let path = match resolve_path_under(&env.cwd, rel) {
        Ok(p) => p,
        Err(e) => return ToolResult::failure(e),
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ToolResult::failure(format!("create parent dir: {}", e));
        }
    }
    match tokio::fs::write(&path, content).await {
        Ok(()) => ToolResult::success(json!({ "path": rel, "bytes": content.len() })),
        Err(e) => ToolResult::failure(format!("write {}: {}", path.display(), e)),
    }
}

pub(crate) async fn list_files(env: &ToolEnv, args: &Value) -> ToolResult {
    let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let root = match resolve_path_under(&env.cwd, rel) {
        Ok(p) => p,
        Err(e) => return ToolResult::failure(e),
    };
    let mut entries = Vec::new();
    let mut truncated = false;
    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => return ToolResult::failure(format!("list {}: {}", root.display(), e)),
        };
        if entries.len() >= MAX_LIST_ENTRIES {
            truncated = true;
            break;
        }
        let rel_path = entry
            .path()
            .strip_prefix(&env.cwd)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            entries.push(format!("{}/", rel_path));
        } else {
            entries.push(rel_path);
        }
    }
    ToolResult::success(json!({ "entries": entries, "truncated": truncated }))
}

pub(crate) async fn delete_file(env: &ToolEnv, args: &Value) -> ToolResult {
    if !env.capabilities.write_code && !env.capabilities.write_docs {
        return ToolResult::failure("delete_file requires the write-code or write-docs capability");
    }
    if env.global_mode == GlobalMode::Planning {
        return ToolResult::failure("planning mode keeps the workspace read-only");
    }
    let path = match str_arg(args, "path").and_then(|p| resolve_path_under(&env.cwd, p)) {
        Ok(p) => p,
        Err(e) => return ToolResult::failure(e),
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => ToolResult::success(json!("deleted")),
        Err(e) => ToolResult::failure(format!("delete {}: {}", path.display(), e)),
    }
}

pub(crate) async fn command(env: &ToolEnv, args: &Value) -> ToolResult {
    let command = match str_arg(args, "command") {
        Ok(c) => c,
        Err(e) => return ToolResult::failure(e),
    };
    if !env.capabilities.run_commands {
        return ToolResult::failure("command requires the run-commands capability");
    }
    if env.global_mode == GlobalMode::Planning {
        return ToolResult::failure("planning mode does not run commands");
    }
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&env.cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return ToolResult::failure(format!("spawn command: {}", e)),
    };

    let output = match tokio::time::timeout(env.command_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ToolResult::failure(format!("run command: {}", e)),
        Err(_) => {
            return ToolResult::failure(format!(
                "command timed out after {}s",
                env.command_timeout.as_secs()
            ))
        }
    };

    let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
    let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
    let exit_code = output.status.code().unwrap_or(-1);
    let result = json!({
        "exitCode": exit_code,
        "stdout": stdout,
        "stderr": stderr,
    });
    if output.status.success() {
        ToolResult::success(result)
    } else {
        ToolResult {
            ok: false,
            output: Some(result),
            error: Some(format!("command exited with code {}", exit_code)),
        }
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_CHARS {
        let mut cut = MAX_OUTPUT_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n… (truncated)");
    }
    text
}
