//! Saved permission rules: matching, persistence, and pattern generation.
//!
//! Rules are flat strings living in the task's claude config document under
//! `projects[<taskDir>].allowedTools`, so other tools can edit the same
//! list. Matching is a small interpreter keyed on rule shape:
//!
//! - `ToolName` matches every use of that tool.
//! - `ToolName(prefix:*)` matches Bash commands whose first token is
//!   `prefix`, or file operations whose path sits under a `prefix/`
//!   directory.
//! - `ToolName(dir/**)` matches file operations under `dir`.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::tasks::MARKER_DIR;
use crate::{AppError, Result};

/// Path of the claude config document for a task directory.
#[must_use]
pub fn claude_config_path(task_path: &Path) -> PathBuf {
    task_path.join(MARKER_DIR).join("claude").join("claude.json")
}

/// Read the saved rule list for a task directory.
///
/// The document is read fresh on every call so out-of-band edits take
/// effect immediately; any read or shape failure yields an empty list.
#[must_use]
pub fn read_allowed_tools(task_path: &Path) -> Vec<String> {
    let Ok(data) = fs::read(claude_config_path(task_path)) else {
        return Vec::new();
    };
    let Ok(config) = serde_json::from_slice::<Value>(&data) else {
        return Vec::new();
    };

    let key = task_path.to_string_lossy();
    config
        .get("projects")
        .and_then(|projects| projects.get(key.as_ref()))
        .and_then(|project| project.get("allowedTools"))
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether any saved rule matches a live tool request.
#[must_use]
pub fn is_allowed(task_path: &Path, tool_name: &str, tool_input: &Map<String, Value>) -> bool {
    read_allowed_tools(task_path)
        .iter()
        .any(|rule| matches_rule(rule, tool_name, tool_input))
}

/// Whether a single rule matches a tool request.
#[must_use]
pub fn matches_rule(rule: &str, tool_name: &str, tool_input: &Map<String, Value>) -> bool {
    if rule == tool_name {
        return true;
    }

    let Some(pattern) = rule
        .strip_prefix(tool_name)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return false;
    };

    if let Some(prefix) = pattern.strip_suffix(":*") {
        if tool_name == "Bash" {
            if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
                if command.split_whitespace().next() == Some(prefix) {
                    return true;
                }
            }
        }
        if matches!(tool_name, "Write" | "Edit" | "Read") {
            if let Some(path) = tool_input.get("file_path").and_then(Value::as_str) {
                if path.contains(&format!("/{prefix}/")) || path.starts_with(&format!("{prefix}/"))
                {
                    return true;
                }
            }
        }
    }

    if let Some(dir_prefix) = pattern.strip_suffix("**") {
        if matches!(tool_name, "Write" | "Edit" | "Read") {
            if let Some(path) = tool_input.get("file_path").and_then(Value::as_str) {
                if path.contains(&format!("/{dir_prefix}")) || path.starts_with(dir_prefix) {
                    return true;
                }
            }
        }
    }

    false
}

/// Generate the "Allow Similar" pattern for a tool request.
///
/// Returns `None` when no useful generalization exists (e.g. search
/// queries), in which case the Similar button is not offered.
#[must_use]
pub fn similar_pattern(tool_name: &str, tool_input: &Map<String, Value>) -> Option<String> {
    match tool_name {
        "Bash" => {
            let command = tool_input.get("command").and_then(Value::as_str)?;
            let first = command.split_whitespace().next()?;
            Some(format!("Bash({first}:*)"))
        }
        "Write" | "Edit" | "Read" => {
            let path = tool_input.get("file_path").and_then(Value::as_str)?;
            let base = Path::new(path).parent()?.file_name()?.to_str()?;
            if base.is_empty() || base == "." || base == "/" {
                return None;
            }
            Some(format!("{tool_name}({base}/**)"))
        }
        "WebFetch" => {
            let url = tool_input.get("url").and_then(Value::as_str)?;
            let scheme_end = url.find("://")?;
            let rest = &url[scheme_end + 3..];
            let slash = rest.find('/')?;
            Some(format!("WebFetch({}:*)", &url[..scheme_end + 3 + slash]))
        }
        _ => None,
    }
}

/// Append a rule to the task's saved set.
///
/// The whole document is read, the `projects[<taskDir>].allowedTools`
/// subtree is ensured, duplicates are skipped, and the document is
/// rewritten pretty-printed. Everything else in the document is preserved.
///
/// # Errors
///
/// Returns `AppError::Persistence` on read, parse, or write failure.
pub fn save_rule(task_path: &Path, rule: &str) -> Result<()> {
    let config_path = claude_config_path(task_path);

    let mut config: Value = match fs::read(&config_path) {
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|err| AppError::Persistence(format!("invalid claude config: {err}")))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(err) => {
            return Err(AppError::Persistence(format!(
                "cannot read claude config: {err}"
            )))
        }
    };

    let key = task_path.to_string_lossy().into_owned();
    let root = config
        .as_object_mut()
        .ok_or_else(|| AppError::Persistence("claude config is not an object".into()))?;
    let projects = root
        .entry("projects")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AppError::Persistence("projects is not an object".into()))?;
    let project = projects
        .entry(key)
        .or_insert_with(|| json!({ "allowedTools": [] }))
        .as_object_mut()
        .ok_or_else(|| AppError::Persistence("project entry is not an object".into()))?;
    let allowed = project
        .entry("allowedTools")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| AppError::Persistence("allowedTools is not an array".into()))?;

    if allowed.iter().any(|entry| entry.as_str() == Some(rule)) {
        debug!(rule, "permission rule already exists, skipping");
        return Ok(());
    }
    allowed.push(Value::String(rule.to_owned()));

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Persistence(format!("create claude config dir: {err}")))?;
    }
    let data = serde_json::to_vec_pretty(&config)
        .map_err(|err| AppError::Persistence(format!("serialize claude config: {err}")))?;
    fs::write(&config_path, data)
        .map_err(|err| AppError::Persistence(format!("write claude config: {err}")))?;

    info!(rule, config_path = %config_path.display(), "saved permission rule");
    Ok(())
}
