use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use agent_bridge::permission::rules;

fn input(entries: &[(&str, &str)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_owned(), Value::String((*value).to_owned())))
        .collect()
}

fn write_config(task_path: &Path, content: &Value) {
    let config_path = rules::claude_config_path(task_path);
    fs::create_dir_all(config_path.parent().unwrap()).expect("config dir");
    fs::write(&config_path, serde_json::to_vec_pretty(content).expect("json")).expect("write");
}

// ─── Rule matching ────────────────────────────────────────────────────

#[test]
fn bare_tool_name_matches_every_use() {
    assert!(rules::matches_rule("WebSearch", "WebSearch", &input(&[("query", "x")])));
    assert!(!rules::matches_rule("WebSearch", "WebFetch", &input(&[])));
}

#[test]
fn bash_prefix_matches_first_token_only() {
    let rule = "Bash(python:*)";
    assert!(rules::matches_rule(rule, "Bash", &input(&[("command", "python build.py")])));
    assert!(rules::matches_rule(rule, "Bash", &input(&[("command", "python test.py")])));
    assert!(!rules::matches_rule(rule, "Bash", &input(&[("command", "python3 build.py")])));
    assert!(!rules::matches_rule(rule, "Bash", &input(&[("command", "make python")])));
}

#[test]
fn file_prefix_matches_directory_component() {
    let rule = "Write(src:*)";
    assert!(rules::matches_rule(rule, "Write", &input(&[("file_path", "/repo/src/main.rs")])));
    assert!(rules::matches_rule(rule, "Write", &input(&[("file_path", "src/lib.rs")])));
    assert!(!rules::matches_rule(rule, "Write", &input(&[("file_path", "/repo/docs/a.md")])));
}

#[test]
fn glob_suffix_matches_directory_prefix() {
    let rule = "Read(src/**)";
    assert!(rules::matches_rule(rule, "Read", &input(&[("file_path", "/repo/src/deep/a.rs")])));
    assert!(rules::matches_rule(rule, "Read", &input(&[("file_path", "src/a.rs")])));
    assert!(!rules::matches_rule(rule, "Read", &input(&[("file_path", "/repo/tests/a.rs")])));
}

#[test]
fn pattern_rules_never_match_other_tools() {
    assert!(!rules::matches_rule("Bash(python:*)", "Write", &input(&[("file_path", "python/x")])));
    assert!(!rules::matches_rule("Write(src/**)", "Bash", &input(&[("command", "src/run")])));
}

#[test]
fn malformed_rules_do_not_match() {
    assert!(!rules::matches_rule("Bash(python:*", "Bash", &input(&[("command", "python x")])));
    assert!(!rules::matches_rule("", "Bash", &input(&[("command", "python x")])));
}

// ─── Similar-pattern generation ───────────────────────────────────────

#[test]
fn similar_pattern_for_bash_uses_first_token() {
    let pattern = rules::similar_pattern("Bash", &input(&[("command", "python script.py")]));
    assert_eq!(pattern.as_deref(), Some("Bash(python:*)"));
}

#[test]
fn similar_pattern_for_file_tools_uses_parent_directory() {
    let pattern =
        rules::similar_pattern("Write", &input(&[("file_path", "/home/user/project/src/file.go")]));
    assert_eq!(pattern.as_deref(), Some("Write(src/**)"));
}

#[test]
fn similar_pattern_for_webfetch_uses_origin() {
    let pattern =
        rules::similar_pattern("WebFetch", &input(&[("url", "https://example.com/api/v1")]));
    assert_eq!(pattern.as_deref(), Some("WebFetch(https://example.com:*)"));
}

#[test]
fn similar_pattern_for_websearch_is_absent() {
    assert_eq!(rules::similar_pattern("WebSearch", &input(&[("query", "rust pty")])), None);
}

#[test]
fn similar_pattern_without_usable_input_is_absent() {
    assert_eq!(rules::similar_pattern("Bash", &input(&[])), None);
    assert_eq!(rules::similar_pattern("WebFetch", &input(&[("url", "not-a-url")])), None);
}

// ─── Persistence ──────────────────────────────────────────────────────

#[test]
fn save_rule_creates_document_and_reads_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = dir.path();

    rules::save_rule(task_path, "Bash(python:*)").expect("save");
    assert_eq!(rules::read_allowed_tools(task_path), vec!["Bash(python:*)".to_owned()]);
}

#[test]
fn save_rule_skips_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = dir.path();

    rules::save_rule(task_path, "WebSearch").expect("save");
    rules::save_rule(task_path, "WebSearch").expect("save again");

    assert_eq!(rules::read_allowed_tools(task_path), vec!["WebSearch".to_owned()]);
}

#[test]
fn save_rule_preserves_unrelated_document_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = dir.path();
    let key = task_path.to_string_lossy().into_owned();

    let mut config = json!({
        "theme": "dark",
        "projects": {
            "/other/project": { "allowedTools": ["Bash"] },
        },
    });
    config["projects"][key.as_str()] = json!({ "allowedTools": ["WebSearch"], "model": "opus" });
    write_config(task_path, &config);

    rules::save_rule(task_path, "Read(src/**)").expect("save");

    let raw = fs::read(rules::claude_config_path(task_path)).expect("read config");
    let config: Value = serde_json::from_slice(&raw).expect("parse config");
    assert_eq!(config["theme"], "dark");
    assert_eq!(config["projects"][key.as_str()]["model"], "opus");
    assert_eq!(config["projects"]["/other/project"]["allowedTools"][0], "Bash");
    assert_eq!(
        rules::read_allowed_tools(task_path),
        vec!["WebSearch".to_owned(), "Read(src/**)".to_owned()]
    );
}

#[test]
fn read_allowed_tools_is_empty_without_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(rules::read_allowed_tools(dir.path()).is_empty());
}

// ─── End-to-end auto-allow check ──────────────────────────────────────

#[test]
fn is_allowed_matches_saved_rules_fresh_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = dir.path();

    assert!(!rules::is_allowed(task_path, "WebSearch", &input(&[("query", "x")])));

    rules::save_rule(task_path, "WebSearch").expect("save");
    assert!(rules::is_allowed(task_path, "WebSearch", &input(&[("query", "x")])));

    rules::save_rule(task_path, "Bash(python:*)").expect("save");
    assert!(rules::is_allowed(task_path, "Bash", &input(&[("command", "python test.py")])));
    assert!(!rules::is_allowed(task_path, "Bash", &input(&[("command", "cargo test")])));
}
