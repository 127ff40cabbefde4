use serde_json::{Map, Value};

use agent_bridge::slack::handlers::run::{format_bytes, summarize_tool_result};

fn input(entries: &[(&str, &str)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_owned(), Value::String((*value).to_owned())))
        .collect()
}

#[test]
fn read_summary_shows_basename_as_title() {
    let (comment, title) =
        summarize_tool_result("Read", &input(&[("file_path", "/repo/src/main.rs")]), "fn main");
    assert!(comment.contains("`Read`"));
    assert!(comment.contains("main.rs"));
    assert!(comment.contains("1 lines"));
    assert_eq!(title, "main.rs");
}

#[test]
fn read_summary_shortens_long_paths_from_the_front() {
    let long_path = format!("/very/long/{}/file.rs", "x".repeat(80));
    let (comment, _) = summarize_tool_result("Read", &input(&[("file_path", &long_path)]), "data");
    assert!(comment.contains("..."));
    assert!(comment.contains("file.rs"));
}

#[test]
fn grep_summary_shows_pattern() {
    let (comment, title) =
        summarize_tool_result("Grep", &input(&[("pattern", "fn main")]), "a\nb\nc");
    assert!(comment.contains("`fn main`"));
    assert!(comment.contains("3 lines"));
    assert_eq!(title, "grep fn main");
}

#[test]
fn bash_summary_truncates_the_command() {
    let long_cmd = "cargo test --workspace --all-features -- --nocapture --test-threads=1 extra";
    let (comment, title) = summarize_tool_result("Bash", &input(&[("command", long_cmd)]), "ok");
    assert!(comment.contains("`Bash`"));
    assert!(comment.contains("..."));
    assert_eq!(title, "bash output");
}

#[test]
fn websearch_summary_shows_query() {
    let (comment, title) =
        summarize_tool_result("WebSearch", &input(&[("query", "rust pty")]), "results");
    assert!(comment.contains("`rust pty`"));
    assert_eq!(title, "search rust pty");
}

#[test]
fn unknown_tool_gets_generic_summary() {
    let (comment, title) = summarize_tool_result("NotebookEdit", &input(&[]), "body");
    assert!(comment.contains("`NotebookEdit`"));
    assert_eq!(title, "NotebookEdit output");
}

#[test]
fn missing_input_falls_back_to_tool_name() {
    let (comment, title) = summarize_tool_result("Read", &input(&[]), "data");
    assert!(comment.contains("`Read`"));
    assert_eq!(title, "Read output");
}

#[test]
fn byte_counts_humanize() {
    assert_eq!(format_bytes(17), "17 bytes");
    assert_eq!(format_bytes(2048), "2.0KB");
    assert_eq!(format_bytes(3 * 1024 * 1024), "3.0MB");
}
