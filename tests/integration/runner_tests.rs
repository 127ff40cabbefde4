use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use agent_bridge::runner::{OutputItem, PermissionMode, Runner, TaskStats};
use agent_bridge::AppError;

const WAIT: Duration = Duration::from_secs(10);

/// Create a task directory whose run script is the given shell body.
fn task_dir_with_script(dir: &Path, body: &str) -> PathBuf {
    let task_path = dir.join("demo");
    let system = task_path.join(".clod").join("system");
    fs::create_dir_all(&system).expect("create system dir");

    let run = system.join("run");
    fs::write(&run, format!("#!/bin/sh\n{body}")).expect("write run script");
    fs::set_permissions(&run, fs::Permissions::from_mode(0o755)).expect("chmod run script");
    task_path
}

fn runner(timeout: Duration) -> Runner {
    Runner::new(timeout, PermissionMode::Default, None)
}

#[tokio::test(flavor = "multi_thread")]
async fn parses_stream_json_and_captures_session_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"s1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello world"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,"num_turns":1,"total_cost_usd":0.01}'
"#,
    );

    let (task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "say hello", None)
        .expect("start");

    let mut text = String::new();
    let mut stats: Option<TaskStats> = None;
    while let Some(item) = tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
    {
        match item {
            OutputItem::TextChunk(chunk) => text.push_str(&chunk),
            OutputItem::Stats(s) => stats = Some(s),
            OutputItem::ToolResult { .. } => {}
        }
    }

    assert!(text.contains("hello world"), "text was: {text:?}");
    let stats = stats.expect("stats item");
    assert_eq!(stats.duration_ms, 1200);
    assert_eq!(stats.num_turns, 1);
    assert!(!stats.is_error);

    let result = tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");
    assert_eq!(result.session_id.as_deref(), Some("s1"));
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(task.session_id().as_deref(), Some("s1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn tool_results_pair_with_recorded_tool_uses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(
        dir.path(),
        r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":"total 0"}]}}'
echo '{"type":"result","subtype":"success","duration_ms":10,"num_turns":1,"total_cost_usd":0}'
"#,
    );

    let (_task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "list", None)
        .expect("start");

    let mut tool_results = Vec::new();
    while let Some(item) = tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
    {
        if let OutputItem::ToolResult {
            tool_name,
            tool_input,
            body,
            is_error,
        } = item
        {
            tool_results.push((tool_name, tool_input, body, is_error));
        }
    }

    assert_eq!(tool_results.len(), 1);
    let (tool_name, tool_input, body, is_error) = &tool_results[0];
    assert_eq!(tool_name, "Bash");
    assert_eq!(
        tool_input.get("command").and_then(serde_json::Value::as_str),
        Some("ls")
    );
    assert_eq!(body, "total 0");
    assert!(!is_error);
}

#[tokio::test(flavor = "multi_thread")]
async fn unparseable_lines_do_not_terminate_the_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(
        dir.path(),
        r#"echo 'garbage that is not json'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"survived"}]}}'
"#,
    );

    let (_task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "go", None)
        .expect("start");

    let mut text = String::new();
    while let Some(item) = tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
    {
        if let OutputItem::TextChunk(chunk) = item {
            text.push_str(&chunk);
        }
    }
    assert!(text.contains("survived"));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_script_receives_the_documented_argument_vector() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(
        dir.path(),
        r#"printf '%s\n' "$@" > args.txt
echo '{"type":"result","subtype":"success","duration_ms":1,"num_turns":1,"total_cost_usd":0}'
"#,
    );
    agent_bridge::permission::rules::save_rule(&task_path, "WebSearch").expect("save rule");

    let (_task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "add tests", Some("s1"))
        .expect("start");
    while tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
        .is_some()
    {}
    tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");

    let raw = fs::read_to_string(task_path.join("args.txt")).expect("read args");
    let args: Vec<&str> = raw.lines().collect();

    assert_eq!(args.first().copied(), Some("-p"));
    assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
    assert!(args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
    assert!(args.contains(&"--include-partial-messages"));
    assert!(args
        .windows(2)
        .any(|w| w[0] == "--permission-prompt-tool"
            && w[1] == "mcp__permission__request_permission"));
    assert!(args.windows(2).any(|w| w == ["--allowedTools", "WebSearch"]));
    assert!(args.windows(2).any(|w| w == ["--resume", "s1"]));
    assert!(args
        .windows(2)
        .any(|w| w[0] == "--mcp-config" && w[1].ends_with("mcp_config.json")));
    assert_eq!(args.last().copied(), Some("add tests"));
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_kills_the_task_and_reports_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(dir.path(), "sleep 10\n");

    let started = Instant::now();
    let (_task, mut streams) = runner(Duration::from_secs(1))
        .start(&task_path, "sleep", None)
        .expect("start");

    while tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
        .is_some()
    {}
    let result = tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");

    assert!(started.elapsed() < Duration::from_secs(8), "killed early");
    match result.error {
        Some(AppError::Timeout(limit)) => assert_eq!(limit, Duration::from_secs(1)),
        other => panic!("expected timeout error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_reports_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(dir.path(), "sleep 10\n");

    let (task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "sleep", None)
        .expect("start");

    tokio::time::sleep(Duration::from_millis(300)).await;
    task.cancel();

    while tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
        .is_some()
    {}
    let result = tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");

    assert!(matches!(result.error, Some(AppError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread")]
async fn nonzero_exit_surfaces_as_subprocess_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(dir.path(), "exit 3\n");

    let (_task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "fail", None)
        .expect("start");

    while tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
        .is_some()
    {}
    let result = tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");

    assert!(matches!(result.error, Some(AppError::Subprocess(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_result_without_session_id_reports_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task_path = task_dir_with_script(dir.path(), "echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":1,\"num_turns\":1,\"total_cost_usd\":0}'\n");

    let (_task, mut streams) = runner(Duration::from_secs(30))
        .start(&task_path, "quiet", None)
        .expect("start");

    while tokio::time::timeout(WAIT, streams.output.recv())
        .await
        .expect("output within timeout")
        .is_some()
    {}
    let result = tokio::time::timeout(WAIT, streams.done)
        .await
        .expect("result within timeout")
        .expect("result delivered");

    assert_eq!(result.session_id, None);
    assert!(result.error.is_none());
}
