use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::time::Duration;

use serde_json::Value;

use agent_bridge::permission::{PermissionChannel, PermissionResponse};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn create_materializes_the_runtime_workspace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel = PermissionChannel::create(dir.path(), None).expect("create");

    let runtime_dir = channel.runtime_dir();
    assert!(runtime_dir.starts_with(dir.path().join(".clod")));
    assert_eq!(channel.runtime_suffix().len(), 6);
    assert_eq!(
        channel.runtime_dir_name(),
        format!(".clod/runtime-{}", channel.runtime_suffix())
    );

    // FIFOs exist with mode 0600.
    for name in ["permission_request.fifo", "permission_response.fifo"] {
        let metadata = fs::metadata(runtime_dir.join(name)).expect("fifo metadata");
        assert!(metadata.file_type().is_fifo(), "{name} is a fifo");
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600, "{name} mode");
    }

    // The MCP server script is executable.
    let script = fs::metadata(runtime_dir.join("permission_mcp.py")).expect("script metadata");
    assert_ne!(script.permissions().mode() & 0o111, 0, "script is executable");

    // The config document points the permission server at the script.
    let raw = fs::read(channel.mcp_config_path()).expect("read config");
    let config: Value = serde_json::from_slice(&raw).expect("parse config");
    assert_eq!(config["mcpServers"]["permission"]["command"], "python3");
    let arg = config["mcpServers"]["permission"]["args"][0]
        .as_str()
        .expect("script arg");
    assert!(arg.ends_with("permission_mcp.py"));

    channel.close();
}

#[test]
fn concurrent_channels_get_distinct_workspaces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = PermissionChannel::create(dir.path(), None).expect("first");
    let second = PermissionChannel::create(dir.path(), None).expect("second");

    assert_ne!(first.runtime_dir(), second.runtime_dir());

    first.close();
    second.close();
}

#[test]
fn agent_prompt_is_copied_into_the_workspace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prompt_path = dir.path().join("prompt.md");
    fs::write(&prompt_path, "# Operate carefully\n").expect("write prompt");

    let channel = PermissionChannel::create(dir.path(), Some(&prompt_path)).expect("create");
    let copied = channel.agent_prompt_path().expect("prompt copied");
    assert_eq!(
        fs::read_to_string(copied).expect("read copy"),
        "# Operate carefully\n"
    );

    channel.close();
}

#[test]
fn missing_agent_prompt_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel =
        PermissionChannel::create(dir.path(), Some(std::path::Path::new("nope.md")))
            .expect("create");
    assert!(channel.agent_prompt_path().is_none());
    channel.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_flow_in_and_responses_flow_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut channel = PermissionChannel::create(dir.path(), None).expect("create");
    let mut requests = channel.start();

    // The permission tool writes one request line on the request FIFO.
    let request_path = channel.runtime_dir().join("permission_request.fifo");
    let writer = tokio::task::spawn_blocking(move || {
        let mut fifo = fs::OpenOptions::new()
            .write(true)
            .open(request_path)
            .expect("open request fifo for write");
        writeln!(
            fifo,
            r#"{{"tool_name":"Bash","tool_input":{{"command":"ls"}},"tool_use_id":"tu_9"}}"#
        )
        .expect("write request");
    });

    let request = tokio::time::timeout(WAIT, requests.recv())
        .await
        .expect("request within timeout")
        .expect("request stream open");
    assert_eq!(request.tool_name, "Bash");
    assert_eq!(request.tool_use_id, "tu_9");
    assert_eq!(
        request.tool_input.get("command").and_then(Value::as_str),
        Some("ls")
    );
    writer.await.expect("writer task");

    // The bridge answers; the tool reads the decision from the response
    // FIFO.
    let response_path = channel.runtime_dir().join("permission_response.fifo");
    let reader = tokio::task::spawn_blocking(move || {
        let fifo = fs::OpenOptions::new()
            .read(true)
            .open(response_path)
            .expect("open response fifo for read");
        let mut line = String::new();
        BufReader::new(fifo).read_line(&mut line).expect("read response");
        line
    });

    channel.send_response(PermissionResponse::allow());

    let line = tokio::time::timeout(WAIT, reader)
        .await
        .expect("response within timeout")
        .expect("reader task");
    let decoded: Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(decoded["behavior"], "allow");
    assert_eq!(decoded.get("message"), None);

    channel.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn unparseable_request_lines_are_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut channel = PermissionChannel::create(dir.path(), None).expect("create");
    let mut requests = channel.start();

    let request_path = channel.runtime_dir().join("permission_request.fifo");
    tokio::task::spawn_blocking(move || {
        let mut fifo = fs::OpenOptions::new()
            .write(true)
            .open(request_path)
            .expect("open request fifo");
        writeln!(fifo, "this is not json").expect("write garbage");
        writeln!(fifo, r#"{{"tool_name":"WebSearch","tool_input":{{"query":"x"}}}}"#)
            .expect("write request");
    })
    .await
    .expect("writer task");

    let request = tokio::time::timeout(WAIT, requests.recv())
        .await
        .expect("request within timeout")
        .expect("request stream open");
    assert_eq!(request.tool_name, "WebSearch");

    channel.close();
}

#[test]
fn close_removes_the_fifos() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel = PermissionChannel::create(dir.path(), None).expect("create");
    let request_path = channel.runtime_dir().join("permission_request.fifo");
    let response_path = channel.runtime_dir().join("permission_response.fifo");

    channel.close();

    assert!(!request_path.exists());
    assert!(!response_path.exists());
}
