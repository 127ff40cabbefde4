//! The per-task pump: spawn the agent and serialize everything into chat.
//!
//! This loop is the only writer to Slack for a live task. It multiplexes
//! the runner's output stream, the permission request stream, a periodic
//! flush tick, and the terminal result, in observation order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::{SlackChannelId, SlackTs};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::mrkdwn::markdown_to_mrkdwn;
use crate::permission::{rules, PermissionRequest, PermissionResponse};
use crate::runner::{OutputItem, RunningTask, TaskResult, TaskStats};
use crate::session::{thread_key, SessionDescriptor};
use crate::slack::{blocks, BotState, PendingPermission};

const BATCH_INTERVAL: Duration = Duration::from_secs(2);
/// Flush threshold; leaves room for formatting under Slack's 4,000-char
/// message limit.
const MAX_BATCH_LEN: usize = 1500;
/// Bash output up to this size is posted inline instead of as a snippet.
const MAX_INLINE_LEN: usize = 500;

/// Start the agent for a thread and pump its output until completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_task(
    state: Arc<BotState>,
    channel_id: String,
    user_id: String,
    task_path: PathBuf,
    task_name: String,
    prompt: String,
    session_id: Option<String>,
    thread_ts: String,
) {
    let (task, mut streams) =
        match state.runner.start(&task_path, &prompt, session_id.as_deref()) {
            Ok(started) => started,
            Err(err) => {
                error!(%err, "failed to start agent");
                post(&state, &channel_id, &thread_ts, &format!(":x: Failed to start task: {err}"))
                    .await;
                return;
            }
        };

    let key = thread_key(&channel_id, &thread_ts);
    state.live_tasks.insert(key.clone(), Arc::clone(&task));

    let watcher_cancel = CancellationToken::new();
    {
        let files = state.files.clone();
        let task_path = task_path.clone();
        let channel_id = channel_id.clone();
        let thread_ts = thread_ts.clone();
        let cancel = watcher_cancel.clone();
        tokio::spawn(async move {
            files.watch_outputs(&task_path, &channel_id, &thread_ts, cancel).await;
        });
    }

    let mut buffer = String::new();
    let mut ticker = tokio::time::interval(BATCH_INTERVAL);
    let mut permissions_open = true;
    let mut done_rx = streams.done;

    // `None` means the output stream closed before the terminal result
    // arrived; it is awaited separately below.
    let outcome: Option<Option<TaskResult>> = loop {
        tokio::select! {
            item = streams.output.recv() => match item {
                Some(OutputItem::TextChunk(text)) => {
                    buffer.push_str(&text);
                    if buffer.len() >= MAX_BATCH_LEN {
                        flush(&state, &channel_id, &thread_ts, &mut buffer).await;
                    }
                }
                Some(OutputItem::ToolResult { tool_name, tool_input, body, is_error }) => {
                    flush(&state, &channel_id, &thread_ts, &mut buffer).await;
                    post_tool_result(
                        &state, &channel_id, &thread_ts,
                        &tool_name, &tool_input, &body, is_error,
                    )
                    .await;
                }
                Some(OutputItem::Stats(stats)) => {
                    flush(&state, &channel_id, &thread_ts, &mut buffer).await;
                    post_stats(&state, &channel_id, &thread_ts, &stats).await;
                }
                None => break None,
            },
            request = streams.permissions.recv(), if permissions_open => match request {
                Some(request) => {
                    handle_permission_request(
                        &state, &task, &key, &channel_id, &thread_ts, &mut buffer, request,
                    )
                    .await;
                }
                None => permissions_open = false,
            },
            _ = ticker.tick() => {
                flush(&state, &channel_id, &thread_ts, &mut buffer).await;
            }
            result = &mut done_rx => break Some(result.ok()),
        }
    };
    let result: Option<TaskResult> = match outcome {
        Some(result) => result,
        None => done_rx.await.ok(),
    };

    flush(&state, &channel_id, &thread_ts, &mut buffer).await;
    finish(&state, &channel_id, &user_id, &task_path, &task_name, &thread_ts, result).await;

    watcher_cancel.cancel();
    state.pending_permissions.remove(&key);
    state.live_tasks.remove(&key);
}

/// Auto-allow by saved rule, or post an interactive prompt.
async fn handle_permission_request(
    state: &Arc<BotState>,
    task: &Arc<RunningTask>,
    key: &str,
    channel_id: &str,
    thread_ts: &str,
    buffer: &mut String,
    request: PermissionRequest,
) {
    if rules::is_allowed(task.task_path(), &request.tool_name, &request.tool_input) {
        info!(tool_name = %request.tool_name, "auto-allowing permission based on saved rule");
        task.send_permission_response(PermissionResponse::allow());
        return;
    }

    flush(state, channel_id, thread_ts, buffer).await;

    let prompt_blocks = blocks::permission_blocks(&request, key);
    match state
        .slack
        .post_blocks(
            SlackChannelId(channel_id.to_owned()),
            prompt_blocks,
            Some(SlackTs(thread_ts.to_owned())),
        )
        .await
    {
        Ok(message_ts) => {
            info!(
                tool_name = %request.tool_name,
                tool_use_id = %request.tool_use_id,
                message_ts = %message_ts,
                "posted permission prompt, waiting for response"
            );
            state.pending_permissions.insert(
                key.to_owned(),
                PendingPermission {
                    message_ts,
                    channel_id: channel_id.to_owned(),
                    thread_ts: thread_ts.to_owned(),
                    tool_name: request.tool_name,
                    tool_input: request.tool_input,
                },
            );
        }
        Err(err) => {
            error!(%err, "failed to post permission prompt");
            task.send_permission_response(PermissionResponse::deny("Failed to prompt user"));
        }
    }
}

/// Post the accumulated text buffer as one mrkdwn message.
async fn flush(state: &Arc<BotState>, channel_id: &str, thread_ts: &str, buffer: &mut String) {
    if buffer.is_empty() {
        return;
    }
    let message = markdown_to_mrkdwn(buffer.trim());
    buffer.clear();
    if message.is_empty() {
        return;
    }
    post(state, channel_id, thread_ts, &message).await;
}

/// Short Bash output goes inline; everything else becomes a snippet upload
/// with a one-line summary.
async fn post_tool_result(
    state: &Arc<BotState>,
    channel_id: &str,
    thread_ts: &str,
    tool_name: &str,
    tool_input: &serde_json::Map<String, serde_json::Value>,
    body: &str,
    _is_error: bool,
) {
    if tool_name == "Bash" && body.len() <= MAX_INLINE_LEN {
        post(state, channel_id, thread_ts, &format!("```\n{body}\n```")).await;
        return;
    }

    let (comment, title) = summarize_tool_result(tool_name, tool_input, body);
    if let Err(err) = state
        .files
        .upload_snippet(channel_id, thread_ts, body, &title, &comment)
        .await
    {
        error!(%err, tool = tool_name, "failed to upload tool snippet");
    }
}

async fn post_stats(state: &Arc<BotState>, channel_id: &str, thread_ts: &str, stats: &TaskStats) {
    if let Err(err) = state
        .slack
        .post_blocks(
            SlackChannelId(channel_id.to_owned()),
            blocks::stats_blocks(stats),
            Some(SlackTs(thread_ts.to_owned())),
        )
        .await
    {
        error!(%err, "failed to post stats message");
    }
}

/// Post the completion message and persist the session descriptor.
async fn finish(
    state: &Arc<BotState>,
    channel_id: &str,
    user_id: &str,
    task_path: &std::path::Path,
    task_name: &str,
    thread_ts: &str,
    result: Option<TaskResult>,
) {
    let Some(result) = result else {
        warn!("task ended without delivering a result");
        post(state, channel_id, thread_ts, ":warning: Task ended unexpectedly.").await;
        return;
    };

    match &result.error {
        Some(err) => {
            error!(%err, "agent returned error");
            post(state, channel_id, thread_ts, &format!(":warning: Task completed with error: {err}"))
                .await;
        }
        None => {
            info!(session_id = result.session_id.as_deref().unwrap_or(""), "task completed");
            post(state, channel_id, thread_ts, ":white_check_mark: Task completed!").await;
        }
    }

    let Some(session_id) = result.session_id.filter(|id| !id.is_empty()) else {
        return;
    };

    let descriptor = match state.sessions.get(channel_id, thread_ts) {
        Some(mut existing) => {
            existing.task_name = task_name.to_owned();
            existing.task_path = task_path.to_path_buf();
            existing.session_id = session_id;
            existing.user_id = user_id.to_owned();
            existing
        }
        None => SessionDescriptor::new(
            channel_id,
            thread_ts,
            task_name,
            task_path,
            session_id,
            user_id,
        ),
    };
    state.sessions.set(descriptor);

    if let Err(err) = state.sessions.save() {
        error!(%err, "failed to save sessions");
    }
}

/// One-line summary and snippet title for an uploaded tool result.
#[must_use]
pub fn summarize_tool_result(
    tool_name: &str,
    tool_input: &serde_json::Map<String, serde_json::Value>,
    body: &str,
) -> (String, String) {
    let get = |key: &str| {
        tool_input
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
    };
    let content_len = body.len();
    let line_count = body.lines().count().max(1);

    match tool_name {
        "Read" => {
            let file_path = get("file_path");
            if file_path.is_empty() {
                (
                    format!(
                        ":page_facing_up: `{tool_name}` ({}, {line_count} lines)",
                        format_bytes(content_len)
                    ),
                    "Read output".to_owned(),
                )
            } else {
                let short = truncate_front(file_path, 50);
                let title = std::path::Path::new(file_path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("Read output")
                    .to_owned();
                (
                    format!(
                        ":page_facing_up: `{tool_name}` `{short}` ({}, {line_count} lines)",
                        format_bytes(content_len)
                    ),
                    title,
                )
            }
        }
        "Grep" => {
            let pattern = get("pattern");
            if pattern.is_empty() {
                (
                    format!(":mag: `{tool_name}` ({line_count} lines)"),
                    "Grep output".to_owned(),
                )
            } else {
                (
                    format!(":mag: `{tool_name}` `{pattern}` ({line_count} lines)"),
                    format!("grep {pattern}"),
                )
            }
        }
        "Glob" => {
            let pattern = get("pattern");
            if pattern.is_empty() {
                (
                    format!(":file_folder: `{tool_name}` ({line_count} files)"),
                    "Glob output".to_owned(),
                )
            } else {
                (
                    format!(":file_folder: `{tool_name}` `{pattern}` ({line_count} files)"),
                    format!("glob {pattern}"),
                )
            }
        }
        "Bash" => {
            let command = get("command");
            if command.is_empty() {
                (
                    format!(":computer: `{tool_name}` ({})", format_bytes(content_len)),
                    "Bash output".to_owned(),
                )
            } else {
                let short = truncate_back(command, 60);
                (
                    format!(":computer: `{tool_name}` `{short}` ({})", format_bytes(content_len)),
                    "bash output".to_owned(),
                )
            }
        }
        "WebSearch" => {
            let query = get("query");
            if query.is_empty() {
                (
                    format!(":globe_with_meridians: `{tool_name}` ({})", format_bytes(content_len)),
                    "WebSearch output".to_owned(),
                )
            } else {
                (
                    format!(
                        ":globe_with_meridians: `{tool_name}` `{query}` ({})",
                        format_bytes(content_len)
                    ),
                    format!("search {query}"),
                )
            }
        }
        "WebFetch" => {
            let url = get("url");
            if url.is_empty() {
                (
                    format!(":inbox_tray: `{tool_name}` ({})", format_bytes(content_len)),
                    "WebFetch output".to_owned(),
                )
            } else {
                let short = truncate_back(url, 50);
                (
                    format!(":inbox_tray: `{tool_name}` `{short}` ({})", format_bytes(content_len)),
                    "fetch output".to_owned(),
                )
            }
        }
        _ => (
            format!(":gear: `{tool_name}` ({})", format_bytes(content_len)),
            format!("{tool_name} output"),
        ),
    }
}

/// Human-readable byte count.
#[must_use]
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

fn truncate_back(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_owned()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn truncate_front(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_owned()
    } else {
        let tail: String = text
            .chars()
            .rev()
            .take(max.saturating_sub(3))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("...{tail}")
    }
}

async fn post(state: &Arc<BotState>, channel_id: &str, thread_ts: &str, text: &str) {
    if let Err(err) = state
        .slack
        .post_message(
            SlackChannelId(channel_id.to_owned()),
            text,
            Some(SlackTs(thread_ts.to_owned())),
        )
        .await
    {
        error!(%err, "failed to post output message");
    }
}
