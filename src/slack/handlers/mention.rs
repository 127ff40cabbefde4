//! App-mention routing.
//!
//! A mention either feeds a live task, continues a stored session, or
//! starts a new task from a `<mention> task_name: instructions` directive.

use std::sync::Arc;

use slack_morphism::prelude::{SlackAppMentionEvent, SlackChannelId, SlackTs};
use tracing::{error, info, warn};

use crate::session::thread_key;
use crate::slack::handlers::{self, run};
use crate::slack::BotState;

/// Handle an app-mention event.
pub async fn handle_app_mention(state: Arc<BotState>, event: SlackAppMentionEvent) {
    let channel_id = event.channel.to_string();
    let user_id = event.user.to_string();
    let message_ts = event.origin.ts.to_string();
    // Thread root: the thread the mention sits in, else the mention itself.
    let thread_ts = event
        .origin
        .thread_ts
        .as_ref()
        .map_or_else(|| message_ts.clone(), ToString::to_string);
    let text = event.content.text.clone().unwrap_or_default();

    info!(channel = %channel_id, %thread_ts, user = %user_id, "handling app mention");

    if !state.auth.is_allowed(&user_id) {
        warn!(user = %user_id, "unauthorized user");
        post(&state, &channel_id, &thread_ts, state.auth.reject_message()).await;
        return;
    }

    let key = thread_key(&channel_id, &thread_ts);

    // A live task gets the text as follow-up input; never spawn a second
    // task into the same thread.
    if let Some(task) = state.live_tasks.get(&key).map(|entry| Arc::clone(entry.value())) {
        let input = handlers::parse_continuation(&text);
        if !input.is_empty() {
            handlers::forward_followup(&state, &task, &channel_id, &thread_ts, &message_ts, &input)
                .await;
        }
        return;
    }

    match state.sessions.get(&channel_id, &thread_ts) {
        Some(session) => {
            handle_continuation(state, &channel_id, &user_id, &thread_ts, &message_ts, &text, session)
                .await;
        }
        None => {
            handle_new_task(state, &channel_id, &user_id, &thread_ts, &message_ts, &text).await;
        }
    }
}

async fn handle_continuation(
    state: Arc<BotState>,
    channel_id: &str,
    user_id: &str,
    thread_ts: &str,
    message_ts: &str,
    text: &str,
    session: crate::session::SessionDescriptor,
) {
    let instructions = handlers::parse_continuation(text);
    if instructions.is_empty() {
        post(&state, channel_id, thread_ts, "Please provide instructions for the task.").await;
        return;
    }

    info!(
        task = %session.task_name,
        session_id = %session.session_id,
        "continuing existing session"
    );

    let prompt = intake_files(&state, channel_id, thread_ts, message_ts, &session.task_path, instructions)
        .await;

    post(
        &state,
        channel_id,
        thread_ts,
        &format!(":arrows_counterclockwise: Continuing task `{}`...", session.task_name),
    )
    .await;

    run::run_task(
        state,
        channel_id.to_owned(),
        user_id.to_owned(),
        session.task_path.clone(),
        session.task_name.clone(),
        prompt,
        Some(session.session_id.clone()),
        thread_ts.to_owned(),
    )
    .await;
}

async fn handle_new_task(
    state: Arc<BotState>,
    channel_id: &str,
    user_id: &str,
    thread_ts: &str,
    message_ts: &str,
    text: &str,
) {
    let Some(parsed) = handlers::parse_mention(text) else {
        let msg = format!(
            "I didn't understand that. Please use the format: \
             `@bot task_name: your instructions`\n\n{}",
            state.tasks.list_formatted()
        );
        post(&state, channel_id, thread_ts, &msg).await;
        return;
    };

    let task_path = match state.tasks.lookup(&parsed.task_name) {
        Ok(path) => path,
        Err(_) => {
            let msg = format!(
                "Unknown task: `{}`\n\n{}",
                parsed.task_name,
                state.tasks.list_formatted()
            );
            post(&state, channel_id, thread_ts, &msg).await;
            return;
        }
    };

    info!(
        task = %parsed.task_name,
        task_path = %task_path.display(),
        "starting new task"
    );

    let prompt =
        intake_files(&state, channel_id, thread_ts, message_ts, &task_path, parsed.instructions)
            .await;

    post(
        &state,
        channel_id,
        thread_ts,
        &format!(":rocket: Starting a `{}` task...", parsed.task_name),
    )
    .await;

    run::run_task(
        state,
        channel_id.to_owned(),
        user_id.to_owned(),
        task_path,
        parsed.task_name,
        prompt,
        None,
        thread_ts.to_owned(),
    )
    .await;
}

/// Download message attachments into the task directory and extend the
/// prompt with their local paths.
async fn intake_files(
    state: &Arc<BotState>,
    channel_id: &str,
    thread_ts: &str,
    message_ts: &str,
    task_path: &std::path::Path,
    mut prompt: String,
) -> String {
    let downloaded = state
        .files
        .download_message_files(channel_id, thread_ts, message_ts, task_path)
        .await;

    if !downloaded.is_empty() {
        prompt.push_str("\n\nAttached files have been saved to:\n");
        for path in &downloaded {
            prompt.push_str(&format!("- {}\n", path.display()));
        }
    }
    prompt
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
        error!(%err, "failed to post message");
    }
}
