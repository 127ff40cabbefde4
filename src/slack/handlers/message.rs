//! Plain thread-message routing.
//!
//! Thread replies are the low-friction path: they answer pending permission
//! prompts (text fallback for clients without interactive components), feed
//! live tasks, or resume a stored session without re-mentioning the bot.

use std::sync::Arc;

use slack_morphism::prelude::{SlackChannelId, SlackMessageEvent, SlackTs};
use tracing::{debug, error, info, warn};

use crate::session::thread_key;
use crate::slack::handlers::{self, run};
use crate::slack::{blocks, BotState};

/// Handle a message event (thread replies only).
pub async fn handle_message(state: Arc<BotState>, event: SlackMessageEvent) {
    // Bot messages (including our own) never drive the dispatcher.
    if event.sender.bot_id.is_some() {
        return;
    }
    let Some(thread_ts) = event.origin.thread_ts.as_ref().map(ToString::to_string) else {
        return;
    };
    let Some(channel_id) = event.origin.channel.as_ref().map(ToString::to_string) else {
        return;
    };
    let user_id = event
        .sender
        .user
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let message_ts = event.origin.ts.to_string();
    let text = event
        .content
        .as_ref()
        .and_then(|content| content.text.clone())
        .unwrap_or_default();

    // Messages that @mention someone are left to the app_mention event
    // (which fires if the mention is the bot).
    if let Some(mentioned) = handlers::leading_mention(&text) {
        debug!(%mentioned, "message mentions a user, ignoring");
        return;
    }

    let key = thread_key(&channel_id, &thread_ts);

    if let Some(task) = state.live_tasks.get(&key).map(|entry| Arc::clone(entry.value())) {
        // Text fallback for a pending permission prompt takes precedence
        // over follow-up input.
        if let Some(pending) = state
            .pending_permissions
            .get(&key)
            .map(|entry| entry.value().clone())
        {
            if let Some(response) = handlers::parse_permission_response(&text) {
                info!(
                    behavior = response.behavior.as_str(),
                    "received permission response from user (text)"
                );
                let behavior = response.behavior.as_str().to_owned();
                task.send_permission_response(response);
                state.pending_permissions.remove(&key);

                let updated = blocks::decision_blocks(&pending, &behavior, &user_id, "");
                if let Err(err) = state
                    .slack
                    .update_blocks(
                        SlackChannelId(pending.channel_id.clone()),
                        pending.message_ts.clone(),
                        updated,
                    )
                    .await
                {
                    error!(%err, "failed to update permission message");
                }
                return;
            }

            post(
                &state,
                &channel_id,
                &thread_ts,
                "_Please use the buttons above to respond, or type_ `yes` _or_ `no`_._",
            )
            .await;
            return;
        }

        debug!(input = %text, "sending thread reply to running task");
        handlers::forward_followup(&state, &task, &channel_id, &thread_ts, &message_ts, &text)
            .await;
        return;
    }

    // No live task: resume the stored session, or explain how to start one.
    let Some(session) = state.sessions.get(&channel_id, &thread_ts) else {
        debug!("no running task or saved session for thread");
        post(
            &state,
            &channel_id,
            &thread_ts,
            ":question: I don't have a saved session for this thread. \
             Use `@bot task_name: your instructions` to start a new task.",
        )
        .await;
        return;
    };

    if !state.auth.is_allowed(&user_id) {
        warn!(user = %user_id, "unauthorized user trying to resume session");
        return;
    }

    info!(
        task = %session.task_name,
        session_id = %session.session_id,
        "resuming session from thread reply"
    );

    let downloaded = state
        .files
        .download_message_files(&channel_id, &thread_ts, &message_ts, &session.task_path)
        .await;

    let mut prompt = text;
    if !downloaded.is_empty() {
        prompt.push_str("\n\nAttached files have been saved to:\n");
        for path in &downloaded {
            prompt.push_str(&format!("- {}\n", path.display()));
        }
    }

    post(
        &state,
        &channel_id,
        &thread_ts,
        &format!(":arrows_counterclockwise: Resuming task `{}`...", session.task_name),
    )
    .await;

    run::run_task(
        state,
        channel_id,
        user_id,
        session.task_path.clone(),
        session.task_name.clone(),
        prompt,
        Some(session.session_id.clone()),
        thread_ts,
    )
    .await;
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
