//! Slack event handlers.

pub mod action;
pub mod mention;
pub mod message;
pub mod run;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use slack_morphism::prelude::{SlackChannelId, SlackTs};
use tracing::{error, warn};

use crate::permission::{PermissionBehavior, PermissionResponse};
use crate::runner::RunningTask;
use crate::slack::BotState;

/// Matches `<@BOT_ID> task_name: instructions`.
static MENTION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@[A-Z0-9]+>\s+(\S+?):\s*(.+)").expect("mention regex"));

/// Matches a leading `<@USER_ID>` mention token.
static LEADING_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<@([A-Z0-9]+)>").expect("leading mention regex"));

static CONTINUATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@[A-Z0-9]+>\s*((?s).*)").expect("continuation regex"));

/// A parsed new-task directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMention {
    pub task_name: String,
    pub instructions: String,
}

/// Parse a new-task directive of the shape `<mention> <taskname>: <text>`.
#[must_use]
pub fn parse_mention(text: &str) -> Option<ParsedMention> {
    let captures = MENTION_PATTERN.captures(text)?;
    Some(ParsedMention {
        task_name: captures[1].to_lowercase(),
        instructions: captures[2].trim().to_owned(),
    })
}

/// Strip the leading mention token from a follow-up message.
#[must_use]
pub fn parse_continuation(text: &str) -> String {
    CONTINUATION_PATTERN
        .captures(text)
        .map_or_else(|| text.trim().to_owned(), |c| c[1].trim().to_owned())
}

/// The user ID mentioned at the start of the message, if any.
#[must_use]
pub fn leading_mention(text: &str) -> Option<String> {
    LEADING_MENTION
        .captures(text)
        .map(|captures| captures[1].to_owned())
}

/// Interpret free text as a permission decision.
///
/// The word lists are deliberately explicit: anything outside them is not a
/// decision, so a stray reply can never approve a tool.
#[must_use]
pub fn parse_permission_response(text: &str) -> Option<PermissionResponse> {
    match text.trim().to_lowercase().as_str() {
        "yes" | "y" | "allow" | "ok" | "approve" | "approved" | "accept" | "yep" | "yeah"
        | "sure" => Some(PermissionResponse {
            behavior: PermissionBehavior::Allow,
            message: None,
        }),
        "no" | "n" | "deny" | "denied" | "reject" | "rejected" | "nope" | "nah" => {
            Some(PermissionResponse::deny("User denied permission"))
        }
        _ => None,
    }
}

/// Forward a follow-up message to a live task.
///
/// Image attachments on the message travel inline as base64 blocks; other
/// attachments are downloaded into the task directory and referenced by
/// path.
pub async fn forward_followup(
    state: &Arc<BotState>,
    task: &Arc<RunningTask>,
    channel_id: &str,
    thread_ts: &str,
    message_ts: &str,
    text: &str,
) {
    let (images, file_paths) = state
        .files
        .collect_attachments(channel_id, thread_ts, message_ts, task.task_path())
        .await;

    let mut input = text.to_owned();
    if !file_paths.is_empty() {
        input.push_str("\n\nAttached files have been saved to:\n");
        for path in &file_paths {
            input.push_str(&format!("- {}\n", path.display()));
        }
    }

    if input.trim().is_empty() && images.is_empty() {
        return;
    }

    if let Err(err) = task.send_input_with_images(&input, &images) {
        error!(%err, "failed to send input to task");
        if let Err(err) = state
            .slack
            .post_message(
                SlackChannelId(channel_id.to_owned()),
                format!(":warning: Failed to forward input: {err}"),
                Some(SlackTs(thread_ts.to_owned())),
            )
            .await
        {
            warn!(%err, "failed to post forward error");
        }
    }
}
