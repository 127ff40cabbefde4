//! Permission button handling.

use std::sync::Arc;

use slack_morphism::prelude::{SlackChannelId, SlackTs};
use tracing::{debug, error, info, warn};

use crate::permission::{rules, PermissionBehavior, PermissionResponse};
use crate::slack::blocks::{self, PermissionActionValue};
use crate::slack::BotState;

const PERMISSION_ACTIONS: &[&str] = &[
    "permission_allow",
    "permission_deny",
    "permission_allow_always",
    "permission_allow_similar",
];

/// Handle a block-action click.
///
/// Only the four permission action ids are recognized; everything else is
/// ignored.
pub async fn handle_block_action(
    state: Arc<BotState>,
    action_id: &str,
    value: &str,
    user_id: &str,
    channel_id: &str,
    message_ts: Option<SlackTs>,
) {
    if !PERMISSION_ACTIONS.contains(&action_id) {
        debug!(action_id, "ignoring non-permission action");
        return;
    }

    let action_value: PermissionActionValue = match serde_json::from_str(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(%err, value, "failed to decode action value");
            return;
        }
    };

    info!(
        thread_key = %action_value.thread_key,
        behavior = %action_value.behavior,
        remember = %action_value.remember,
        "handling permission action"
    );

    let Some(task) = state
        .live_tasks
        .get(&action_value.thread_key)
        .map(|entry| Arc::clone(entry.value()))
    else {
        warn!("no running task found for permission response");
        // The prompt outlived its task; mark it stale instead of leaving
        // dead buttons.
        if let Some(ts) = message_ts {
            if let Err(err) = state
                .slack
                .update_message(
                    SlackChannelId(channel_id.to_owned()),
                    ts,
                    ":warning: This permission request is no longer active.",
                )
                .await
            {
                error!(%err, "failed to mark stale permission prompt");
            }
        }
        return;
    };

    let Some(pending) = state
        .pending_permissions
        .get(&action_value.thread_key)
        .map(|entry| entry.value().clone())
    else {
        warn!("no pending permission found");
        return;
    };

    let response = if action_value.behavior == "deny" {
        PermissionResponse::deny(format!("User {user_id} denied permission"))
    } else {
        PermissionResponse {
            behavior: PermissionBehavior::Allow,
            message: None,
        }
    };

    info!(behavior = response.behavior.as_str(), "sending permission response from button click");
    task.send_permission_response(response);

    if !action_value.remember.is_empty() && action_value.behavior == "allow" {
        match rules::save_rule(task.task_path(), &action_value.remember) {
            Ok(()) => info!(pattern = %action_value.remember, "saved permission rule"),
            Err(err) => {
                error!(%err, pattern = %action_value.remember, "failed to save permission rule");
            }
        }
    }

    state.pending_permissions.remove(&action_value.thread_key);

    let updated = blocks::decision_blocks(
        &pending,
        &action_value.behavior,
        user_id,
        &action_value.remember,
    );
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
}
