//! Socket Mode event dispatch.
//!
//! Receives push events (mentions, thread messages) and interactive
//! payloads (permission buttons), extracts the shared [`BotState`], and
//! hands off to the handlers. Event processing is spawned onto the runtime
//! so the socket loop acknowledges the transport promptly even while a task
//! runs for minutes.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector,
    SlackEventCallbackBody, SlackInteractionEvent, SlackPushEventCallback,
};
use tracing::{debug, info, warn};

use crate::slack::{handlers, BotState};

async fn bot_state(state: &SlackClientEventsUserState) -> Option<Arc<BotState>> {
    let guard = state.read().await;
    guard.get_user_state::<Arc<BotState>>().cloned()
}

/// Handle Events API pushes delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged and the transport is acknowledged.
pub async fn handle_push(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let Some(bot) = bot_state(&state).await else {
        warn!("bot state not available; cannot process push event");
        return Ok(());
    };

    match event.event {
        SlackEventCallbackBody::AppMention(mention) => {
            info!(
                channel = %mention.channel,
                user = %mention.user,
                "received app mention"
            );
            tokio::spawn(async move {
                handlers::mention::handle_app_mention(bot, mention).await;
            });
        }
        SlackEventCallbackBody::Message(message) => {
            tokio::spawn(async move {
                handlers::message::handle_message(bot, message).await;
            });
        }
        other => {
            debug!(event = ?other, "unhandled push event type");
        }
    }

    Ok(())
}

/// Handle interactive payloads (permission buttons) delivered via Socket
/// Mode.
///
/// Every block action is checked against the allowlist before dispatch;
/// unauthorized clicks are dropped with a security log and no feedback.
///
/// # Errors
///
/// Never fails; problems are logged and the transport is acknowledged.
pub async fn handle_interaction(
    event: SlackInteractionEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let SlackInteractionEvent::BlockActions(block_event) = &event else {
        debug!("unhandled interaction type");
        return Ok(());
    };

    let user_id = block_event
        .user
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_default();
    if user_id.is_empty() {
        warn!("block action with empty user ID; ignoring");
        return Ok(());
    }

    let Some(bot) = bot_state(&state).await else {
        warn!("bot state not available; cannot process interaction");
        return Ok(());
    };

    if !bot.auth.is_allowed(&user_id) {
        warn!(user_id = %user_id, "unauthorized user attempted interaction (ignored)");
        return Ok(());
    }

    let channel_id = block_event
        .channel
        .as_ref()
        .map(|channel| channel.id.to_string())
        .unwrap_or_default();
    let message_ts = block_event
        .message
        .as_ref()
        .map(|message| message.origin.ts.clone());

    if let Some(actions) = &block_event.actions {
        for action in actions {
            let action_id = action.action_id.to_string();
            let value = action.value.clone().unwrap_or_default();
            info!(%action_id, %user_id, "processing block action");

            let bot = Arc::clone(&bot);
            let user_id = user_id.clone();
            let channel_id = channel_id.clone();
            let message_ts = message_ts.clone();
            tokio::spawn(async move {
                handlers::action::handle_block_action(
                    bot,
                    &action_id,
                    &value,
                    &user_id,
                    &channel_id,
                    message_ts,
                )
                .await;
            });
        }
    }

    Ok(())
}
