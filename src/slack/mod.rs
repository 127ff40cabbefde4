//! Slack integration: client, event dispatch, and the task pump.

pub mod blocks;
pub mod client;
pub mod events;
pub mod handlers;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use slack_morphism::prelude::SlackTs;

use crate::auth::Allowlist;
use crate::files::FileHandler;
use crate::runner::{Runner, RunningTask};
use crate::session::SessionStore;
use crate::tasks::TaskRegistry;

pub use client::SlackService;

/// A permission prompt posted to chat and awaiting a decision.
///
/// Present only while the prompt is unanswered; cleared on any decision.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    /// Timestamp of the prompt message, for rewriting it with the outcome.
    pub message_ts: SlackTs,
    pub channel_id: String,
    pub thread_ts: String,
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
}

/// Shared state for every Slack event handler.
///
/// The two per-thread maps are the dispatcher's working memory: at most one
/// live task exists per thread key, and a pending permission exists only
/// while its prompt is unanswered.
pub struct BotState {
    pub auth: Allowlist,
    pub tasks: TaskRegistry,
    pub sessions: Arc<SessionStore>,
    pub runner: Runner,
    pub slack: Arc<SlackService>,
    pub files: FileHandler,
    pub live_tasks: DashMap<String, Arc<RunningTask>>,
    pub pending_permissions: DashMap<String, PendingPermission>,
}
