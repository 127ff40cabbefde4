//! Slack Block Kit message builders.
//!
//! Permission prompts, their decision rewrites, and the completion stats
//! block all live here so the prompt and its rewrite stay visually in sync.

use serde_json::{Map, Value};
use slack_morphism::prelude::{
    SlackActionBlockElement, SlackActionsBlock, SlackBlock, SlackBlockButtonElement,
    SlackBlockId, SlackBlockPlainTextOnly, SlackBlockText, SlackContextBlock,
    SlackContextBlockElement, SlackSectionBlock,
};

use crate::permission::{rules, PermissionRequest};
use crate::runner::TaskStats;
use crate::slack::PendingPermission;

/// Maximum command length shown in a permission prompt.
const MAX_COMMAND_DISPLAY: usize = 500;

/// Value payload encoded into permission button actions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PermissionActionValue {
    /// Thread key for looking up the live task.
    #[serde(rename = "k")]
    pub thread_key: String,
    /// `allow` or `deny`.
    #[serde(rename = "b")]
    pub behavior: String,
    /// Permission rule to persist on allow; empty for one-time decisions.
    #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
    pub remember: String,
}

/// Build a plain markdown section block.
#[must_use]
pub fn text_section(text: &str) -> SlackBlock {
    SlackBlock::Section(SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(text.into())))
}

/// Build an actions block with the given `(action_id, label, value)` buttons.
#[must_use]
pub fn action_buttons(block_id: &str, buttons: &[(&str, &str, &str)]) -> SlackBlock {
    let elements: Vec<SlackActionBlockElement> = buttons
        .iter()
        .map(|(action_id, text, value)| {
            SlackActionBlockElement::Button(
                SlackBlockButtonElement::new(
                    (*action_id).into(),
                    SlackBlockPlainTextOnly::from(*text),
                )
                .with_value((*value).into()),
            )
        })
        .collect();
    SlackBlock::Actions(
        SlackActionsBlock::new(elements).with_block_id(SlackBlockId(block_id.into())),
    )
}

/// Tool-specific detail line for a permission prompt.
///
/// Chosen to keep the prompt intelligible: commands as code blocks, paths
/// and URLs verbatim, anything else as key/value pairs.
#[must_use]
pub fn permission_detail(tool_name: &str, tool_input: &Map<String, Value>) -> Option<String> {
    let get = |key: &str| tool_input.get(key).and_then(Value::as_str);

    match tool_name {
        "Bash" => get("command").map(|command| {
            let mut command = command.to_owned();
            if command.len() > MAX_COMMAND_DISPLAY {
                command.truncate(MAX_COMMAND_DISPLAY);
                command.push_str("...");
            }
            format!("*Command:*\n```{command}```")
        }),
        "Write" | "Edit" | "Read" => get("file_path").map(|path| format!("*File:* `{path}`")),
        "WebFetch" => get("url").map(|url| format!("*URL:* {url}")),
        "WebSearch" => get("query").map(|query| format!("*Query:* `{query}`")),
        _ => {
            let mut parts: Vec<String> = tool_input
                .iter()
                .map(|(key, value)| format!("*{key}:* `{value}`"))
                .collect();
            parts.sort();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
    }
}

/// Build the interactive permission prompt for a request.
///
/// Always offers Allow Once / Deny / Allow All `<tool>`; Allow Similar is
/// added only when the generated pattern differs from the allow-all rule.
#[must_use]
pub fn permission_blocks(request: &PermissionRequest, thread_key: &str) -> Vec<SlackBlock> {
    let mut blocks = vec![
        text_section(":lock: *Permission Required*"),
        text_section(&format!("*Tool:* `{}`", request.tool_name)),
    ];
    if let Some(detail) = permission_detail(&request.tool_name, &request.tool_input) {
        blocks.push(text_section(&detail));
    }

    let always_pattern = request.tool_name.clone();
    let similar_pattern = rules::similar_pattern(&request.tool_name, &request.tool_input);

    let allow_once = action_value(thread_key, "allow", "");
    let deny = action_value(thread_key, "deny", "");
    let allow_always = action_value(thread_key, "allow", &always_pattern);

    blocks.push(action_buttons(
        "permission_actions",
        &[
            ("permission_allow", "Allow Once", &allow_once),
            ("permission_deny", "Deny", &deny),
        ],
    ));

    let allow_all_label = format!("Allow All {}", request.tool_name);
    match similar_pattern.filter(|pattern| pattern != &always_pattern) {
        Some(pattern) => {
            let allow_similar = action_value(thread_key, "allow", &pattern);
            blocks.push(action_buttons(
                "permission_actions_2",
                &[
                    ("permission_allow_always", &allow_all_label, &allow_always),
                    ("permission_allow_similar", "Allow Similar", &allow_similar),
                ],
            ));
        }
        None => {
            blocks.push(action_buttons(
                "permission_actions_2",
                &[("permission_allow_always", &allow_all_label, &allow_always)],
            ));
        }
    }

    blocks
}

fn action_value(thread_key: &str, behavior: &str, remember: &str) -> String {
    serde_json::to_string(&PermissionActionValue {
        thread_key: thread_key.to_owned(),
        behavior: behavior.to_owned(),
        remember: remember.to_owned(),
    })
    .unwrap_or_default()
}

/// Rewrite of a permission prompt showing the decision and actor.
#[must_use]
pub fn decision_blocks(
    pending: &PendingPermission,
    behavior: &str,
    user_id: &str,
    remembered: &str,
) -> Vec<SlackBlock> {
    let (emoji, action) = if behavior == "allow" {
        (":white_check_mark:", "Allowed")
    } else {
        (":x:", "Denied")
    };

    let header = if remembered.is_empty() {
        format!("{emoji} *{action}* by <@{user_id}>")
    } else {
        format!("{emoji} *{action}* by <@{user_id}>\n:brain: Remembered: `{remembered}`")
    };

    let mut blocks = vec![
        text_section(&header),
        text_section(&format!("*Tool:* `{}`", pending.tool_name)),
    ];
    if let Some(detail) = permission_detail(&pending.tool_name, &pending.tool_input) {
        blocks.push(text_section(&detail));
    }
    blocks
}

/// Compact completion stats as a single context block.
#[must_use]
pub fn stats_blocks(stats: &TaskStats) -> Vec<SlackBlock> {
    let status_emoji = if stats.is_error {
        ":warning:"
    } else {
        ":chart_with_upwards_trend:"
    };

    let elements = vec![
        SlackContextBlockElement::MarkDown(format!("{status_emoji} *Task Stats*").into()),
        SlackContextBlockElement::MarkDown(
            format!(":stopwatch: {}", format_duration_ms(stats.duration_ms)).into(),
        ),
        SlackContextBlockElement::MarkDown(
            format!(":arrows_counterclockwise: {} turns", stats.num_turns).into(),
        ),
        SlackContextBlockElement::MarkDown(format!(":moneybag: ${:.4}", stats.cost_usd).into()),
    ];

    vec![SlackBlock::Context(SlackContextBlock::new(elements))]
}

/// Humanize a millisecond duration: `4.2s` below a minute, `3m 12s` above.
#[must_use]
pub fn format_duration_ms(duration_ms: u64) -> String {
    let total_secs = duration_ms as f64 / 1000.0;
    if total_secs >= 60.0 {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs as u64 % 60;
        format!("{mins}m {secs}s")
    } else {
        format!("{total_secs:.1}s")
    }
}
