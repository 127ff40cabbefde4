//! Wire types for the agent's line-framed stream-json protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// One decoded line from the agent's stream-json output.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Set on `system` and `result` messages.
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message: Option<StreamMessageBody>,
    /// Final result text on `result` messages.
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub is_error: bool,
    /// Partial streaming payload on `content_block_delta` messages.
    #[serde(default)]
    pub content_block_delta: Option<ContentBlockDelta>,
}

/// Message body carried by `assistant` and `user` messages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamMessageBody {
    #[serde(default)]
    pub content: Vec<StreamContentBlock>,
}

/// A content block inside a message body.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    /// Tool use id on `tool_use` blocks.
    #[serde(default)]
    pub id: String,
    /// Tool name on `tool_use` blocks.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Back-reference on `tool_result` blocks.
    #[serde(default)]
    pub tool_use_id: String,
    /// Tool result body: a string or an array of text parts.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl StreamContentBlock {
    /// Extract the textual body of a `tool_result` block.
    ///
    /// Handles both plain string content and an array of `text` parts,
    /// which are joined with newlines.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter(|part| {
                        part.get("type").and_then(Value::as_str) == Some("text")
                    })
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .filter(|text| !text.is_empty())
                    .collect();
                texts.join("\n")
            }
            _ => String::new(),
        }
    }
}

/// Partial content update during streaming.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlockDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<TextDelta>,
}

/// The text payload inside a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct TextDelta {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// An image forwarded with follow-up input.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    /// Declared MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Raw image bytes; encoded as base64 on the wire.
    pub data: Vec<u8>,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: InputMessageBody<'a>,
}

#[derive(Serialize)]
struct InputMessageBody<'a> {
    role: &'static str,
    content: Vec<InputContentBlock<'a>>,
}

#[derive(Serialize)]
struct InputContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<ImageSource>,
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

/// Serialize one follow-up user message for the agent's stdin.
///
/// Image blocks come before the text block. Empty text with no attachments
/// is rejected; the agent treats an empty content list as malformed input.
///
/// # Errors
///
/// Returns `AppError::Protocol` when there is nothing to send or the
/// message cannot be serialized.
pub fn build_input_message(text: &str, images: &[ImageAttachment]) -> Result<String> {
    if text.is_empty() && images.is_empty() {
        return Err(AppError::Protocol("empty input message".into()));
    }

    let mut content = Vec::with_capacity(images.len() + 1);
    for image in images {
        content.push(InputContentBlock {
            kind: "image",
            text: None,
            source: Some(ImageSource {
                kind: "base64",
                media_type: image.media_type.clone(),
                data: BASE64.encode(&image.data),
            }),
        });
    }
    if !text.is_empty() {
        content.push(InputContentBlock {
            kind: "text",
            text: Some(text),
            source: None,
        });
    }

    let message = InputMessage {
        kind: "user",
        message: InputMessageBody {
            role: "user",
            content,
        },
    };
    serde_json::to_string(&message)
        .map_err(|err| AppError::Protocol(format!("serialize input message: {err}")))
}
