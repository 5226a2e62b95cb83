//! Anthropic-style message codec.
//!
//! Tool messages become user-role messages holding `tool_result` blocks
//! keyed by invocation id; assistant messages with invocations become block
//! lists mixing `text` and `tool_use`; image attachments are preserved as
//! base64 or URL source blocks. System messages are the adapter's concern
//! (they ride the top-level `system` field) and are not encoded here.

use crate::CodecError;
use serde_json::{json, Value};
use weft_contract::{ImageSource, Message, Role, ToolInvocation, ToolOutcome};

fn image_block(image: &ImageSource) -> Value {
    match image {
        ImageSource::Base64 { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        }),
        ImageSource::Url { url } => json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }),
    }
}

fn encode_message(message: &Message) -> Option<Value> {
    match message.role {
        Role::System => None,
        Role::User => {
            let images = message.images.as_deref().unwrap_or_default();
            if images.is_empty() {
                Some(json!({ "role": "user", "content": message.content }))
            } else {
                let mut blocks: Vec<Value> = images.iter().map(image_block).collect();
                if !message.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": message.content }));
                }
                Some(json!({ "role": "user", "content": blocks }))
            }
        }
        Role::Assistant => {
            let calls = message.tool_calls.as_deref().unwrap_or_default();
            if calls.is_empty() {
                return Some(json!({ "role": "assistant", "content": message.content }));
            }
            let mut blocks = Vec::new();
            if !message.content.is_empty() {
                blocks.push(json!({ "type": "text", "text": message.content }));
            }
            for call in calls {
                let input: Value = serde_json::from_str(&call.input).unwrap_or(Value::Null);
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": input,
                }));
            }
            Some(json!({ "role": "assistant", "content": blocks }))
        }
        Role::Tool => {
            let outcomes = message.tool_results.as_deref().unwrap_or_default();
            let blocks: Vec<Value> = outcomes
                .iter()
                .map(|outcome| {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": outcome.call_id,
                        "content": outcome.content,
                    });
                    if outcome.is_error {
                        block["is_error"] = json!(true);
                    }
                    block
                })
                .collect();
            Some(json!({ "role": "user", "content": blocks }))
        }
    }
}

/// Encode internal messages into the Anthropic wire shape.
pub fn to_wire(messages: &[Message]) -> Vec<Value> {
    messages.iter().filter_map(encode_message).collect()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, CodecError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::InvalidMessage(format!("missing string field '{key}'")))
}

fn decode_user_blocks(blocks: &[Value]) -> Result<Message, CodecError> {
    let has_tool_results = blocks
        .iter()
        .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"));

    if has_tool_results {
        let mut outcomes = Vec::new();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let content = block
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let mut outcome = ToolOutcome::success(str_field(block, "tool_use_id")?, content);
            outcome.is_error = is_error;
            outcomes.push(outcome);
        }
        return Ok(Message::tool(outcomes));
    }

    let mut images = Vec::new();
    let mut text = String::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("image") => {
                let source = block
                    .get("source")
                    .ok_or_else(|| CodecError::InvalidMessage("image without source".into()))?;
                match source.get("type").and_then(Value::as_str) {
                    Some("base64") => images.push(ImageSource::Base64 {
                        media_type: str_field(source, "media_type")?.to_string(),
                        data: str_field(source, "data")?.to_string(),
                    }),
                    Some("url") => images.push(ImageSource::Url {
                        url: str_field(source, "url")?.to_string(),
                    }),
                    other => {
                        return Err(CodecError::InvalidMessage(format!(
                            "unknown image source type: {other:?}"
                        )))
                    }
                }
            }
            Some("text") => text.push_str(str_field(block, "text")?),
            other => {
                return Err(CodecError::InvalidMessage(format!(
                    "unexpected user block type: {other:?}"
                )))
            }
        }
    }
    Ok(Message::user(text).with_images(images))
}

fn decode_assistant_blocks(blocks: &[Value]) -> Result<Message, CodecError> {
    let mut text = String::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(str_field(block, "text")?),
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let input = serde_json::to_string(&input)
                    .map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
                calls.push(ToolInvocation::new(
                    str_field(block, "id")?,
                    str_field(block, "name")?,
                    input,
                ));
            }
            other => {
                return Err(CodecError::InvalidMessage(format!(
                    "unexpected assistant block type: {other:?}"
                )))
            }
        }
    }
    Ok(Message::assistant(text).with_tool_calls(calls))
}

fn decode_message(value: &Value) -> Result<Message, CodecError> {
    let role = str_field(value, "role")?;
    let content = value
        .get("content")
        .ok_or_else(|| CodecError::InvalidMessage("missing content".into()))?;
    match (role, content) {
        ("user", Value::String(text)) => Ok(Message::user(text.clone())),
        ("user", Value::Array(blocks)) => decode_user_blocks(blocks),
        ("assistant", Value::String(text)) => Ok(Message::assistant(text.clone())),
        ("assistant", Value::Array(blocks)) => decode_assistant_blocks(blocks),
        (role, _) => Err(CodecError::InvalidMessage(format!(
            "unsupported role/content combination: {role}"
        ))),
    }
}

/// Decode Anthropic wire messages back into the internal model.
pub fn from_wire(values: &[Value]) -> Result<Vec<Message>, CodecError> {
    values.iter().map(decode_message).collect()
}
