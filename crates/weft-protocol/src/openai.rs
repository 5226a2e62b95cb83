//! OpenAI-style message codec.
//!
//! Tool messages fan out to one wire message per outcome bearing
//! `tool_call_id`; assistant invocations use the `function` shape with raw
//! JSON argument strings; images become `image_url` content parts (base64
//! attachments ride a data URI). Consecutive `tool` wire messages merge back
//! into one internal tool message on decode.

use crate::CodecError;
use serde_json::{json, Value};
use weft_contract::{ImageSource, Message, Role, ToolInvocation, ToolOutcome};

fn image_part(image: &ImageSource) -> Value {
    let url = match image {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
    };
    json!({ "type": "image_url", "image_url": { "url": url } })
}

fn encode_message(message: &Message, out: &mut Vec<Value>) {
    match message.role {
        Role::System => out.push(json!({ "role": "system", "content": message.content })),
        Role::User => {
            let images = message.images.as_deref().unwrap_or_default();
            if images.is_empty() {
                out.push(json!({ "role": "user", "content": message.content }));
            } else {
                let mut parts = vec![json!({ "type": "text", "text": message.content })];
                parts.extend(images.iter().map(image_part));
                out.push(json!({ "role": "user", "content": parts }));
            }
        }
        Role::Assistant => {
            let calls = message.tool_calls.as_deref().unwrap_or_default();
            if calls.is_empty() {
                out.push(json!({ "role": "assistant", "content": message.content }));
                return;
            }
            let tool_calls: Vec<Value> = calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.input },
                    })
                })
                .collect();
            out.push(json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": tool_calls,
            }));
        }
        Role::Tool => {
            for outcome in message.tool_results.as_deref().unwrap_or_default() {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": outcome.call_id,
                    "content": outcome.content,
                }));
            }
        }
    }
}

/// Encode internal messages into the OpenAI wire shape.
pub fn to_wire(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in messages {
        encode_message(message, &mut out);
    }
    out
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, CodecError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::InvalidMessage(format!("missing string field '{key}'")))
}

fn decode_image_url(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return ImageSource::Base64 {
                media_type: media_type.to_string(),
                data: data.to_string(),
            };
        }
    }
    ImageSource::Url {
        url: url.to_string(),
    }
}

fn decode_user(value: &Value) -> Result<Message, CodecError> {
    match value.get("content") {
        Some(Value::String(text)) => Ok(Message::user(text.clone())),
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => text.push_str(str_field(part, "text")?),
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                CodecError::InvalidMessage("image_url without url".into())
                            })?;
                        images.push(decode_image_url(url));
                    }
                    other => {
                        return Err(CodecError::InvalidMessage(format!(
                            "unexpected user part type: {other:?}"
                        )))
                    }
                }
            }
            Ok(Message::user(text).with_images(images))
        }
        _ => Err(CodecError::InvalidMessage("user without content".into())),
    }
}

fn decode_assistant(value: &Value) -> Result<Message, CodecError> {
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut calls = Vec::new();
    if let Some(tool_calls) = value.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let function = call
                .get("function")
                .ok_or_else(|| CodecError::InvalidMessage("tool_call without function".into()))?;
            calls.push(ToolInvocation::new(
                str_field(call, "id")?,
                str_field(function, "name")?,
                str_field(function, "arguments")?,
            ));
        }
    }
    Ok(Message::assistant(content).with_tool_calls(calls))
}

/// Decode OpenAI wire messages back into the internal model. Consecutive
/// `tool` messages merge into a single internal tool message.
pub fn from_wire(values: &[Value]) -> Result<Vec<Message>, CodecError> {
    let mut out: Vec<Message> = Vec::new();
    let mut pending_outcomes: Vec<ToolOutcome> = Vec::new();

    for value in values {
        let role = str_field(value, "role")?;
        if role != "tool" && !pending_outcomes.is_empty() {
            out.push(Message::tool(std::mem::take(&mut pending_outcomes)));
        }
        match role {
            "system" => out.push(Message::system(
                value
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )),
            "user" => out.push(decode_user(value)?),
            "assistant" => out.push(decode_assistant(value)?),
            "tool" => pending_outcomes.push(ToolOutcome::success(
                str_field(value, "tool_call_id")?,
                value
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )),
            other => {
                return Err(CodecError::InvalidMessage(format!(
                    "unknown role: {other}"
                )))
            }
        }
    }
    if !pending_outcomes.is_empty() {
        out.push(Message::tool(pending_outcomes));
    }
    Ok(out)
}
