//! Chat-completion request bodies and response parsing.
//!
//! This module builds the JSON body for one completion request and pulls
//! the assistant's reply back out of the API's response, classifying the
//! API's error surface along the way.

use crate::error::{PoolError, Result};
use serde_json::{json, Value};

/// Build the JSON body for one chat-completion request.
///
/// The system message is included only when `prompt` is non-empty and
/// `max_completion_tokens` only when `max_tokens` is non-zero. Returns
/// `None` when `model` or `text` is empty; the transport then sends a
/// bodyless GET instead (the catalog-fetch path).
pub fn build_chat_body(model: &str, prompt: &str, text: &str, max_tokens: u64) -> Option<Value> {
    if model.is_empty() || text.is_empty() {
        return None;
    }

    let mut messages = Vec::with_capacity(2);
    if !prompt.is_empty() {
        messages.push(json!({"role": "system", "content": prompt}));
    }
    messages.push(json!({"role": "user", "content": text}));

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if max_tokens > 0 {
        body["max_completion_tokens"] = json!(max_tokens);
    }

    Some(body)
}

/// Extract the assistant content from a completion response.
///
/// An `error` object in the body wins over everything else. A success body
/// must carry a non-empty `choices` array whose first entry has a string
/// `message.content`.
pub fn extract_content(body: &Value) -> Result<String> {
    if let Some(error) = body.get("error") {
        return Err(PoolError::Api {
            message: classify_api_error(error),
        });
    }

    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .filter(|choices| !choices.is_empty())
        .ok_or_else(|| parse_failure("missing or empty 'choices' array", body))?;

    let message = choices[0]
        .get("message")
        .filter(|message| message.is_object())
        .ok_or_else(|| parse_failure("'choices[0].message' is not an object", body))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_failure("'choices[0].message.content' is not a string", body))?;

    Ok(content.to_owned())
}

/// Render an API `error` object as `[<type>] <message>`, the type prefix
/// only when the server sent one.
fn classify_api_error(error: &Value) -> String {
    match error.get("message").and_then(Value::as_str) {
        Some(message) => match error.get("type").and_then(Value::as_str) {
            Some(kind) => format!("[{kind}] {message}"),
            None => message.to_owned(),
        },
        None => "API returned an unreadable error object".to_owned(),
    }
}

fn parse_failure(why: &str, body: &Value) -> PoolError {
    PoolError::Api {
        message: format!("Could not parse result: {why} \u{2013} {body}"),
    }
}
