use serde_json::Value;

use crate::error::StreamError;

use super::ChatCompletionChunk;

/// Parse one `data:` payload into a stream chunk.
///
/// The `error` member is checked on the raw JSON object before the chunk
/// shape is applied, so a vendor error is never lost to an unexpected sibling
/// field. Payloads that are not JSON or do not have the chunk shape yield
/// `Ok(None)`.
///
/// # Errors
///
/// Returns [`StreamError::Protocol`] when the payload carries a non-null
/// `error` member.
pub fn parse_chunk_payload(payload: &str) -> Result<Option<ChatCompletionChunk>, StreamError> {
    let mut value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "skipping unparseable stream frame");
            return Ok(None);
        }
    };

    let Value::Object(obj) = &mut value else {
        tracing::debug!("skipping stream frame that is not a JSON object");
        return Ok(None);
    };
    match obj.remove("error") {
        None | Some(Value::Null) => {}
        Some(error) => return Err(protocol_error_from_value(&error)),
    }

    let chunk: ChatCompletionChunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(err) => {
            tracing::debug!(error = %err, "skipping stream frame with unexpected shape");
            return Ok(None);
        }
    };
    if chunk.choices.is_empty() && chunk.usage.is_none() {
        tracing::debug!("skipping stream frame without choices or usage");
        return Ok(None);
    }
    Ok(Some(chunk))
}

/// Build a protocol error from the value of an `error` member.
#[must_use]
pub fn protocol_error_from_value(error: &Value) -> StreamError {
    match error {
        Value::Object(obj) => {
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
                .map_or_else(|| error.to_string(), str::to_owned);
            StreamError::Protocol {
                message,
                code: obj.get("code").and_then(scalar_to_string),
                kind: obj.get("type").and_then(scalar_to_string),
            }
        }
        Value::String(message) => StreamError::Protocol {
            message: message.clone(),
            code: None,
            kind: None,
        },
        other => StreamError::Protocol {
            message: other.to_string(),
            code: None,
            kind: None,
        },
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_chunk() {
        let payload = r#"{"id":"chatcmpl-1","object":"chat.completion.chunk","created":1700000000,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let chunk = parse_chunk_payload(payload).unwrap().unwrap();
        assert_eq!(chunk.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn test_parse_keeps_unknown_delta_fields() {
        let payload = r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#;
        let chunk = parse_chunk_payload(payload).unwrap().unwrap();
        assert_eq!(
            chunk.choices[0].delta.extra.get("reasoning_content"),
            Some(&Value::String("hmm".to_string()))
        );
    }

    #[test]
    fn test_parse_usage_only_chunk() {
        let payload = r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let chunk = parse_chunk_payload(payload).unwrap().unwrap();
        assert_eq!(chunk.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_parse_invalid_json_is_skipped() {
        assert!(parse_chunk_payload("{not json").unwrap().is_none());
        assert!(parse_chunk_payload("\"just a string\"").unwrap().is_none());
        assert!(parse_chunk_payload(r#"{"object":"ping"}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_error_object_escalates() {
        let err = parse_chunk_payload(
            r#"{"error":{"message":"rate limited","type":"rate_limit_error","code":429}}"#,
        )
        .unwrap_err();
        match err {
            StreamError::Protocol {
                message,
                code,
                kind,
            } => {
                assert_eq!(message, "rate limited");
                assert_eq!(code.as_deref(), Some("429"));
                assert_eq!(kind.as_deref(), Some("rate_limit_error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_string_escalates() {
        let err = parse_chunk_payload(r#"{"error":"overloaded"}"#).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { ref message, .. } if message == "overloaded"));
    }

    #[test]
    fn test_parse_error_survives_mismatched_siblings() {
        let err = parse_chunk_payload(
            r#"{"error":{"message":"rate limited"},"created":"2024-01-01"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Protocol { ref message, .. } if message == "rate limited"));

        let err = parse_chunk_payload(r#"{"choices":null,"error":{"message":"overloaded","code":"server_error"}}"#)
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol { ref code, .. } if code.as_deref() == Some("server_error")));
    }

    #[test]
    fn test_parse_null_choices_with_usage() {
        let chunk = parse_chunk_payload(r#"{"choices":null,"usage":{"total_tokens":5}}"#)
            .unwrap()
            .unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 5);
        assert!(parse_chunk_payload(r#"{"choices":null}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_mismatched_shape_without_error_is_skipped() {
        assert!(parse_chunk_payload(r#"{"created":"yesterday","choices":[{"delta":{"content":"x"}}]}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_null_error_is_ignored() {
        let chunk = parse_chunk_payload(r#"{"error":null,"choices":[{"delta":{"content":"x"}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.choices.len(), 1);
    }
}
