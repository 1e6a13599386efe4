//! Conversion of OpenAI-compatible trace sources into [`DfwEsRecord`]s.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::record::{
    DfwEsRecord, FinishReason, FunctionDetails, RecordMessage, Request, RequestTool, Response,
    ResponseChoice, ResponseMessage, ToolCall,
};
use super::source::{SourceMessage, TraceContainer};
use super::span::{extract_timestamp, extract_usage_info, FUNCTION_NAME, RESPONSE_ID, SUBSPAN_NAME};
use crate::error::{NatError, Result};

/// Maps framework role names onto record roles. Unknown roles become `user`.
pub fn convert_role(role: &str) -> &'static str {
    match role {
        "human" | "user" => "user",
        "ai" | "assistant" => "assistant",
        "system" => "system",
        "tool" => "tool",
        "function" | "chain" => "function",
        _ => "user",
    }
}

fn content_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn required(role: &str, content: Option<String>) -> Result<String> {
    content.ok_or_else(|| {
        NatError::TraceConversion(format!("{role} message content cannot be null"))
    })
}

/// Tool calls in OpenAI wire layout. Entries that are not objects are skipped;
/// arguments that do not parse become `{}`.
pub fn create_tool_calls(raw: &[Value]) -> Vec<ToolCall> {
    raw.iter()
        .filter_map(|call| call.get("function")?.as_object())
        .map(|function| {
            let arguments = match function.get("arguments") {
                Some(Value::Object(args)) => args.clone(),
                Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
                    Ok(Value::Object(args)) => args,
                    Ok(_) => Map::new(),
                    Err(_) => {
                        warn!(arguments = %encoded, "invalid JSON in function arguments");
                        Map::new()
                    }
                },
                _ => Map::new(),
            };
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .unwrap_or("unknown");
            ToolCall::function(name, arguments)
        })
        .collect()
}

fn raw_tool_calls(kwargs: Option<&Map<String, Value>>) -> Vec<ToolCall> {
    kwargs
        .and_then(|kwargs| kwargs.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| create_tool_calls(calls))
        .unwrap_or_default()
}

pub fn convert_message(message: &SourceMessage) -> Result<RecordMessage> {
    let content = match message
        .response_metadata
        .as_ref()
        .filter(|meta| meta.contains_key("content"))
    {
        Some(meta) => content_text(meta.get("content")),
        None => content_text(Some(&message.content)),
    };
    let role = convert_role(message.kind.as_deref().unwrap_or("user"));

    Ok(match role {
        "system" => RecordMessage::System {
            content: required(role, content)?,
        },
        "assistant" => {
            let tool_calls = raw_tool_calls(message.additional_kwargs.as_ref());
            if tool_calls.is_empty() {
                RecordMessage::Assistant {
                    content,
                    tool_calls: None,
                }
            } else {
                RecordMessage::Assistant {
                    content: None,
                    tool_calls: Some(tool_calls),
                }
            }
        }
        "tool" => RecordMessage::Tool {
            content: required(role, content)?,
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
        },
        "function" => RecordMessage::Function { content },
        _ => RecordMessage::User {
            content: required(role, content)?,
        },
    })
}

/// Keeps well-formed function tool schemas and drops the rest with a warning.
pub fn validate_tools(tools_schema: &[Value]) -> Vec<RequestTool> {
    let mut tools = Vec::with_capacity(tools_schema.len());
    for tool in tools_schema {
        let Some(function) = tool.get("function") else {
            warn!(tool = %tool, "tool schema missing 'function' key");
            continue;
        };
        if !function.is_object() {
            warn!(function = %function, "tool function details must be an object");
            continue;
        }
        match serde_json::from_value::<FunctionDetails>(function.clone()) {
            Ok(details) => tools.push(RequestTool {
                kind: "function".into(),
                function: details,
            }),
            Err(err) => warn!(function = %function, error = %err, "tool function missing required fields"),
        }
    }
    tools
}

pub fn convert_chat_response(response: &Value, span_name: &str, index: usize) -> Result<ResponseChoice> {
    let message = response
        .get("message")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            NatError::TraceConversion(format!("chat response missing message for span: '{span_name}'"))
        })?;

    let finish_reason = message
        .get("response_metadata")
        .and_then(|meta| meta.get("finish_reason"))
        .and_then(Value::as_str)
        .and_then(FinishReason::parse);
    let tool_calls = message
        .get("additional_kwargs")
        .and_then(Value::as_object)
        .map(|kwargs| raw_tool_calls(Some(kwargs)))
        .unwrap_or_default();
    let content = if tool_calls.is_empty() {
        content_text(message.get("content"))
    } else {
        None
    };

    Ok(ResponseChoice {
        message: ResponseMessage {
            content,
            role: "assistant".into(),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        },
        finish_reason,
        index,
    })
}

/// Converter for the `openai` and `nim` trace sources.
pub fn convert_openai(container: &TraceContainer) -> Result<DfwEsRecord> {
    let span = &container.span;
    let source = &container.source;

    let messages = source
        .input_value
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>>>()
        .map_err(|err| {
            NatError::TraceConversion(format!("failed to convert message in trace source: {err}"))
        })?;

    let tools = source
        .metadata
        .tools_schema
        .as_deref()
        .map(validate_tools)
        .filter(|tools| !tools.is_empty());
    let model = span
        .attribute_str(SUBSPAN_NAME)
        .unwrap_or_else(|| "unknown".into());

    let choices = source
        .metadata
        .chat_responses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(idx, response)| {
            convert_chat_response(response, &span.name, idx).map_err(|err| {
                NatError::TraceConversion(format!("failed to convert chat response {idx}: {err}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if choices.is_empty() {
        return Err(NatError::TraceConversion(format!(
            "no valid response choices found in span: '{}'. Expected at least one chat response in metadata.",
            span.name
        )));
    }

    let timestamp = extract_timestamp(span);
    let id = span
        .attribute_str(RESPONSE_ID)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("response-{}-{timestamp}", span.name));

    let record = DfwEsRecord {
        request: Request {
            messages,
            model: model.clone(),
            tools,
            temperature: None,
            max_tokens: None,
        },
        response: Response {
            choices,
            id,
            object: "chat.completion".into(),
            created: timestamp,
            model,
            usage: Some(extract_usage_info(span)),
        },
        timestamp,
        workload_id: span
            .attribute_str(FUNCTION_NAME)
            .unwrap_or_else(|| "unknown".into()),
        client_id: source.client_id.clone(),
        error_details: None,
    };
    debug!(span = %span.name, "converted span to DfwEsRecord");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::flywheel::source::{SourceMetadata, TraceSource};
    use crate::flywheel::span::{Span, EVENT_TIMESTAMP};

    fn message(value: Value) -> SourceMessage {
        serde_json::from_value(value).unwrap()
    }

    fn container(messages: Vec<Value>, responses: Vec<Value>, tools: Option<Vec<Value>>) -> TraceContainer {
        TraceContainer {
            kind: "openai".into(),
            source: TraceSource {
                framework: "langchain".into(),
                client_id: "ci".into(),
                input_value: messages.into_iter().map(message).collect(),
                metadata: SourceMetadata {
                    tools_schema: tools,
                    chat_responses: Some(responses),
                },
            },
            span: Span::new("chat_llm")
                .with_attribute(EVENT_TIMESTAMP, 1700000000.25)
                .with_attribute(SUBSPAN_NAME, "meta/llama-3.1-70b-instruct")
                .with_attribute(FUNCTION_NAME, "support_agent")
                .with_attribute("llm.token_count.total", 30),
        }
    }

    #[test]
    fn roles_map_with_user_fallback() {
        assert_eq!(convert_role("human"), "user");
        assert_eq!(convert_role("ai"), "assistant");
        assert_eq!(convert_role("chain"), "function");
        assert_eq!(convert_role("critic"), "user");
    }

    #[test]
    fn converts_full_exchange() {
        let record = convert_openai(&container(
            vec![
                json!({"type": "system", "content": "be brief"}),
                json!({"type": "human", "content": "weather?"}),
                json!({"type": "ai", "content": "", "additional_kwargs": {"tool_calls": [
                    {"function": {"name": "weather", "arguments": "{\"city\": \"Paris\"}"}}
                ]}}),
                json!({"type": "tool", "content": "sunny", "tool_call_id": "call_1"}),
            ],
            vec![json!({"message": {"content": "It is sunny.", "response_metadata": {"finish_reason": "stop"}}})],
            None,
        ))
        .unwrap();

        assert_eq!(record.request.messages.len(), 4);
        match &record.request.messages[2] {
            RecordMessage::Assistant { content, tool_calls } => {
                assert!(content.is_none());
                let calls = tool_calls.as_ref().unwrap();
                assert_eq!(calls[0].function.name, "weather");
                assert_eq!(calls[0].function.arguments["city"], "Paris");
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(
            record.request.messages[3],
            RecordMessage::Tool {
                content: "sunny".into(),
                tool_call_id: "call_1".into()
            }
        );
        assert_eq!(record.request.model, "meta/llama-3.1-70b-instruct");
        assert_eq!(record.response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(record.response.id, "response-chat_llm-1700000000");
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.workload_id, "support_agent");
        assert_eq!(record.client_id, "ci");
        assert_eq!(record.response.usage.unwrap().token_usage.total_tokens, 30);
    }

    #[test]
    fn response_metadata_content_takes_precedence() {
        let msg = message(json!({"type": "human", "content": "raw", "response_metadata": {"content": "meta"}}));
        assert_eq!(
            convert_message(&msg).unwrap(),
            RecordMessage::User {
                content: "meta".into()
            }
        );
    }

    #[test]
    fn null_user_content_fails_conversion() {
        let err = convert_openai(&container(
            vec![json!({"type": "human", "content": null})],
            vec![json!({"message": {"content": "x"}})],
            None,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("failed to convert message"));
    }

    #[test]
    fn invalid_tool_arguments_become_empty() {
        let calls = create_tool_calls(&[
            json!({"function": {"name": "", "arguments": "{oops"}}),
            json!("not a call"),
        ]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "unknown");
        assert!(calls[0].function.arguments.is_empty());
    }

    #[test]
    fn malformed_tool_schemas_are_dropped() {
        let tools = validate_tools(&[
            json!({"type": "function", "function": {"name": "weather", "description": "d", "parameters": {"type": "object"}}}),
            json!({"type": "function"}),
            json!({"function": "weather"}),
            json!({"function": {"name": "partial"}}),
        ]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "weather");
    }

    #[test]
    fn requires_a_response_choice() {
        let err = convert_openai(&container(vec![json!({"type": "human", "content": "hi"})], vec![], None))
            .unwrap_err();
        assert!(err.to_string().contains("no valid response choices"));

        let err = convert_openai(&container(
            vec![json!({"type": "human", "content": "hi"})],
            vec![json!({"message": {}})],
            None,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("failed to convert chat response 0"));
    }

    #[test]
    fn tool_call_responses_drop_content_and_use_span_response_id() {
        let mut c = container(
            vec![json!({"type": "human", "content": "hi"})],
            vec![json!({"message": {
                "content": "ignored",
                "response_metadata": {"finish_reason": "tool_calls"},
                "additional_kwargs": {"tool_calls": [{"function": {"name": "lookup", "arguments": {"q": 1}}}]}
            }})],
            Some(vec![json!({"function": {"name": "lookup", "description": "d", "parameters": {}}})]),
        );
        c.span = c.span.with_attribute(RESPONSE_ID, "chatcmpl-9");
        let record = convert_openai(&c).unwrap();
        let choice = &record.response.choices[0];
        assert!(choice.message.content.is_none());
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(record.response.id, "chatcmpl-9");
        assert_eq!(record.request.tools.unwrap().len(), 1);
    }
}
