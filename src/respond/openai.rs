//! OpenAI-dialect response assembly: SSE chunk stream and buffered JSON.

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use chrono::Utc;
use std::convert::Infallible;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::respond::{finish_reason, ResponseAccumulator};
use crate::upstream::{DecodedEvent, EventStreamDecoder};
use crate::utils::ids::generate_completion_id;
use kirogate_schema::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta,
    FunctionCallDelta, ResponseMessage, ToolCall, ToolCallDelta, Usage,
};

const CHUNK_OBJECT: &str = "chat.completion.chunk";
const COMPLETION_OBJECT: &str = "chat.completion";
const SSE_CHANNEL_CAPACITY: usize = 64;

fn chunk_event(
    id: &str,
    created: i64,
    model: &str,
    delta: ChunkDelta,
    finish: Option<&str>,
    usage: Option<Usage>,
) -> Event {
    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: CHUNK_OBJECT.to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish.map(str::to_string),
        }],
        usage,
    };
    Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())
}

fn tool_call_delta_events(
    id: &str,
    created: i64,
    model: &str,
    tool_calls: &[ToolCall],
) -> Vec<Event> {
    let mut events = Vec::with_capacity(tool_calls.len() * 2);
    for (index, tc) in tool_calls.iter().enumerate() {
        let index = u32::try_from(index).unwrap_or(u32::MAX);
        events.push(chunk_event(
            id,
            created,
            model,
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(tc.id.clone()),
                    kind: Some(tc.kind.clone()),
                    function: FunctionCallDelta {
                        name: Some(tc.function.name.clone()),
                        arguments: None,
                    },
                }]),
                ..Default::default()
            },
            None,
            None,
        ));
        events.push(chunk_event(
            id,
            created,
            model,
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: None,
                    kind: None,
                    function: FunctionCallDelta {
                        name: None,
                        arguments: Some(tc.function.arguments.clone()),
                    },
                }]),
                ..Default::default()
            },
            None,
            None,
        ));
    }
    events
}

/// Stream an upstream response to the client as OpenAI completion chunks.
///
/// The upstream body is owned by the pump task: a downstream disconnect
/// surfaces as a failed channel send, which drops the body and releases the
/// connection without attempting to resume.
pub fn build_stream_response(
    upstream: reqwest::Response,
    model: String,
    input_tokens: u32,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Event>(SSE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let id = generate_completion_id();
        let created = Utc::now().timestamp();
        let mut decoder = EventStreamDecoder::new();
        let mut acc = ResponseAccumulator::default();
        let mut upstream = upstream;

        let role_chunk = chunk_event(
            &id,
            created,
            &model,
            ChunkDelta {
                role: Some("assistant".to_string()),
                ..Default::default()
            },
            None,
            None,
        );
        if tx.send(role_chunk).await.is_err() {
            debug!("Client disconnected before first chunk");
            return;
        }

        loop {
            match upstream.chunk().await {
                Ok(Some(bytes)) => {
                    for event in decoder.feed(&bytes) {
                        acc.observe(&event);
                        if let DecodedEvent::Content(content) = event {
                            let chunk = chunk_event(
                                &id,
                                created,
                                &model,
                                ChunkDelta {
                                    content: Some(content),
                                    ..Default::default()
                                },
                                None,
                                None,
                            );
                            if tx.send(chunk).await.is_err() {
                                debug!("Client disconnected mid-stream, closing upstream");
                                return;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Upstream stream read error: {e}");
                    break;
                }
            }
        }

        let tool_calls = acc.collect_tool_calls(decoder.take_tool_calls());
        for event in tool_call_delta_events(&id, created, &model, &tool_calls) {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        let finish = finish_reason(!tool_calls.is_empty(), acc.hit_length_cap());
        let completion_tokens = acc.output_tokens(&tool_calls);
        let final_chunk = chunk_event(
            &id,
            created,
            &model,
            ChunkDelta::default(),
            Some(finish),
            Some(Usage {
                prompt_tokens: input_tokens,
                completion_tokens,
                total_tokens: input_tokens + completion_tokens,
            }),
        );
        if tx.send(final_chunk).await.is_err() {
            return;
        }
        let _ = tx.send(Event::default().data("[DONE]")).await;
    });

    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).keep_alive(KeepAlive::default())
}

/// Assemble the buffered (non-streaming) completion from a drained body.
pub fn build_json_response(
    body: &[u8],
    model: &str,
    input_tokens: u32,
) -> Result<ChatCompletionResponse, GatewayError> {
    let mut decoder = EventStreamDecoder::new();
    let mut acc = ResponseAccumulator::default();
    for event in decoder.feed(body) {
        acc.observe(&event);
    }
    let tool_calls = acc.collect_tool_calls(decoder.take_tool_calls());

    if acc.text.is_empty() && tool_calls.is_empty() && !body.is_empty() {
        return Err(GatewayError::ProtocolViolation(format!(
            "no parseable events in upstream response: {:.200}",
            String::from_utf8_lossy(body)
        )));
    }

    let finish = finish_reason(!tool_calls.is_empty(), acc.hit_length_cap());
    let completion_tokens = acc.output_tokens(&tool_calls);

    Ok(ChatCompletionResponse {
        id: generate_completion_id(),
        object: COMPLETION_OBJECT.to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: (!acc.text.is_empty()).then(|| acc.text.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish.to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: input_tokens,
            completion_tokens,
            total_tokens: input_tokens + completion_tokens,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn buffered_response_collects_content_and_finish() {
        let body = br#"{"content":"Hello"}{"content":" world"}"#;
        let resp = build_json_response(body, "claude-sonnet-4-5", 10).unwrap();
        let message = &resp.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Hello world"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert!(usage.completion_tokens > 0);
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }

    #[test]
    fn buffered_response_reports_tool_calls_finish() {
        let body =
            br#"{"name":"get_weather","toolUseId":"t1"}{"input":"{\"city\":\"NYC\"}"}{"stop":true}"#;
        let resp = build_json_response(body, "claude-sonnet-4-5", 5).unwrap();
        let message = &resp.choices[0].message;
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn unparseable_body_is_a_protocol_violation() {
        let err = build_json_response(b"<!doctype html>garbage", "m", 0).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation(_)));
    }

    #[test]
    fn tool_delta_events_split_header_and_arguments() {
        let calls = vec![ToolCall {
            id: "t1".to_string(),
            kind: "function".to_string(),
            function: kirogate_schema::FunctionCall {
                name: "get_weather".to_string(),
                arguments: r#"{"city":"NYC"}"#.to_string(),
            },
        }];
        let events = tool_call_delta_events("chatcmpl-x", 0, "m", &calls);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn chunk_serialization_keeps_openai_shape() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: CHUNK_OBJECT.to_string(),
            created: 123,
            model: "claude-sonnet-4-5".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some("hi".to_string()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        };
        let value: Value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert!(value["choices"][0]["delta"].get("role").is_none());
        assert!(value["choices"][0].get("finish_reason").is_none());
    }
}
