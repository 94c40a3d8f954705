//! Anthropic-dialect response assembly: SSE event sequence and buffered JSON.
//!
//! Streaming follows the Messages event grammar: one `message_start`, a set
//! of `content_block_start`/`content_block_delta`/`content_block_stop`
//! groups with contiguous indices from 0, one `message_delta` carrying the
//! stop reason and output tokens, one `message_stop`.

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use std::convert::Infallible;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::respond::{ResponseAccumulator, finish_reason, map_stop_reason, split_thinking};
use crate::upstream::{DecodedEvent, EventStreamDecoder};
use crate::utils::ids::generate_message_id;
use kirogate_schema::{AnthropicUsage, ContentBlock, MessagesResponse, ToolCall};

const SSE_CHANNEL_CAPACITY: usize = 64;
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

fn sse_event(name: &str, data: Value) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(&data).unwrap_or_default())
}

fn message_start_event(id: &str, model: &str, input_tokens: u32) -> Event {
    sse_event(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 0},
            }
        }),
    )
}

/// Per-request block sequencing state. Indices must be contiguous from 0
/// and every opened block must close at the same index.
struct BlockWriter {
    tx: mpsc::Sender<Event>,
    next_index: u32,
    open_index: Option<u32>,
}

impl BlockWriter {
    fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            next_index: 0,
            open_index: None,
        }
    }

    async fn send(&self, event: Event) -> Result<(), ()> {
        self.tx.send(event).await.map_err(|_| ())
    }

    async fn open(&mut self, content_block: Value) -> Result<u32, ()> {
        let index = self.next_index;
        self.next_index += 1;
        self.open_index = Some(index);
        self.send(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block,
            }),
        ))
        .await?;
        Ok(index)
    }

    async fn delta(&self, index: u32, delta: Value) -> Result<(), ()> {
        self.send(sse_event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": delta,
            }),
        ))
        .await
    }

    async fn close(&mut self) -> Result<(), ()> {
        if let Some(index) = self.open_index.take() {
            self.send(sse_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ))
            .await?;
        }
        Ok(())
    }
}

/// Routes streamed text into thinking/text blocks.
///
/// With thinking enabled the first bytes are buffered just long enough to
/// decide whether the reply opens with a `<thinking>` section; that section
/// is emitted as one `thinking_delta` once its closing tag arrives.
enum TextRoute {
    Undecided(String),
    BufferingThinking(String),
    Streaming(Option<u32>),
}

impl TextRoute {
    fn new(thinking_enabled: bool) -> Self {
        if thinking_enabled {
            TextRoute::Undecided(String::new())
        } else {
            TextRoute::Streaming(None)
        }
    }

    async fn push(&mut self, writer: &mut BlockWriter, text: &str) -> Result<(), ()> {
        match self {
            TextRoute::Undecided(buffer) => {
                buffer.push_str(text);
                let trimmed = buffer.trim_start();
                if trimmed.starts_with(THINKING_OPEN) {
                    let buffered = std::mem::take(buffer);
                    *self = TextRoute::BufferingThinking(buffered);
                    self.drain_thinking(writer).await
                } else if !THINKING_OPEN.starts_with(trimmed) {
                    // Diverged from the opening tag: plain text after all.
                    let buffered = std::mem::take(buffer);
                    *self = TextRoute::Streaming(None);
                    self.emit_text(writer, &buffered).await
                } else {
                    Ok(())
                }
            }
            TextRoute::BufferingThinking(buffer) => {
                buffer.push_str(text);
                self.drain_thinking(writer).await
            }
            TextRoute::Streaming(_) => self.emit_text(writer, text).await,
        }
    }

    async fn drain_thinking(&mut self, writer: &mut BlockWriter) -> Result<(), ()> {
        let TextRoute::BufferingThinking(buffer) = self else {
            return Ok(());
        };
        if !buffer.contains(THINKING_CLOSE) {
            return Ok(());
        }
        let (thinking, remainder) = split_thinking(buffer);
        *self = TextRoute::Streaming(None);

        if let Some(thinking) = thinking {
            let index = writer
                .open(json!({"type": "thinking", "thinking": ""}))
                .await?;
            writer
                .delta(index, json!({"type": "thinking_delta", "thinking": thinking}))
                .await?;
            writer.close().await?;
        }
        if !remainder.is_empty() {
            self.emit_text(writer, &remainder).await?;
        }
        Ok(())
    }

    async fn emit_text(&mut self, writer: &mut BlockWriter, text: &str) -> Result<(), ()> {
        if text.is_empty() {
            return Ok(());
        }
        let index = match self {
            TextRoute::Streaming(Some(index)) => *index,
            _ => {
                let index = writer.open(json!({"type": "text", "text": ""})).await?;
                *self = TextRoute::Streaming(Some(index));
                index
            }
        };
        writer
            .delta(index, json!({"type": "text_delta", "text": text}))
            .await
    }

    /// Flush whatever is still buffered at end of stream as plain text.
    async fn finish(&mut self, writer: &mut BlockWriter) -> Result<(), ()> {
        match std::mem::replace(self, TextRoute::Streaming(None)) {
            TextRoute::Undecided(buffer) | TextRoute::BufferingThinking(buffer) => {
                if buffer.is_empty() {
                    Ok(())
                } else {
                    self.emit_text(writer, &buffer).await
                }
            }
            streaming @ TextRoute::Streaming(_) => {
                *self = streaming;
                Ok(())
            }
        }
    }
}

async fn emit_tool_use_blocks(writer: &mut BlockWriter, tool_calls: &[ToolCall]) -> Result<(), ()> {
    for tc in tool_calls {
        let index = writer
            .open(json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.function.name,
                "input": {},
            }))
            .await?;
        if tc.function.arguments != "{}" {
            writer
                .delta(
                    index,
                    json!({"type": "input_json_delta", "partial_json": tc.function.arguments}),
                )
                .await?;
        }
        writer.close().await?;
    }
    Ok(())
}

/// Stream an upstream response as the Anthropic Messages event sequence.
pub fn build_stream_response(
    upstream: reqwest::Response,
    model: String,
    input_tokens: u32,
    thinking_enabled: bool,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Event>(SSE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let id = generate_message_id();
        let mut decoder = EventStreamDecoder::new();
        let mut acc = ResponseAccumulator::default();
        let mut upstream = upstream;

        if tx
            .send(message_start_event(&id, &model, input_tokens))
            .await
            .is_err()
        {
            debug!("Client disconnected before message_start");
            return;
        }

        let mut writer = BlockWriter::new(tx.clone());
        let mut route = TextRoute::new(thinking_enabled);

        loop {
            match upstream.chunk().await {
                Ok(Some(bytes)) => {
                    for event in decoder.feed(&bytes) {
                        acc.observe(&event);
                        if let DecodedEvent::Content(content) = event {
                            if route.push(&mut writer, &content).await.is_err() {
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

        if route.finish(&mut writer).await.is_err() {
            return;
        }
        if writer.close().await.is_err() {
            return;
        }

        let tool_calls = acc.collect_tool_calls(decoder.take_tool_calls());
        if emit_tool_use_blocks(&mut writer, &tool_calls).await.is_err() {
            return;
        }

        let finish = finish_reason(!tool_calls.is_empty(), acc.hit_length_cap());
        let output_tokens = acc.output_tokens(&tool_calls);
        let delta = sse_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": map_stop_reason(finish), "stop_sequence": null},
                "usage": {"output_tokens": output_tokens},
            }),
        );
        if tx.send(delta).await.is_err() {
            return;
        }
        let _ = tx
            .send(sse_event("message_stop", json!({"type": "message_stop"})))
            .await;
    });

    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).keep_alive(KeepAlive::default())
}

/// Assemble the buffered (non-streaming) Messages envelope.
pub fn build_json_response(
    body: &[u8],
    model: &str,
    input_tokens: u32,
    thinking_enabled: bool,
) -> Result<MessagesResponse, GatewayError> {
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

    let mut content: Vec<ContentBlock> = Vec::new();
    let text = if thinking_enabled {
        let (thinking, remainder) = split_thinking(&acc.text);
        if let Some(thinking) = thinking {
            content.push(ContentBlock::Thinking {
                thinking,
                signature: None,
            });
        }
        remainder
    } else {
        acc.text.clone()
    };
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    for tc in &tool_calls {
        content.push(ContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.function.name.clone(),
            input: serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| json!({})),
        });
    }

    let finish = finish_reason(!tool_calls.is_empty(), acc.hit_length_cap());
    let output_tokens = acc.output_tokens(&tool_calls);

    Ok(MessagesResponse {
        id: generate_message_id(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(map_stop_reason(finish).to_string()),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens,
            output_tokens,
        },
    })
}
