//! Incremental responses.
//!
//! The engine reports the full text generated so far on every partial output.
//! [`StreamCursor`] reduces those to deltas, and [`delta_stream`] turns a
//! request's output channel into OpenAI-compatible stream frames:
//!
//! 1. one chunk per non-empty delta, in engine order
//! 2. one terminal chunk with an empty delta and `finish_reason: "stop"`
//! 3. the `[DONE]` sentinel
//!
//! Dropping the stream drops the engine receiver, which stops the producer.

use futures::stream::{self, Stream};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::inference::engine::{EngineError, OutputStream, RequestOutput};
use crate::inference::request_id::RequestId;
use crate::server::error::ErrorBody;

/// Remembers the text already sent for one request.
#[derive(Debug, Default)]
pub struct StreamCursor {
    previous: String,
}

impl StreamCursor {
    /// Record `full_text` and return the part not sent yet, if any.
    pub fn advance(&mut self, full_text: &str) -> Option<String> {
        let delta = full_text
            .get(self.previous.len()..)
            .unwrap_or_default()
            .to_string();
        self.previous.clear();
        self.previous.push_str(full_text);
        (!delta.is_empty()).then_some(delta)
    }

    pub fn sent_len(&self) -> usize {
        self.previous.len()
    }
}

/// Streaming chat completion chunk (OpenAI-compatible).
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Streaming text completion chunk.
#[derive(Debug, Clone, Serialize)]
pub struct TextCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<TextChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextChunkChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamChunk {
    Chat(ChatCompletionChunk),
    Text(TextCompletionChunk),
}

/// Which endpoint the stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Chat,
    Completion,
}

/// Per-request constants stamped on every chunk.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: RequestId,
    pub model: String,
    pub created: u64,
    pub kind: StreamKind,
}

impl StreamContext {
    fn chunk(&self, content: Option<String>, finish_reason: Option<&'static str>) -> StreamChunk {
        let id = self.id.to_string();
        let model = self.model.clone();
        match self.kind {
            StreamKind::Chat => StreamChunk::Chat(ChatCompletionChunk {
                id,
                object: "chat.completion.chunk",
                created: self.created,
                model,
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta { content },
                    finish_reason,
                }],
            }),
            StreamKind::Completion => StreamChunk::Text(TextCompletionChunk {
                id,
                object: "text_completion",
                created: self.created,
                model,
                choices: vec![TextChunkChoice {
                    index: 0,
                    text: content.unwrap_or_default(),
                    finish_reason,
                }],
            }),
        }
    }

    pub fn delta_chunk(&self, delta: String) -> StreamChunk {
        self.chunk(Some(delta), None)
    }

    pub fn stop_chunk(&self) -> StreamChunk {
        self.chunk(None, Some("stop"))
    }
}

/// One SSE frame.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// New content.
    Delta(StreamChunk),
    /// Terminal chunk after the engine finished.
    Stop(StreamChunk),
    /// The engine failed mid-stream.
    Error(ErrorBody),
    /// `[DONE]` sentinel.
    Done,
}

impl StreamFrame {
    /// Payload after `data: `.
    pub fn data(&self) -> String {
        let json = match self {
            StreamFrame::Delta(chunk) | StreamFrame::Stop(chunk) => serde_json::to_string(chunk),
            StreamFrame::Error(body) => serde_json::to_string(body),
            StreamFrame::Done => return "[DONE]".to_string(),
        };
        json.unwrap_or_default()
    }

    /// The frame exactly as written on the wire.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

enum Phase {
    Streaming {
        outputs: ReceiverStream<Result<RequestOutput, EngineError>>,
        cursor: StreamCursor,
    },
    Terminating,
    Finished,
}

/// Convert a request's engine output channel into stream frames.
pub fn delta_stream(outputs: OutputStream, ctx: StreamContext) -> impl Stream<Item = StreamFrame> {
    let start = Phase::Streaming {
        outputs: ReceiverStream::new(outputs),
        cursor: StreamCursor::default(),
    };

    stream::unfold((start, ctx), |(phase, ctx)| async move {
        match phase {
            Phase::Streaming {
                mut outputs,
                mut cursor,
            } => {
                while let Some(item) = outputs.next().await {
                    match item {
                        Ok(output) => {
                            let Some(text) = output.text() else {
                                continue;
                            };
                            if let Some(delta) = cursor.advance(text) {
                                let frame = StreamFrame::Delta(ctx.delta_chunk(delta));
                                return Some((frame, (Phase::Streaming { outputs, cursor }, ctx)));
                            }
                        }
                        Err(err) => {
                            warn!(request_id = %ctx.id, error = %err, "Generation failed mid-stream");
                            let frame = StreamFrame::Error(ErrorBody::new(err.to_string(), "server_error"));
                            return Some((frame, (Phase::Terminating, ctx)));
                        }
                    }
                }

                debug!(request_id = %ctx.id, bytes = cursor.sent_len(), "Stream complete");
                let frame = StreamFrame::Stop(ctx.stop_chunk());
                Some((frame, (Phase::Terminating, ctx)))
            }
            Phase::Terminating => Some((StreamFrame::Done, (Phase::Finished, ctx))),
            Phase::Finished => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_yields_suffixes() {
        let mut cursor = StreamCursor::default();
        assert_eq!(cursor.advance("Hi").as_deref(), Some("Hi"));
        assert_eq!(cursor.advance("Hi there").as_deref(), Some(" there"));
        assert_eq!(cursor.advance("Hi there").as_deref(), None);
        assert_eq!(cursor.advance("Hi there!").as_deref(), Some("!"));
        assert_eq!(cursor.sent_len(), 9);
    }

    #[test]
    fn test_cursor_multibyte_text() {
        let mut cursor = StreamCursor::default();
        assert_eq!(cursor.advance("こん").as_deref(), Some("こん"));
        assert_eq!(cursor.advance("こんにちは").as_deref(), Some("にちは"));
    }

    #[test]
    fn test_frame_wire_format() {
        let ctx = StreamContext {
            id: RequestId::from("chatcmpl-abc"),
            model: "m".into(),
            created: 7,
            kind: StreamKind::Chat,
        };
        assert_eq!(
            StreamFrame::Delta(ctx.delta_chunk("Hi".into())).to_sse(),
            "data: {\"id\":\"chatcmpl-abc\",\"object\":\"chat.completion.chunk\",\"created\":7,\
             \"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\
             \"finish_reason\":null}]}\n\n"
        );
        assert_eq!(
            StreamFrame::Stop(ctx.stop_chunk()).data(),
            "{\"id\":\"chatcmpl-abc\",\"object\":\"chat.completion.chunk\",\"created\":7,\
             \"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}"
        );
        assert_eq!(StreamFrame::Done.to_sse(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_completion_chunks_carry_text() {
        let ctx = StreamContext {
            id: RequestId::from("cmpl-1"),
            model: "m".into(),
            created: 0,
            kind: StreamKind::Completion,
        };
        let value = serde_json::to_value(ctx.stop_chunk()).unwrap();
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["choices"][0]["text"], "");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }
}
