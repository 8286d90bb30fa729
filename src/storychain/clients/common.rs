//! Wire types and server-sent-event decoding shared by OpenAI-compatible clients.

use crate::storychain::client_wrapper::{
    GenerationParameters, Message, MessageChunk, MessageChunkStream, SendError,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// Error raised while reading or decoding a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError(pub String);

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for StreamError {}

/// One message in a chat completions request body.
#[derive(Debug, Serialize, PartialEq)]
pub struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

/// Body of a streaming `/v1/chat/completions` request.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub fn streaming(messages: &'a [Message], parameters: &'a GenerationParameters) -> Self {
        ChatRequest {
            model: &parameters.model,
            messages: messages
                .iter()
                .map(|msg| WireMessage {
                    role: msg.role.as_str(),
                    content: &msg.content,
                })
                .collect(),
            max_tokens: parameters.max_tokens,
            temperature: parameters.temperature,
            top_p: parameters.top_p,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode the JSON payload of one `data:` event into a [`MessageChunk`].
pub fn parse_chunk(data: &str) -> Result<MessageChunk, StreamError> {
    let body: ChunkBody = serde_json::from_str(data)
        .map_err(|err| StreamError(format!("Malformed stream chunk: {}", err)))?;
    let choice = body.choices.into_iter().next();
    Ok(match choice {
        Some(choice) => MessageChunk {
            content: choice.delta.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        },
        None => MessageChunk {
            content: String::new(),
            finish_reason: None,
        },
    })
}

/// A decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental line decoder for `text/event-stream` bodies.
///
/// Bytes are buffered until a full line is available, so multi-byte characters and events
/// split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else if data.is_empty() {
        None
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<MessageChunk, SendError>>,
    done: bool,
}

impl<S> SseState<S> {
    fn queue(&mut self, event: SseEvent) {
        match event {
            SseEvent::Data(data) => self
                .pending
                .push_back(parse_chunk(&data).map_err(|err| Box::new(err) as SendError)),
            SseEvent::Done => self.done = true,
        }
    }
}

/// Turn a raw byte stream of server-sent events into a [`MessageChunkStream`].
///
/// The stream ends at the `[DONE]` sentinel or when the body ends. A transport error is
/// yielded once as an `Err` item and ends the stream.
pub fn chunk_stream<S, B, E>(bytes: S) -> MessageChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    for event in state.decoder.push(bytes.as_ref()) {
                        state.queue(event);
                        if state.done {
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    log::error!("storychain::clients::common::chunk_stream(...): {}", err);
                    state.done = true;
                    state.pending.push_back(Err(Box::new(StreamError(format!(
                        "Stream error: {}",
                        err
                    )))));
                }
                None => {
                    if let Some(event) = state.decoder.finish() {
                        state.queue(event);
                    }
                    state.done = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storychain::client_wrapper::Role;

    fn data(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}},\"finish_reason\":null}}]}}\n\n",
            serde_json::to_string(content).unwrap()
        )
    }

    #[test]
    fn test_request_body_matches_chat_completions_format() {
        let messages = vec![
            Message::with_role(Role::System, "be brief"),
            Message::with_role(Role::User, "hi"),
        ];
        let parameters = GenerationParameters::new("gpt-4", 256)
            .with_temperature(0.5)
            .with_top_p(0.25);
        let body = serde_json::to_value(ChatRequest::streaming(&messages, &parameters)).unwrap();

        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["top_p"], 0.25);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_parse_chunk_reads_delta_and_finish_reason() {
        let chunk =
            parse_chunk(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(chunk.content, "Hel");
        assert_eq!(chunk.finish_reason, None);

        let last = parse_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));

        assert!(parse_chunk("not json").is_err());
    }

    #[test]
    fn test_decoder_handles_split_lines_and_multibyte_text() {
        let mut decoder = SseDecoder::new();
        let frame = data("café");
        let bytes = frame.as_bytes();
        let split = frame.find('é').unwrap() + 1;

        assert!(decoder.push(&bytes[..split]).is_empty());
        let events = decoder.push(&bytes[split..]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Data(json) => assert_eq!(parse_chunk(json).unwrap().content, "café"),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(decoder.push(b": keep-alive\n\ndata: [DONE]\n\n"), vec![SseEvent::Done]);
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_at_done() {
        let body = format!("{}{}data: [DONE]\n\n{}", data("Hel"), data("lo"), data("ignored"));
        let bytes = stream::iter(vec![Ok::<_, StreamError>(body.into_bytes())]);

        let chunks: Vec<String> = chunk_stream(bytes)
            .map(|chunk| chunk.unwrap().content)
            .collect()
            .await;
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_chunk_stream_surfaces_transport_errors() {
        let bytes = stream::iter(vec![
            Ok(data("partial").into_bytes()),
            Err(StreamError("connection reset".into())),
        ]);

        let items: Vec<Result<MessageChunk, SendError>> = chunk_stream(bytes).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().content, "partial");
        let err = items[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
