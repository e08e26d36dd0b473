//! Server-Sent Events parsing for provider streams
//!
//! Providers frame streamed completions as SSE: lines split on `\n`, events
//! delimited by a blank line, `data:` prefixes stripped, with a `[DONE]`
//! sentinel on OpenAI-compatible endpoints. The parser here is incremental;
//! partial events are buffered across network chunks. Provider-specific
//! event decoding lives with each adapter.

use futures::{Stream, StreamExt};
use tracing::{debug, error};

use crate::error::{RouterError, RouterResult};

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// True for the OpenAI-compatible terminal sentinel
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser holding partial event data between chunks
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by this chunk
    pub fn push(&mut self, chunk: &[u8]) -> RouterResult<Vec<SseEvent>> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| RouterError::UpstreamPermanent(format!("invalid UTF-8 in SSE stream: {}", e)))?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if block.trim().is_empty() {
                continue;
            }
            events.push(Self::parse_block(&block));
        }
        Ok(events)
    }

    fn parse_block(block: &str) -> SseEvent {
        let mut event_type = None;
        let mut id = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.find(':') {
                Some(pos) => (&line[..pos], line[pos + 1..].trim_start()),
                None => (line, ""),
            };
            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => data_lines.push(value.to_string()),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        SseEvent {
            event_type,
            data: data_lines.join("\n"),
            id,
        }
    }

    /// Whether a partial event is still buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.trim().is_empty()
    }
}

/// Convert a reqwest response body into a stream of SSE events
pub fn sse_event_stream(
    response: reqwest::Response,
) -> impl Stream<Item = RouterResult<SseEvent>> + Send + Unpin {
    let mut parser = SseParser::new();
    let byte_stream = response.bytes_stream();

    Box::pin(
        byte_stream
            .map(move |chunk_result| match chunk_result {
                Ok(chunk) => parser.push(&chunk),
                Err(e) => Err(RouterError::UpstreamTransient(e.to_string())),
            })
            .flat_map(|result| {
                futures::stream::iter(match result {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => {
                        error!("SSE stream error: {}", e);
                        vec![Err(e)]
                    }
                })
            })
            .inspect(|item| {
                if let Ok(event) = item {
                    debug!(
                        "SSE event: type={:?}, {} bytes",
                        event.event_type,
                        event.data.len()
                    );
                }
            }),
    )
}
