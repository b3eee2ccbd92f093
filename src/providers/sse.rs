// Server-sent events
//
// All three wire families stream completions as SSE. The parser turns raw
// byte chunks into events; `spawn_stream` drives a backend-specific decoder
// on a background task and forwards universal deltas over a channel.

use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::DeltaStream;
use crate::content::ContentRecord;
use crate::errors::ProviderError;

/// Deltas buffered between the reader task and the consumer
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, when the server names its events
    pub event: Option<String>,
    /// `data:` lines joined with newlines
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE frame parser
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&frame[..end]) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the body ends without a trailing blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn parse_frame(frame: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(frame);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Result of decoding one event
#[derive(Debug, Default)]
pub struct DecodeStep {
    pub deltas: Vec<ContentRecord>,
    /// The backend signalled the end of the response
    pub done: bool,
}

impl DecodeStep {
    pub fn delta(record: ContentRecord) -> Self {
        Self {
            deltas: vec![record],
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            deltas: Vec::new(),
            done: true,
        }
    }
}

/// Backend-specific translation from SSE events to universal deltas
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<DecodeStep, ProviderError>;

    /// Flush buffered state (tool calls, held-back text, usage) at stream end
    fn finish(&mut self) -> Vec<ContentRecord>;
}

/// Read `response` as SSE on a background task
///
/// The task stops silently on cancellation without flushing the decoder, and
/// fails with `StreamTimeout` when no bytes arrive within `idle_timeout`.
pub fn spawn_stream<D>(
    provider: &str,
    response: reqwest::Response,
    mut decoder: D,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> DeltaStream
where
    D: StreamDecoder + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let provider = provider.to_string();

    tokio::spawn(async move {
        let mut body = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();

        'read: loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(provider = %provider, "stream cancelled");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    tracing::warn!(provider = %provider, "stream idle for {:?}", idle_timeout);
                    let _ = tx
                        .send(Err(ProviderError::StreamTimeout {
                            provider: provider.clone(),
                            seconds: idle_timeout.as_secs(),
                        }))
                        .await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = tx
                        .send(Err(ProviderError::Transport {
                            provider: provider.clone(),
                            source: e,
                        }))
                        .await;
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for event in parser.feed(&chunk) {
                match forward(&mut decoder, &event, &tx).await {
                    Forward::Continue => {}
                    Forward::Done => break 'read,
                    Forward::Stop => return,
                }
            }
        }

        if let Some(event) = parser.finish() {
            if let Forward::Stop = forward(&mut decoder, &event, &tx).await {
                return;
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        for delta in decoder.finish() {
            if tx.send(Ok(delta)).await.is_err() {
                return;
            }
        }
        tracing::debug!(provider = %provider, "stream complete");
    });

    rx
}

enum Forward {
    Continue,
    Done,
    Stop,
}

async fn forward<D: StreamDecoder>(
    decoder: &mut D,
    event: &SseEvent,
    tx: &mpsc::Sender<Result<ContentRecord, ProviderError>>,
) -> Forward {
    match decoder.decode(event) {
        Ok(step) => {
            for delta in step.deltas {
                if tx.send(Ok(delta)).await.is_err() {
                    // Receiver dropped
                    return Forward::Stop;
                }
            }
            if step.done {
                Forward::Done
            } else {
                Forward::Continue
            }
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            Forward::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\"").is_empty());
        let events = parser.feed(b":1}\n\ndata: [DONE]\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_named_events_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(
            b"event: content_block_delta\r\ndata: {\"x\":1}\r\n\r\n: keepalive\r\n\r\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_multiline_data_and_trailing_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: one\ndata: two\n\ndata: tail");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");

        let tail = parser.finish().unwrap();
        assert_eq!(tail.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_multibyte_split_is_preserved() {
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut parser = SseParser::new();
        assert!(parser.feed(&bytes[..split]).is_empty());
        let events = parser.feed(&bytes[split..]);
        assert_eq!(events[0].data, "héllo");
    }
}
