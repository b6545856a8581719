//! Server-sent events decoding.

use futures::{Stream, StreamExt};
use quill_core::error::AiError;

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental decoder. Bytes may be split anywhere, including inside a
/// UTF-8 sequence or a line terminator.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&block))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
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

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Decode a byte stream into SSE events. Stops at the first transport error.
pub fn decode_stream<S, B, E>(source: S) -> impl Stream<Item = Result<SseEvent, AiError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<AiError> + Send,
{
    async_stream::stream! {
        let mut source = Box::pin(source);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(bytes.as_ref()) {
                        yield Ok(event);
                    }
                }
                Err(err) => {
                    yield Err(err.into());
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            yield Ok(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: ping\nda").is_empty());
        let events = decoder.push(b"ta: {}\r\n\r\ndata: a\ndata: b\n\n");

        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("ping".into()),
                    data: "{}".into()
                },
                SseEvent {
                    event: None,
                    data: "a\nb".into()
                },
            ]
        );
    }

    #[test]
    fn test_comments_and_utf8_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b": keep-alive\n\n").is_empty());

        let text = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'
        assert!(decoder.push(&text[..8]).is_empty());
        let events = decoder.push(&text[8..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_trailing_event_is_flushed() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "[DONE]");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn test_decode_stream_stops_on_error() {
        let source = tokio_stream::iter(vec![
            Ok::<_, AiError>(b"data: one\n\n".to_vec()),
            Err(AiError::transient("connection reset")),
            Ok(b"data: two\n\n".to_vec()),
        ]);
        let items: Vec<_> = decode_stream(source).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().data, "one");
        assert!(matches!(items[1], Err(AiError::Transient(_))));
    }
}
