use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;

use tome_core::errors::ProviderError;
use tome_core::stream::StreamEvent;

pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Turns SSE `data:` payloads into stream events.
pub trait ChunkParser: Send + Unpin + 'static {
    fn parse_data(&mut self, data: &str) -> Vec<StreamEvent>;

    /// Called once when the byte stream ends.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Extract the `data:` payloads from a block of SSE lines. Consecutive data
/// lines within one event are joined with a newline; `[DONE]` markers and
/// comments are dropped.
pub fn parse_sse_lines(chunk: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;

    for line in chunk.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if let Some(data) = current.take() {
                out.push(data);
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if rest == "[DONE]" {
                continue;
            }
            match current.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(rest);
                }
                None => current = Some(rest.to_string()),
            }
        }
    }
    if let Some(data) = current {
        out.push(data);
    }
    out
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits
/// a retryable error and ends.
pub struct SseStream<P: ChunkParser> {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: P,
    buffer: BytesMut,
    pending: VecDeque<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl<P: ChunkParser> SseStream<P> {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        parser: P,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, parser, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        parser: P,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser,
            buffer: BytesMut::with_capacity(8192),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    /// Append raw bytes, dropping carriage returns so `\r\n` framing
    /// splits the same way as `\n`. Multi-byte characters may straddle
    /// chunks; nothing is decoded until its event is complete.
    fn push_bytes(&mut self, bytes: Bytes) {
        self.buffer.reserve(bytes.len());
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let chunk = self.buffer.split_to(pos + 2);
            self.parse_block(&chunk);
        }
    }

    fn parse_block(&mut self, block: &[u8]) {
        let text = match std::str::from_utf8(block) {
            Ok(text) => std::borrow::Cow::Borrowed(text),
            Err(e) => {
                tracing::warn!(error = %e, "invalid UTF-8 in SSE event");
                String::from_utf8_lossy(block)
            }
        };
        for data in parse_sse_lines(&text) {
            let events = self.parser.parse_data(&data);
            self.pending.extend(events);
        }
    }

    fn fail(&mut self, error: ProviderError) -> Poll<Option<StreamEvent>> {
        self.finished = true;
        self.pending.clear();
        Poll::Ready(Some(StreamEvent::Error { error }))
    }
}

impl<P: ChunkParser> Stream for SseStream<P> {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(event) = this.pending.pop_front() {
            if event.is_terminal() {
                this.finished = true;
                this.pending.clear();
            }
            return Poll::Ready(Some(event));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);

                    this.push_bytes(bytes);
                    this.drain_complete_events();

                    if let Some(event) = this.pending.pop_front() {
                        if event.is_terminal() {
                            this.finished = true;
                            this.pending.clear();
                        }
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return this.fail(ProviderError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    let remaining = this.buffer.split();
                    this.parse_block(&remaining);
                    let tail = this.parser.finish();
                    this.pending.extend(tail);
                    match this.pending.pop_front() {
                        Some(event) => {
                            if event.is_terminal() {
                                this.finished = true;
                                this.pending.clear();
                            }
                            return Poll::Ready(Some(event));
                        }
                        None => {
                            this.finished = true;
                            return Poll::Ready(None);
                        }
                    }
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = this.idle_duration.as_secs();
                        return this.fail(ProviderError::StreamInterrupted(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// Echo parser: every payload becomes a delta, `end` becomes Done.
    struct Echo {
        finished: bool,
    }

    impl ChunkParser for Echo {
        fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
            if data == "end" {
                self.finished = true;
                return vec![StreamEvent::Done { finish_reason: Some("STOP".into()) }];
            }
            vec![StreamEvent::TextDelta { delta: data.to_string() }]
        }

        fn finish(&mut self) -> Vec<StreamEvent> {
            if self.finished {
                Vec::new()
            } else {
                vec![StreamEvent::Done { finish_reason: None }]
            }
        }
    }

    fn bytes_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))))
    }

    #[test]
    fn parse_lines_extracts_data() {
        let chunk = "data: {\"a\":1}\n\n: keepalive\n\ndata: two\ndata: lines\n\ndata: [DONE]\n\n";
        assert_eq!(
            parse_sse_lines(chunk),
            vec!["{\"a\":1}".to_string(), "two\nlines".to_string()]
        );
    }

    #[test]
    fn parse_lines_handles_missing_trailing_blank() {
        assert_eq!(parse_sse_lines("data: tail"), vec!["tail".to_string()]);
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let stream = SseStream::new(
            bytes_stream(vec!["data: Hel", "\n\ndata: lo\n", "\ndata: end\n\n"]),
            Echo { finished: false },
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "Hel"));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "lo"));
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn finish_called_at_end_of_stream() {
        let stream = SseStream::new(bytes_stream(vec!["data: only\r\n\r\n"]), Echo { finished: false });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "only"));
        assert!(matches!(events[1], StreamEvent::Done { finish_reason: None }));
    }

    #[tokio::test]
    async fn multibyte_text_split_across_chunks() {
        let payload = "data: 第一章\n\ndata: end\n\n".as_bytes();
        // Byte 7 falls inside the three-byte encoding of 第.
        let (head, tail) = payload.split_at(7);
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ];
        let stream = SseStream::new(futures::stream::iter(chunks), Echo { finished: false });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "第一章"));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();
        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            byte_stream,
            Echo { finished: false },
            Duration::from_secs(5),
        ));

        let event = stream.next().await.unwrap();
        match event {
            StreamEvent::Error { error } => {
                assert!(error.is_retryable());
                assert!(error.to_string().contains("idle timeout"));
            }
            other => panic!("expected idle timeout error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
