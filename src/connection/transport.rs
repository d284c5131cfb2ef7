//! Push-stream transport.
//!
//! The agent emits one JSON object per line on `GET {base}/events`. Plain
//! newline-delimited JSON and SSE `data:` framing are both accepted.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{ConnectionError, ConnectionResult};

/// Stream of raw message bodies.
pub type MessageStream = Pin<Box<dyn Stream<Item = ConnectionResult<String>> + Send>>;

/// Opens push streams and probes liveness against an agent base URL.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open the event stream. Resolves once the server has accepted it.
    async fn open(&self, base_url: &str) -> ConnectionResult<MessageStream>;

    /// Check the liveness endpoint.
    async fn probe(&self, base_url: &str) -> ConnectionResult<()>;

    /// Whether stream failures are retried by the transport itself.
    fn auto_recovers(&self) -> bool {
        false
    }
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpEventTransport {
    client: Client,
    probe_timeout: Duration,
}

impl HttpEventTransport {
    /// Create a transport; `probe_timeout` bounds each health request.
    pub fn new(probe_timeout: Duration) -> ConnectionResult<Self> {
        // No overall request timeout: the event stream is expected to stay open.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ConnectionError::Http)?;

        Ok(Self {
            client,
            probe_timeout,
        })
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn open(&self, base_url: &str) -> ConnectionResult<MessageStream> {
        let url = format!("{}/events", base_url.trim_end_matches('/'));
        debug!(url = %url, "Requesting event stream");

        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream, application/x-ndjson")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(Box::pin(frame_lines(response.bytes_stream())))
    }

    async fn probe(&self, base_url: &str) -> ConnectionResult<()> {
        let url = format!("{}/health", base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectionError::Timeout {
                        timeout_ms: self.probe_timeout.as_millis() as u64,
                    }
                } else {
                    ConnectionError::Http(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ConnectionError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}

/// Longest accepted line. Longer lines are dropped whole.
const MAX_LINE_BYTES: usize = 1024 * 1024;

struct FramerState {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    /// Skipping the rest of an oversized line.
    discarding: bool,
    done: bool,
}

impl FramerState {
    fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if raw.len() > MAX_LINE_BYTES {
                warn!(len = raw.len(), limit = MAX_LINE_BYTES, "Dropping oversized event line");
                continue;
            }
            self.push_line(&raw);
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            if !self.discarding {
                warn!(limit = MAX_LINE_BYTES, "Dropping oversized event line");
            }
            self.buffer.clear();
            self.discarding = true;
        }
    }

    fn finish(&mut self) {
        let raw = std::mem::take(&mut self.buffer);
        if !std::mem::take(&mut self.discarding) {
            self.push_line(&raw);
        }
    }

    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if let Some(body) = message_body(&line) {
            self.pending.push_back(body.to_string());
        }
    }
}

/// Split a byte stream into message bodies, one per non-empty line.
pub(crate) fn frame_lines<S>(byte_stream: S) -> impl Stream<Item = ConnectionResult<String>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
{
    let state = FramerState {
        inner: Box::pin(byte_stream),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        discarding: false,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(body) = state.pending.pop_front() {
                return Some((Ok(body), state));
            }
            if state.done {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => state.push_chunk(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(ConnectionError::Stream {
                            message: e.to_string(),
                        }),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    state.finish();
                }
            }
        }
    })
}

/// Extract the JSON body from one line, skipping blank lines, SSE comments
/// and SSE fields other than `data`.
pub(crate) fn message_body(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    if let Some(data) = trimmed.strip_prefix("data:") {
        let data = data.trim();
        return (!data.is_empty()).then_some(data);
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| trimmed.starts_with(field))
    {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body_plain_json() {
        assert_eq!(
            message_body("{\"type\":\"heartbeat\"}\n"),
            Some("{\"type\":\"heartbeat\"}")
        );
    }

    #[test]
    fn test_message_body_sse_framing() {
        assert_eq!(
            message_body("data: {\"type\":\"heartbeat\"}"),
            Some("{\"type\":\"heartbeat\"}")
        );
        assert_eq!(message_body("event: message"), None);
        assert_eq!(message_body("id: 42"), None);
        assert_eq!(message_body(": keep-alive"), None);
        assert_eq!(message_body("data:"), None);
        assert_eq!(message_body("   "), None);
    }

    #[tokio::test]
    async fn test_frame_lines_across_chunks() {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"type\":\"heart")),
            Ok(bytes::Bytes::from_static(b"beat\"}\n\ndata: {\"type\":\"alert\"")),
            Ok(bytes::Bytes::from_static(b",\"message\":\"x\"}\n{\"tail\":1}")),
        ];
        let framed: Vec<String> = frame_lines(futures_util::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            framed,
            vec![
                "{\"type\":\"heartbeat\"}".to_string(),
                "{\"type\":\"alert\",\"message\":\"x\"}".to_string(),
                "{\"tail\":1}".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_lines_drops_oversized_line() {
        let mut huge = vec![b'x'; MAX_LINE_BYTES + 10];
        huge.extend_from_slice(b"still the same line\n{\"type\":\"heartbeat\"}\n");
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from(vec![b'y'; MAX_LINE_BYTES])),
            Ok(bytes::Bytes::from_static(b"yy")),
            Ok(bytes::Bytes::from(huge)),
            Ok(bytes::Bytes::from_static(b"{\"tail\":1}")),
        ];
        let framed: Vec<String> = frame_lines(futures_util::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            framed,
            vec!["{\"type\":\"heartbeat\"}".to_string(), "{\"tail\":1}".to_string()]
        );
    }

    #[test]
    fn test_transport_creation() {
        let transport = HttpEventTransport::new(Duration::from_secs(3));
        assert!(transport.is_ok());
        assert!(!transport.unwrap().auto_recovers());
    }
}
