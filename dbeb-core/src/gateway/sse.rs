//! Server-sent event plumbing.
//!
//! Every streaming route spawns one producer task that writes [`Frame`]s
//! into a bounded channel; the response body drains the other end. When the
//! client goes away the receiver is dropped and the producer's sink reports
//! closed, so nothing further is emitted.

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const FRAME_BUFFER: usize = 64;

/// One SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// A frame whose data is `value` serialized as JSON.
    pub fn json(event: impl Into<String>, value: &impl Serialize) -> Self {
        let data = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        Self::new(event, data)
    }

    pub fn token(text: impl Into<String>) -> Self {
        Self::new("token", text)
    }

    pub fn done() -> Self {
        Self::new("done", "[DONE]")
    }

    /// An error frame under `event`; newlines are flattened to spaces.
    pub fn failure(event: &str, message: &str) -> Self {
        Self::new(event, message.replace(['\r', '\n'], " "))
    }

    /// Wire encoding. Multi-line data becomes one `data:` line per line.
    pub fn to_wire(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Producer half of an SSE stream.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
    sent: Arc<AtomicUsize>,
}

impl FrameSink {
    pub fn channel() -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        (
            Self {
                tx,
                sent: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Send a frame. Returns `false` once the client has gone away.
    pub async fn emit(&self, frame: Frame) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        match self.tx.send(frame).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Resolves once the client has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Frames delivered to the channel so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Wrap a frame receiver into an `text/event-stream` response.
pub fn sse_response(rx: mpsc::Receiver<Frame>) -> Response {
    let stream = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(Event::default().event(frame.event).data(frame.data)));
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Spawn `producer` with a fresh sink and stream what it emits.
pub fn stream_frames<F, Fut>(producer: F) -> Response
where
    F: FnOnce(FrameSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sink, rx) = FrameSink::channel();
    tokio::spawn(producer(sink));
    sse_response(rx)
}

/// Split a raw SSE body into frames. Used by route tests.
#[cfg(test)]
pub(crate) fn parse_frames(body: &str) -> Vec<Frame> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = String::from("message");
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim_start().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            Frame::new(event, data.join("\n"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_format() {
        assert_eq!(Frame::done().to_wire(), "event: done\ndata: [DONE]\n\n");
        assert_eq!(
            Frame::token("a\nb").to_wire(),
            "event: token\ndata: a\ndata: b\n\n"
        );
    }

    #[test]
    fn test_failure_flattens_newlines() {
        let frame = Frame::failure("sse-error", "line one\nline two");
        assert_eq!(frame.data, "line one line two");
        assert_eq!(frame.event, "sse-error");
    }

    #[tokio::test]
    async fn test_sink_stops_after_disconnect() {
        let (sink, mut rx) = FrameSink::channel();
        assert!(sink.emit(Frame::token("hi")).await);
        assert_eq!(rx.recv().await, Some(Frame::token("hi")));

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(Frame::token("lost")).await);
        assert_eq!(sink.sent(), 1);
    }

    #[tokio::test]
    async fn test_response_headers_and_body() {
        let response = stream_frames(|sink| async move {
            sink.emit(Frame::json("status", &serde_json::json!({"status": "starting"})))
                .await;
            sink.emit(Frame::done()).await;
        });
        let headers = response.headers();
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert!(
            headers["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = axum::body::to_bytes(response.into_body(), 10_000).await.unwrap();
        let frames = parse_frames(std::str::from_utf8(&body).unwrap());
        assert_eq!(
            frames,
            vec![
                Frame::new("status", r#"{"status":"starting"}"#),
                Frame::done()
            ]
        );
    }
}
