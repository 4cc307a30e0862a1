//! Writes [`WireEvent`]s to one client as server-sent events.

use crate::translator::WireEvent;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("client disconnected")]
    Disconnected,
    #[error("failed to serialize {kind} event: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream already ended")]
    Closed,
}

/// One frame per event, handed to the transport as soon as it is written.
pub fn encode_frame(event: &WireEvent) -> Result<Bytes, EmitError> {
    let json = serde_json::to_string(event).map_err(|source| EmitError::Serialization {
        kind: event.kind(),
        source,
    })?;
    Ok(Bytes::from(format!("event: {}\ndata: {json}\n\n", event.kind())))
}

/// Sending half of a client stream. Events go out in call order.
#[derive(Debug)]
pub struct StreamEmitter {
    tx: mpsc::Sender<Bytes>,
    emitted: usize,
    ended: bool,
}

pub fn channel(buffer: usize) -> (StreamEmitter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        StreamEmitter {
            tx,
            emitted: 0,
            ended: false,
        },
        rx,
    )
}

impl StreamEmitter {
    pub async fn emit(&mut self, event: &WireEvent) -> Result<(), EmitError> {
        if self.ended {
            return Err(EmitError::Closed);
        }
        let frame = encode_frame(event)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| EmitError::Disconnected)?;
        self.emitted += 1;
        if matches!(event, WireEvent::StreamEnd {}) {
            self.ended = true;
        }
        tracing::trace!(kind = event.kind(), seq = self.emitted, "event emitted");
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Resolves once the client side has gone away.
    pub async fn disconnected(&self) {
        self.tx.closed().await
    }
}

pub fn sse_body_stream(
    rx: mpsc::Receiver<Bytes>,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures_util::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok(chunk), rx))
    })
}

pub fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (headers, Body::from_stream(sse_body_stream(rx))).into_response()
}
