//! Transport capability abstraction for a single SSE response.
//!
//! [`Connection`] unifies two transport shapes behind one capability set:
//! read request metadata, mutate the response head until it is sent, write
//! chunks, detect remote close, and release transport resources.
//!
//! - [`Connection::direct`] owns a raw connection and serializes the
//!   HTTP/1.1 head itself (classic request/response pairs, hyper upgrades).
//!   The read half doubles as the close listener: read EOF or a read error
//!   is the remote close event.
//! - [`Connection::streaming`] produces an [`axum::response::Response`]
//!   (retrieved via [`Connection::take_response`]) whose body is fed through
//!   a channel; the head stays mutable until the response is taken and is
//!   flushed by the serving stack on first pull. HTTP/2 multiplexed serving
//!   rides this same variant.

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::SseError;

/// Default capacity of the chunk channel backing a streaming response body.
const DEFAULT_BUFFER: usize = 64;

/// Options applied at [`Connection`] construction time.
#[derive(Debug, Default)]
pub struct ConnectionOptions {
    /// Host used for URL derivation when the request has no `Host` header.
    pub default_host: Option<String>,
    /// Explicit response status; defaults to `200 OK`.
    pub status: Option<StatusCode>,
    /// Extra response headers overlaid on the protocol defaults.
    pub headers: HeaderMap,
    /// Chunk channel capacity for the streaming variant; `0` selects the
    /// default of 64. Ignored by [`Connection::direct`].
    pub buffer: usize,
}

/// The two transport sinks a connection can write through.
enum Sink {
    /// Write half of a raw connection; the head is serialized here too.
    Direct(Box<dyn AsyncWrite + Send + Unpin>),
    /// Channel feeding a streaming response body.
    Channel(mpsc::Sender<Bytes>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("Sink::Direct"),
            Self::Channel(_) => f.write_str("Sink::Channel"),
        }
    }
}

/// A single SSE transport connection, exclusively owned by its session.
///
/// `closed` flips exactly once, on remote disconnect, transport write
/// failure, or [`Connection::cleanup`]. Writes after that point are silently
/// dropped: disconnect detection is asynchronous, so a write racing a
/// disconnect is a normal condition, not an error.
pub struct Connection {
    url: String,
    method: Method,
    request_headers: HeaderMap,
    status: StatusCode,
    response_headers: HeaderMap,
    head_sent: bool,
    closed_tx: watch::Sender<bool>,
    sink: Option<Sink>,
    body: Option<Body>,
    monitor: Option<JoinHandle<()>>,
    pull_signal: Option<oneshot::Receiver<()>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("status", &self.status)
            .field("head_sent", &self.head_sent)
            .field("closed", &self.closed())
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection over a raw socket-like stream.
    ///
    /// The head is not written until [`Connection::send_head`]. The read
    /// half serves as the close listener: a monitor task drains it, and read
    /// EOF or a read error flips `closed` — an SSE client sends nothing
    /// after its request, so any read completion means the peer is gone.
    /// Write failures flip `closed` as well.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Construction`] if the request carries no `Host`
    /// header and no default host is configured.
    pub fn direct(
        parts: &Parts,
        socket: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        options: ConnectionOptions,
    ) -> Result<Self, SseError> {
        let url = request_url(parts, &options)?;
        let (status, response_headers) = response_head(&options);
        let (closed_tx, _) = watch::channel(false);

        let (mut read_half, write_half) = tokio::io::split(socket);
        let monitor = tokio::spawn({
            let closed_tx = closed_tx.clone();
            async move {
                let mut buf = [0u8; 512];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                closed_tx.send_if_modified(set_closed);
            }
        });

        Ok(Self {
            url,
            method: parts.method.clone(),
            request_headers: parts.headers.clone(),
            status,
            response_headers,
            head_sent: false,
            closed_tx,
            sink: Some(Sink::Direct(Box::new(write_half))),
            body: None,
            monitor: Some(monitor),
            pull_signal: None,
        })
    }

    /// Creates a connection whose output is a streaming [`Response`] for the
    /// caller to hand back to its serving stack.
    ///
    /// The head stays mutable until [`Connection::take_response`] freezes it
    /// into the `Response`; the serving stack flushes it when the body is
    /// first pulled. A monitor task flips `closed` when the consumer drops
    /// the body (remote disconnect).
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Construction`] if the request carries no `Host`
    /// header and no default host is configured.
    pub fn streaming(parts: &Parts, options: ConnectionOptions) -> Result<Self, SseError> {
        let url = request_url(parts, &options)?;
        let (status, response_headers) = response_head(&options);

        let capacity = if options.buffer == 0 {
            DEFAULT_BUFFER
        } else {
            options.buffer
        };
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        let (pulled_tx, pulled_rx) = oneshot::channel();
        let body = Body::from_stream(BodyStream {
            inner: ReceiverStream::new(chunk_rx),
            pulled: Some(pulled_tx),
        });

        let (closed_tx, _) = watch::channel(false);
        let monitor = tokio::spawn({
            let chunk_tx = chunk_tx.clone();
            let closed_tx = closed_tx.clone();
            async move {
                chunk_tx.closed().await;
                closed_tx.send_if_modified(set_closed);
            }
        });

        Ok(Self {
            url,
            method: parts.method.clone(),
            request_headers: parts.headers.clone(),
            status,
            response_headers,
            head_sent: false,
            closed_tx,
            sink: Some(Sink::Channel(chunk_tx)),
            body: Some(body),
            monitor: Some(monitor),
            pull_signal: Some(pulled_rx),
        })
    }

    /// Assembles the streaming [`Response`] from the current head and the
    /// body stream, freezing the head. Yields `Some` exactly once, on
    /// streaming connections only.
    pub fn take_response(&mut self) -> Option<Response> {
        let body = self.body.take()?;
        self.head_sent = true;
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.response_headers.clone();
        Some(response)
    }

    /// Full request URL, derived from the `Host` header (or configured
    /// default) plus the request path and query.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Immutable snapshot of the incoming request headers.
    #[must_use]
    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// Current response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Current response headers.
    #[must_use]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Sets the response status. Ignored once the head has been sent.
    pub fn set_status(&mut self, status: StatusCode) {
        if !self.head_sent {
            self.status = status;
        }
    }

    /// Sets a response header. Ignored once the head has been sent.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.head_sent {
            self.response_headers.insert(name, value);
        }
    }

    /// Returns `true` once the remote peer disconnected or the connection
    /// was locally closed. Never reverts to `false`.
    #[must_use]
    pub fn closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Returns a watch receiver that observes the close transition.
    #[must_use]
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Takes the first-pull signal, present only on streaming connections.
    /// Resolves when the serving stack first polls the response body; errs
    /// if the body is dropped without ever being polled.
    pub(crate) fn take_pull_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.pull_signal.take()
    }

    /// Writes the response head. At most once per connection; later calls
    /// are no-ops, as is any head mutation after the first call.
    ///
    /// Streaming connections carry their head inside the `Response` object
    /// ([`Connection::take_response`]), so only the direct variant serializes
    /// anything here.
    pub async fn send_head(&mut self) {
        if self.head_sent {
            return;
        }
        self.head_sent = true;
        if !matches!(self.sink, Some(Sink::Direct(_))) {
            return;
        }
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        );
        for (name, value) in &self.response_headers {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value.as_bytes()));
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.write(&head).await;
    }

    /// Appends raw text to the open response body.
    ///
    /// Silently dropped once `closed` is true; a transport write failure
    /// marks the connection closed rather than surfacing an error.
    pub async fn send_chunk(&mut self, text: &str) {
        if self.closed() {
            return;
        }
        self.write(text).await;
    }

    /// Releases all transport resources: aborts the close monitor, drops the
    /// sink (ending the body stream or writer), and marks the connection
    /// closed. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
        self.sink = None;
        self.body = None;
        self.pull_signal = None;
        self.closed_tx.send_if_modified(set_closed);
    }

    async fn write(&mut self, text: &str) {
        match &mut self.sink {
            Some(Sink::Direct(writer)) => {
                let result = writer.write_all(text.as_bytes()).await;
                let result = match result {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    tracing::warn!(%err, "transport write failed; marking connection closed");
                    self.closed_tx.send_if_modified(set_closed);
                }
            }
            Some(Sink::Channel(chunk_tx)) => {
                if chunk_tx
                    .send(Bytes::copy_from_slice(text.as_bytes()))
                    .await
                    .is_err()
                {
                    self.closed_tx.send_if_modified(set_closed);
                }
            }
            None => {}
        }
    }
}

/// Flips the close flag, returning whether it actually changed. Used with
/// `watch::Sender::send_if_modified` so the transition fires exactly once.
fn set_closed(closed: &mut bool) -> bool {
    if *closed {
        false
    } else {
        *closed = true;
        true
    }
}

/// Derives the request URL from the `Host` header or the configured default.
fn request_url(parts: &Parts, options: &ConnectionOptions) -> Result<String, SseError> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| options.default_host.clone())
        .ok_or_else(|| {
            SseError::Construction("no Host header and no default host configured".to_string())
        })?;
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    Ok(format!("http://{host}{path}"))
}

/// Seeds the protocol-default response head, then overlays caller options.
fn response_head(options: &ConnectionOptions) -> (StatusCode, HeaderMap) {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Tells nginx-style intermediaries not to buffer the stream.
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    for (name, value) in &options.headers {
        headers.insert(name.clone(), value.clone());
    }
    (options.status.unwrap_or(StatusCode::OK), headers)
}

/// Body stream that signals its first poll, so a session can defer the
/// `Connecting` → `Active` transition until the consumer actually pulls.
struct BodyStream {
    inner: ReceiverStream<Bytes>,
    pulled: Option<oneshot::Sender<()>>,
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(pulled) = this.pulled.take() {
            let _ = pulled.send(());
        }
        Pin::new(&mut this.inner).poll_next(cx).map(|chunk| chunk.map(Ok))
    }
}
