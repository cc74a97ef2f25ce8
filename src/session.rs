//! Single-stream SSE protocol engine.
//!
//! A [`Session`] owns exactly one [`Connection`] and implements the wire
//! protocol on top of it: event framing, keep-alive comments, the retry
//! hint, and last-event-id tracking. Its lifecycle is a small one-way state
//! machine (`Connecting → Active → Disconnected`); once disconnected a
//! session never reconnects — a client reconnection always produces a brand
//! new session.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionOptions};
use crate::error::SseError;
use crate::protocol::{self, EventData, SseEvent};

/// Default keep-alive comment interval.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Unique identifier for a session.
///
/// Wraps a UUID v4. Generated once at session creation and immutable
/// thereafter. Used as the membership key in [`crate::channel::Channel`]
/// and as the broadcast exclusion discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Creates a new random `SessionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `SessionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for SessionId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SessionId> for uuid::Uuid {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Lifecycle status of a session. Transitions are one-way:
/// `Connecting → Active → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The response object exists but its body has not been pulled yet.
    /// Direct connections skip this status.
    Connecting,
    /// The head is on the wire; events can be pushed.
    Active,
    /// Terminal. The connection is closed and all resources released.
    Disconnected,
}

/// Options applied at [`Session`] construction time.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interval between keep-alive comment frames while active.
    /// `None` or a zero duration disables the timer.
    pub keep_alive: Option<Duration>,
    /// Reconnection hint in milliseconds, sent once on activation.
    pub retry: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            retry: None,
        }
    }
}

/// State guarded by the session's inner lock.
struct Inner {
    connection: Connection,
    last_event_id: Option<String>,
    next_auto_id: u64,
    keep_alive: Option<JoinHandle<()>>,
    disconnected: bool,
}

/// One active SSE stream plus its protocol state and lifecycle.
///
/// `S` is the caller-defined per-session state bag: no schema, no runtime
/// validation — type safety, where desired, comes from the generic
/// parameter. Sessions are shared as `Arc<Session<S>>` between application
/// code and [`crate::channel::Channel`]s.
pub struct Session<S = serde_json::Value> {
    id: SessionId,
    options: SessionOptions,
    status_tx: watch::Sender<SessionStatus>,
    inner: Mutex<Inner>,
    state: std::sync::RwLock<S>,
}

// Implemented for any `S` (the state bag is not printed), so the status is
// read straight off the watch channel rather than through the bounded
// accessor surface.
impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &*self.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> Session<S> {
    /// Wraps a connection in a new session.
    ///
    /// Direct connections have their head (and optional retry frame) written
    /// before this returns, and the session is already `Active`. Streaming
    /// connections stay `Connecting` until their response body is first
    /// pulled by the serving stack.
    pub async fn new(mut connection: Connection, state: S, options: SessionOptions) -> Arc<Self> {
        let last_event_id = connection
            .request_headers()
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        // Resume the auto-id counter after a numeric inbound last-event-id so
        // reconnecting clients keep a monotonic id sequence.
        let next_auto_id = last_event_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
            .map_or(0, |id| id.saturating_add(1));
        let pull_signal = connection.take_pull_signal();
        let close_signal = connection.close_signal();
        let (status_tx, _) = watch::channel(SessionStatus::Connecting);

        let session = Arc::new(Self {
            id: SessionId::new(),
            options,
            status_tx,
            inner: Mutex::new(Inner {
                connection,
                last_event_id,
                next_auto_id,
                keep_alive: None,
                disconnected: false,
            }),
            state: std::sync::RwLock::new(state),
        });

        Self::spawn_close_watcher(&session, close_signal);
        match pull_signal {
            None => session.activate().await,
            Some(pulled) => Self::spawn_pull_waiter(&session, pulled),
        }
        session
    }

    /// Builds a session over a raw socket-like stream (classic
    /// request/response transports, hyper upgrades). Read EOF on the stream
    /// counts as remote disconnect, even while the session is idle.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Construction`] if the connection cannot be
    /// derived from the request (see [`Connection::direct`]).
    pub async fn from_socket(
        parts: &Parts,
        socket: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        state: S,
        connection_options: ConnectionOptions,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SseError> {
        let connection = Connection::direct(parts, socket, connection_options)?;
        Ok(Self::new(connection, state, options).await)
    }

    /// Builds a session plus the streaming [`Response`] for the caller to
    /// return from its handler. The session activates when the serving
    /// stack first pulls the response body.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Construction`] if the connection cannot be
    /// derived from the request (see [`Connection::streaming`]).
    pub async fn from_request(
        parts: &Parts,
        state: S,
        connection_options: ConnectionOptions,
        options: SessionOptions,
    ) -> Result<(Arc<Self>, Response), SseError> {
        let mut connection = Connection::streaming(parts, connection_options)?;
        let Some(response) = connection.take_response() else {
            return Err(SseError::Construction(
                "streaming response already taken".to_string(),
            ));
        };
        Ok((Self::new(connection, state, options).await, response))
    }

    /// Session identity.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// `true` only while the session is `Active`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// Returns a watch receiver observing lifecycle transitions. Channels
    /// use this for automatic removal on disconnect.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Waits until the session leaves `Connecting`.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::ConnectionClosed`] if the session disconnected
    /// without ever becoming active.
    pub async fn connected(&self) -> Result<(), SseError> {
        let mut status = self.status_tx.subscribe();
        match status
            .wait_for(|status| *status != SessionStatus::Connecting)
            .await
        {
            Ok(status) if *status == SessionStatus::Active => Ok(()),
            _ => Err(SseError::ConnectionClosed),
        }
    }

    /// The id of the most recently emitted event, seeded from the
    /// `Last-Event-ID` request header when the client reconnects.
    pub async fn last_event_id(&self) -> Option<String> {
        self.inner.lock().await.last_event_id.clone()
    }

    /// Read access to the caller-defined state bag.
    pub fn state(&self) -> impl Deref<Target = S> + '_ {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Write access to the caller-defined state bag.
    pub fn state_mut(&self) -> impl DerefMut<Target = S> + '_ {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pushes one event to the client, returning the id it was emitted
    /// with. Events without an explicit id consume the session's running
    /// counter.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::ConnectionClosed`] if the session is not active;
    /// nothing reaches the wire in that case.
    pub async fn push(&self, event: SseEvent) -> Result<String, SseError> {
        if !self.is_connected() {
            return Err(SseError::ConnectionClosed);
        }
        let mut inner = self.inner.lock().await;
        let id = match event.id {
            Some(id) => id,
            None => {
                let id = inner.next_auto_id.to_string();
                inner.next_auto_id += 1;
                id
            }
        };
        let frame = protocol::format_event(&SseEvent {
            id: Some(id.clone()),
            name: event.name,
            data: event.data,
        });
        inner.last_event_id = Some(id.clone());
        inner.connection.send_chunk(&frame).await;
        Ok(id)
    }

    /// Sends a one-time `retry:` frame instructing the client's
    /// reconnection backoff.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::ConnectionClosed`] if the session is not active.
    pub async fn set_retry(&self, ms: u64) -> Result<(), SseError> {
        if !self.is_connected() {
            return Err(SseError::ConnectionClosed);
        }
        let mut inner = self.inner.lock().await;
        inner.connection.send_chunk(&protocol::retry_frame(ms)).await;
        Ok(())
    }

    /// Relays every item of an async sequence as an event until the source
    /// is exhausted, a push fails, or the session disconnects. Disconnect is
    /// a cancellation point: the source is dropped immediately, even when
    /// not exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::ConnectionClosed`] if the session is not active
    /// when the relay is attached.
    pub async fn iterate<St, T>(&self, source: St) -> Result<(), SseError>
    where
        St: Stream<Item = T>,
        T: Into<EventData>,
    {
        self.relay(source.map(|item| SseEvent::new().data(item))).await
    }

    /// Relays a byte stream, pushing each chunk verbatim as an event.
    /// Cancellation behavior matches [`Session::iterate`].
    ///
    /// # Errors
    ///
    /// Returns [`SseError::ConnectionClosed`] if the session is not active
    /// when the relay is attached.
    pub async fn stream<St>(&self, source: St) -> Result<(), SseError>
    where
        St: Stream<Item = Bytes>,
    {
        self.relay(source.map(|chunk| SseEvent::new().data(chunk))).await
    }

    /// Closes the session from the local side, running the full disconnect
    /// cascade. Idempotent.
    pub async fn close(&self) {
        self.disconnect().await;
    }

    /// The single disconnect handler: every path into `Disconnected` runs
    /// through here exactly once. Cancels the keep-alive timer, releases the
    /// connection, then publishes the terminal status (which stops relays
    /// and triggers channel auto-removal).
    async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.disconnected {
                return;
            }
            inner.disconnected = true;
            if let Some(keep_alive) = inner.keep_alive.take() {
                keep_alive.abort();
            }
            inner.connection.cleanup();
        }
        self.status_tx.send_replace(SessionStatus::Disconnected);
        tracing::debug!(session = %self.id, "session disconnected");
    }

    /// Flushes the head (plus optional retry frame), starts keep-alive, and
    /// publishes `Active`. No-op when the session already disconnected.
    async fn activate(self: &Arc<Self>) {
        let url = {
            let mut inner = self.inner.lock().await;
            if inner.disconnected {
                return;
            }
            inner.connection.send_head().await;
            if let Some(ms) = self.options.retry {
                inner.connection.send_chunk(&protocol::retry_frame(ms)).await;
            }
            if let Some(period) = self.options.keep_alive
                && !period.is_zero()
            {
                inner.keep_alive = Some(self.spawn_keep_alive(period));
            }
            inner.connection.url().to_string()
        };
        self.status_tx.send_replace(SessionStatus::Active);
        tracing::debug!(session = %self.id, %url, "session active");
    }

    async fn relay<St>(&self, source: St) -> Result<(), SseError>
    where
        St: Stream<Item = SseEvent>,
    {
        if !self.is_connected() {
            return Err(SseError::ConnectionClosed);
        }
        let mut status = self.status_tx.subscribe();
        let mut source = pin!(source);
        loop {
            tokio::select! {
                event = source.next() => {
                    match event {
                        Some(event) => {
                            if self.push(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() || *status.borrow() == SessionStatus::Disconnected {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Periodic comment-frame writer. Holds only a weak session handle so a
    /// fully dropped session is not kept alive by its own timer.
    fn spawn_keep_alive(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if !session.is_connected() {
                    break;
                }
                let mut inner = session.inner.lock().await;
                let frame = protocol::comment_frame("");
                inner.connection.send_chunk(&frame).await;
            }
        })
    }

    fn spawn_close_watcher(session: &Arc<Self>, mut close_signal: watch::Receiver<bool>) {
        let weak = Arc::downgrade(session);
        tokio::spawn(async move {
            if close_signal.wait_for(|closed| *closed).await.is_ok()
                && let Some(session) = weak.upgrade()
            {
                session.disconnect().await;
            }
        });
    }

    fn spawn_pull_waiter(session: &Arc<Self>, pulled: oneshot::Receiver<()>) {
        let weak = Arc::downgrade(session);
        tokio::spawn(async move {
            let pulled = pulled.await;
            let Some(session) = weak.upgrade() else { return };
            match pulled {
                Ok(()) => session.activate().await,
                // Body dropped before it was ever pulled.
                Err(_) => session.disconnect().await,
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;
    use tokio_stream::wrappers::ReceiverStream;

    fn make_parts(last_event_id: Option<&str>) -> Parts {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri("/events")
            .header("host", "example.com");
        if let Some(id) = last_event_id {
            builder = builder.header("last-event-id", id);
        }
        let Ok(request) = builder.body(()) else {
            panic!("request build failed");
        };
        request.into_parts().0
    }

    async fn direct_session(
        options: SessionOptions,
        last_event_id: Option<&str>,
    ) -> (Arc<Session>, DuplexStream) {
        let (client, server) = tokio::io::duplex(16_384);
        let result = Session::from_socket(
            &make_parts(last_event_id),
            server,
            json!({}),
            ConnectionOptions::default(),
            options,
        )
        .await;
        let Ok(session) = result else {
            panic!("session construction failed");
        };
        (session, client)
    }

    fn no_keep_alive() -> SessionOptions {
        SessionOptions {
            keep_alive: None,
            ..SessionOptions::default()
        }
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut wire = String::new();
        let _ = client.read_to_string(&mut wire).await;
        wire
    }

    #[tokio::test]
    async fn direct_session_is_active_immediately() {
        let (session, _client) = direct_session(no_keep_alive(), None).await;
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn debug_formats_regardless_of_state_type() {
        // The state bag need not be Debug for the session itself to format.
        struct Opaque;
        let (_client, server) = tokio::io::duplex(1024);
        let result = Session::from_socket(
            &make_parts(None),
            server,
            Opaque,
            ConnectionOptions::default(),
            no_keep_alive(),
        )
        .await;
        let Ok(session) = result else {
            panic!("session construction failed");
        };
        let rendered = format!("{session:?}");
        assert!(rendered.contains("Session"));
        assert!(rendered.contains("Active"));
    }

    #[tokio::test]
    async fn remote_close_disconnects_idle_session() {
        // No keep-alive and no pushes: only the transport's own close event
        // can drive the transition.
        let (session, client) = direct_session(no_keep_alive(), None).await;
        assert!(session.is_connected());

        drop(client);

        let mut status = session.status_changes();
        let disconnected = timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == SessionStatus::Disconnected),
        )
        .await;
        assert!(disconnected.is_ok());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn push_writes_exact_frame() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        let result = session
            .push(SseEvent::named("greeting").id("42").data("hello\nworld"))
            .await;
        assert_eq!(result.ok().as_deref(), Some("42"));
        session.close().await;

        let wire = read_all(&mut client).await;
        assert!(wire.contains("id: 42\nevent: greeting\ndata: hello\ndata: world\n\n"));
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn push_after_close_fails_and_writes_nothing() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        session.close().await;
        assert!(!session.is_connected());

        let result = session.push(SseEvent::new().data("late")).await;
        assert!(matches!(result, Err(SseError::ConnectionClosed)));

        let wire = read_all(&mut client).await;
        assert!(!wire.contains("data:"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _client) = direct_session(no_keep_alive(), None).await;
        session.close().await;
        session.close().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn auto_id_counter_increments() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        let first = session.push(SseEvent::new().data("a")).await;
        let second = session.push(SseEvent::new().data("b")).await;
        assert_eq!(first.ok().as_deref(), Some("0"));
        assert_eq!(second.ok().as_deref(), Some("1"));
        assert_eq!(session.last_event_id().await.as_deref(), Some("1"));
        session.close().await;

        let wire = read_all(&mut client).await;
        assert!(wire.contains("id: 0\ndata: a\n\n"));
        assert!(wire.contains("id: 1\ndata: b\n\n"));
    }

    #[tokio::test]
    async fn auto_id_resumes_after_inbound_last_event_id() {
        let (session, _client) = direct_session(no_keep_alive(), Some("41")).await;
        assert_eq!(session.last_event_id().await.as_deref(), Some("41"));
        let id = session.push(SseEvent::new().data("next")).await;
        assert_eq!(id.ok().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn explicit_id_updates_last_event_id() {
        let (session, _client) = direct_session(no_keep_alive(), None).await;
        let _ = session.push(SseEvent::new().id("custom").data("x")).await;
        assert_eq!(session.last_event_id().await.as_deref(), Some("custom"));
    }

    #[tokio::test]
    async fn retry_option_is_sent_on_activation() {
        let options = SessionOptions {
            keep_alive: None,
            retry: Some(3000),
        };
        let (session, mut client) = direct_session(options, None).await;
        session.close().await;
        let wire = read_all(&mut client).await;
        assert!(wire.contains("retry: 3000\n\n"));
    }

    #[tokio::test]
    async fn set_retry_requires_connected() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        assert!(session.set_retry(500).await.is_ok());
        session.close().await;
        assert!(matches!(
            session.set_retry(500).await,
            Err(SseError::ConnectionClosed)
        ));
        let wire = read_all(&mut client).await;
        assert_eq!(wire.matches("retry: 500").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_emits_one_comment_per_interval() {
        let options = SessionOptions {
            keep_alive: Some(Duration::from_secs(10)),
            retry: None,
        };
        let (session, mut client) = direct_session(options, None).await;

        // Let the keep-alive task start and consume its immediate first tick.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(10)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        session.close().await;
        // No further frames may appear after disconnect.
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let wire = read_all(&mut client).await;
        assert_eq!(wire.matches(":\n\n").count(), 2);
    }

    #[tokio::test]
    async fn zero_keep_alive_disables_the_timer() {
        let options = SessionOptions {
            keep_alive: Some(Duration::ZERO),
            retry: None,
        };
        let (session, mut client) = direct_session(options, None).await;
        session.close().await;
        let wire = read_all(&mut client).await;
        assert!(!wire.contains(":\n\n"));
    }

    #[tokio::test]
    async fn state_bag_is_directly_mutable() {
        let (session, _client) = direct_session(no_keep_alive(), None).await;
        *session.state_mut() = json!({"name": "alice"});
        assert_eq!(session.state().get("name"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn streaming_session_stays_connecting_until_first_pull() {
        let result = Session::from_request(
            &make_parts(None),
            json!({}),
            ConnectionOptions::default(),
            no_keep_alive(),
        )
        .await;
        let Ok((session, response)) = result else {
            panic!("session construction failed");
        };
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(matches!(
            session.push(SseEvent::new().data("early")).await,
            Err(SseError::ConnectionClosed)
        ));

        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut body = response.into_body().into_data_stream();
            while let Some(Ok(chunk)) = body.next().await {
                if chunk_tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        let connected = timeout(Duration::from_secs(1), session.connected()).await;
        assert!(matches!(connected, Ok(Ok(()))));
        assert!(session.is_connected());

        assert!(session.push(SseEvent::new().id("1").data("hi")).await.is_ok());
        let Ok(Some(chunk)) = timeout(Duration::from_secs(1), chunk_rx.recv()).await else {
            panic!("expected a body chunk");
        };
        assert_eq!(chunk.as_ref(), b"id: 1\ndata: hi\n\n");
    }

    #[tokio::test]
    async fn dropping_unpulled_body_disconnects_session() {
        let result = Session::from_request(
            &make_parts(None),
            json!({}),
            ConnectionOptions::default(),
            no_keep_alive(),
        )
        .await;
        let Ok((session, response)) = result else {
            panic!("session construction failed");
        };
        drop(response);

        let mut status = session.status_changes();
        let disconnected = timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == SessionStatus::Disconnected),
        )
        .await;
        assert!(disconnected.is_ok());
        assert!(matches!(session.connected().await, Err(SseError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn iterate_relays_until_source_ends() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        let source = futures_util::stream::iter(vec!["a".to_string(), "b".to_string()]);
        assert!(session.iterate(source).await.is_ok());
        assert!(session.is_connected());
        session.close().await;

        let wire = read_all(&mut client).await;
        assert!(wire.contains("data: a\n\n"));
        assert!(wire.contains("data: b\n\n"));
    }

    #[tokio::test]
    async fn iterate_on_closed_session_fails() {
        let (session, _client) = direct_session(no_keep_alive(), None).await;
        session.close().await;
        let source = futures_util::stream::iter(vec!["a".to_string()]);
        assert!(matches!(
            session.iterate(source).await,
            Err(SseError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn disconnect_cancels_relay_and_releases_source() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        let (item_tx, item_rx) = tokio::sync::mpsc::channel::<String>(8);
        let relay = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.iterate(ReceiverStream::new(item_rx)).await }
        });

        assert!(item_tx.send("one".to_string()).await.is_ok());

        // Wait for the relayed frame to hit the wire.
        let mut wire = String::new();
        let mut buf = [0u8; 1024];
        let observed = timeout(Duration::from_secs(1), async {
            while !wire.contains("data: one") {
                let Ok(read) = client.read(&mut buf).await else {
                    break;
                };
                if read == 0 {
                    break;
                }
                wire.push_str(&String::from_utf8_lossy(buf.get(..read).unwrap_or_default()));
            }
        })
        .await;
        assert!(observed.is_ok());

        session.close().await;

        // The relay halts and drops its source exactly once; the sender then
        // observes the closed receiver.
        let halted = timeout(Duration::from_secs(1), relay).await;
        assert!(matches!(halted, Ok(Ok(Ok(())))));
        let released = timeout(Duration::from_secs(1), item_tx.closed()).await;
        assert!(released.is_ok());
    }

    #[tokio::test]
    async fn stream_relays_byte_chunks_verbatim() {
        let (session, mut client) = direct_session(no_keep_alive(), None).await;
        let source = futures_util::stream::iter(vec![Bytes::from_static(b"chunk-1")]);
        assert!(session.stream(source).await.is_ok());
        session.close().await;

        let wire = read_all(&mut client).await;
        assert!(wire.contains("data: chunk-1\n\n"));
    }
}
