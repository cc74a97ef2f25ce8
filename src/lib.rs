//! # sse-relay
//!
//! Transport-agnostic Server-Sent Events engine: sessions, channels, and
//! broadcast fan-out.
//!
//! The crate never opens a listening socket. The surrounding transport layer
//! supplies either a raw connection (classic request/response pairs, hyper
//! upgrades) or receives back a streaming [`axum::response::Response`]
//! to hand to its own serving stack; everything above that — wire framing,
//! keep-alive, lifecycle, broadcast — lives here.
//!
//! ## Architecture
//!
//! ```text
//! HTTP clients (EventSource)
//!     │
//!     ├── Channel (channel/)      broadcast registry, auto-removal
//!     ├── Session (session/)      protocol engine, lifecycle, relays
//!     ├── Connection (connection/) transport capability set
//!     │
//!     └── protocol (protocol/)    wire framing + parsing
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use axum::extract::Request;
//! use axum::response::Response;
//! use sse_relay::{ConnectionOptions, Session, SessionOptions, SseError, SseEvent};
//!
//! async fn events(request: Request) -> Result<Response, SseError> {
//!     let (parts, _body) = request.into_parts();
//!     let (session, response) = Session::from_request(
//!         &parts,
//!         serde_json::json!({}),
//!         ConnectionOptions::default(),
//!         SessionOptions::default(),
//!     )
//!     .await?;
//!
//!     tokio::spawn(async move {
//!         if session.connected().await.is_ok() {
//!             let _ = session.push(SseEvent::named("greeting").data("hello")).await;
//!         }
//!     });
//!
//!     Ok(response)
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;

pub use channel::{BroadcastOptions, Channel};
pub use connection::{Connection, ConnectionOptions};
pub use error::SseError;
pub use protocol::{EventData, ParsedEvent, SseEvent};
pub use session::{Session, SessionId, SessionOptions, SessionStatus};
