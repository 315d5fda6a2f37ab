//! Async WebSocket client/server engine for the Tokio stack.
//!
//! This library implements the core of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! over plain TCP or TLS: the HTTP upgrade handshake on both sides, an
//! incremental frame codec that handles masking and fragmentation, the
//! close/ping/pong control semantics, and the `permessage-deflate`
//! compression extension from
//! [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! Applications interact with it through two entry points: [`WSServer`]
//! accepts connections and hands out shared [`WSConnection`] handles through
//! registered callbacks, [`WSClient`] dials a `ws://` or `wss://` URL and
//! does the same for the client side. Each connection is driven by its own
//! tokio task; callbacks for a single connection fire in arrival order and
//! `on_close` fires exactly once, last.

mod assembler;
mod codec;
mod compression;
mod extensions;
mod handshake;
mod stream;
mod write;

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod request;
pub mod server;

pub use client::WSClient;
pub use config::{ClientConfig, Options, ServerConfig, WebSocketConfig};
pub use connection::{ConnectionState, WSConnection};
pub use error::Error;
pub use message::Message;
pub use request::HttpRequest;
pub use server::WSServer;
