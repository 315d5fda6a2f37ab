use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

/// Behavior toggles for a server.
#[derive(Debug, Clone)]
pub struct Options {
    /// Accept `permessage-deflate` when the client offers it.
    pub deflate: bool,
    /// Reply to ping frames with a pong carrying the same payload. When
    /// disabled, pings are dropped on the floor.
    pub ping_pong: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            deflate: false,
            ping_pong: true,
        }
    }
}

/// Frame and message size limits shared by both roles.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Also caps the connection's input buffer: a peer can never force more
    /// than one maximum-size frame to be buffered.
    pub max_frame_size: usize,
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
        }
    }
}

#[derive(Clone, Default)]
pub struct ServerConfig {
    pub options: Options,
    pub web_socket_config: WebSocketConfig,
    /// When set, accepted sockets are wrapped in a TLS session first.
    pub tls_config: Option<Arc<RustlsConfig>>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Offer `permessage-deflate` in the upgrade request.
    pub offer_deflate: bool,
    pub ping_pong: bool,
    pub web_socket_config: WebSocketConfig,
    /// Bounds the whole dial: TCP connect, TLS setup and websocket handshake.
    pub handshake_timeout: Duration,
    /// Extra headers appended to the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    /// PEM file with additional trusted roots for `wss` connections, on top
    /// of the bundled webpki roots.
    pub ca_file: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            offer_deflate: false,
            ping_pong: true,
            web_socket_config: WebSocketConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            extra_headers: Vec::new(),
            ca_file: None,
        }
    }
}
