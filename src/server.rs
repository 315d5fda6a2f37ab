use crate::codec::Role;
use crate::compression::Decoder;
use crate::config::{Options, ServerConfig};
use crate::connection::{
    compression_pair, next_connection_id, run_connection, ConnectionState, Handlers, WSConnection,
};
use crate::error::Error;
use crate::extensions;
use crate::handshake;
use crate::message::Message;
use crate::request::{self, HttpRequest};
use crate::stream::WsStream;
use crate::write::Writer;
use bytes::BytesMut;
use futures::future::join_all;
use log::{debug, warn};
use socket2::SockRef;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsStream};

/// A ready to use websockets server.
///
/// Register callbacks for the connection lifecycle, then call `listen` to
/// bind the address and start accepting. Each accepted socket is driven by
/// its own tokio task; the handle itself stays cheap to clone and can keep
/// serving `broadcast` calls from anywhere.
#[derive(Clone)]
pub struct WSServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    addr: String,
    config: ServerConfig,
    handlers: RwLock<Handlers>,
    connections: Mutex<HashMap<u64, Arc<WSConnection>>>,
}

impl WSServer {
    pub fn new(addr: impl Into<String>, options: Options) -> Self {
        Self::with_config(
            addr,
            ServerConfig {
                options,
                ..Default::default()
            },
        )
    }

    pub fn with_config(addr: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                addr: addr.into(),
                config,
                handlers: RwLock::new(Handlers::default()),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Called with the parsed upgrade request of every connection, before
    /// the 101 response goes out.
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_request = Some(Arc::new(handler));
        }
    }

    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(Arc<WSConnection>) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_connect = Some(Arc::new(handler));
        }
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Arc<WSConnection>, Message) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_message = Some(Arc::new(handler));
        }
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_close = Some(Arc::new(handler));
        }
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_error = Some(Arc::new(handler));
        }
    }

    /// Binds the listen address and spawns the accept loop. Returns the
    /// bound address, which is handy when listening on port 0.
    pub async fn listen(&self) -> Result<SocketAddr, Error> {
        let addr: SocketAddr = self
            .inner
            .addr
            .parse()
            .map_err(|_| Error::InvalidAddress)?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        SockRef::from(&socket).set_keepalive(true)?;
        socket.bind(addr)?;

        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;

        let inner = self.inner.clone();
        tokio::spawn(accept_loop(inner, listener));

        Ok(local_addr)
    }

    /// Sends one message to every open connection, returning how many sends
    /// succeeded.
    pub async fn broadcast(&self, message: Message) -> usize {
        let connections: Vec<Arc<WSConnection>> = self
            .inner
            .connections
            .lock()
            .await
            .values()
            .cloned()
            .collect();

        let sends = connections
            .iter()
            .map(|connection| connection.send(message.clone()));
        join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    /// Number of currently open connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                if let Err(err) = configure_client_socket(&stream) {
                    warn!("failed to set socket options for {}: {}", peer, err);
                }
                tokio::spawn(handle_connection(inner.clone(), stream));
            }
            Err(err) => {
                warn!("accept failed: {}", err);
            }
        }
    }
}

fn configure_client_socket(stream: &TcpStream) -> std::io::Result<()> {
    SockRef::from(stream).set_keepalive(true)?;
    stream.set_nodelay(true)
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream) {
    let id = next_connection_id();
    let handlers = inner
        .handlers
        .read()
        .map(|handlers| handlers.clone())
        .unwrap_or_default();

    let ws_stream = match &inner.config.tls_config {
        Some(tls_config) => {
            let acceptor = TlsAcceptor::from(tls_config.clone());
            match acceptor.accept(stream).await {
                Ok(tls_stream) => WsStream::Secure(Box::new(TlsStream::Server(tls_stream))),
                Err(err) => {
                    warn!("TLS accept failed: {}", err);
                    handlers.dispatch_error(&err.into());
                    return;
                }
            }
        }
        None => WsStream::Plain(stream),
    };

    let (mut read_half, write_half) = tokio::io::split(ws_stream);
    let writer = Arc::new(Mutex::new(Writer::new(
        write_half,
        Role::Server,
        inner.config.web_socket_config.clone(),
    )));
    let conn = Arc::new(WSConnection::new(id, Role::Server, writer.clone()));

    let mut buffer = BytesMut::with_capacity(8 * 1024);
    match perform_handshake(&inner, &handlers, &conn, &mut read_half, &mut buffer).await {
        Ok(decoder) => {
            inner.connections.lock().await.insert(id, conn.clone());
            handlers.dispatch_connect(conn.clone());
            run_connection(
                conn,
                read_half,
                buffer,
                decoder,
                handlers,
                inner.config.options.ping_pong,
                inner.config.web_socket_config.clone(),
            )
            .await;
            inner.connections.lock().await.remove(&id);
        }
        Err(err) => {
            // An invalid upgrade never gets a 101; the transport is simply
            // dropped.
            debug!("handshake failed for connection {}: {}", id, err);
            handlers.dispatch_error(&err);
            conn.set_state(ConnectionState::Closed);
            writer.lock().await.shutdown().await;
            if conn.mark_closed() {
                handlers.dispatch_close(id);
            }
        }
    }
}

/// Runs the server half of the upgrade: reads the request head, validates
/// it, lets the application inspect the request, then sends the 101 and
/// flips the connection to open. Returns the inbound decompressor when
/// permessage-deflate was negotiated.
async fn perform_handshake(
    inner: &Arc<ServerInner>,
    handlers: &Handlers,
    conn: &Arc<WSConnection>,
    read_half: &mut tokio::io::ReadHalf<WsStream>,
    buffer: &mut BytesMut,
) -> Result<Option<Decoder>, Error> {
    let head = handshake::read_head(read_half, buffer).await?;
    let request = request::parse_request(&head)?;
    let key = handshake::validate_upgrade(&request)?;

    let negotiated = extensions::negotiate(
        request.header("sec-websocket-extensions"),
        inner.config.options.deflate,
    );

    conn.set_request(request.clone());
    handlers.dispatch_request(&request);

    let response = handshake::build_accept_response(&key, negotiated.as_ref());
    conn.writer.lock().await.write_raw(response.as_bytes()).await?;

    let decoder = match negotiated {
        Some(extensions) => {
            let (encoder, decoder) = compression_pair(Role::Server, &extensions);
            conn.writer.lock().await.set_encoder(encoder);
            conn.set_deflate(true);
            Some(decoder)
        }
        None => None,
    };

    conn.set_state(ConnectionState::Open);
    Ok(decoder)
}
